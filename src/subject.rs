//! Subject attribute templates shared by the root CA and leaf certificates.

use std::{collections::BTreeMap, fmt, str::FromStr};

use rcgen::{DistinguishedName, DnType, DnValue, string::Ia5String};
use serde::Deserialize;

use crate::error::{CertError, CertResult};

/// PKCS#9 emailAddress, which rcgen has no named `DnType` for.
const EMAIL_ADDRESS_OID: &[u64] = &[1, 2, 840, 113549, 1, 9, 1];

/// Subject attribute overrides keyed by attribute, as read from config.
pub type SubjectOverrides = BTreeMap<SubjectAttribute, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum SubjectAttribute {
    CommonName,
    CountryName,
    StateOrProvinceName,
    LocalityName,
    OrganizationName,
    OrganizationalUnitName,
    EmailAddress,
}

impl SubjectAttribute {
    pub const ALL: [Self; 7] = [
        Self::CommonName,
        Self::CountryName,
        Self::StateOrProvinceName,
        Self::LocalityName,
        Self::OrganizationName,
        Self::OrganizationalUnitName,
        Self::EmailAddress,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CommonName => "commonName",
            Self::CountryName => "countryName",
            Self::StateOrProvinceName => "stateOrProvinceName",
            Self::LocalityName => "localityName",
            Self::OrganizationName => "organizationName",
            Self::OrganizationalUnitName => "organizationalUnitName",
            Self::EmailAddress => "emailAddress",
        }
    }

    /// Dotted OID string, matching what `x509-parser` reports for the attribute.
    pub fn oid(self) -> &'static str {
        match self {
            Self::CommonName => "2.5.4.3",
            Self::CountryName => "2.5.4.6",
            Self::StateOrProvinceName => "2.5.4.8",
            Self::LocalityName => "2.5.4.7",
            Self::OrganizationName => "2.5.4.10",
            Self::OrganizationalUnitName => "2.5.4.11",
            Self::EmailAddress => "1.2.840.113549.1.9.1",
        }
    }

    fn dn_type(self) -> DnType {
        match self {
            Self::CommonName => DnType::CommonName,
            Self::CountryName => DnType::CountryName,
            Self::StateOrProvinceName => DnType::StateOrProvinceName,
            Self::LocalityName => DnType::LocalityName,
            Self::OrganizationName => DnType::OrganizationName,
            Self::OrganizationalUnitName => DnType::OrganizationalUnitName,
            Self::EmailAddress => DnType::CustomDnType(EMAIL_ADDRESS_OID.to_vec()),
        }
    }

    fn dn_value(self, value: &str) -> CertResult<DnValue> {
        match self {
            Self::EmailAddress => Ia5String::try_from(value)
                .map(DnValue::Ia5String)
                .map_err(|err| {
                    CertError::InvalidConfiguration(format!(
                        "emailAddress `{value}` is not an IA5 string: {err}"
                    ))
                }),
            _ => Ok(DnValue::Utf8String(value.to_owned())),
        }
    }
}

impl fmt::Display for SubjectAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SubjectAttribute {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let attribute = match trimmed {
            "CN" => Self::CommonName,
            "C" => Self::CountryName,
            "ST" => Self::StateOrProvinceName,
            "L" => Self::LocalityName,
            "O" => Self::OrganizationName,
            "OU" => Self::OrganizationalUnitName,
            other => Self::ALL
                .into_iter()
                .find(|attribute| attribute.name().eq_ignore_ascii_case(other))
                .ok_or_else(|| {
                    CertError::InvalidConfiguration(format!(
                        "unknown subject attribute `{trimmed}`"
                    ))
                })?,
        };
        Ok(attribute)
    }
}

impl TryFrom<String> for SubjectAttribute {
    type Error = CertError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Ordered subject attributes. Overrides replace values in place and keep
/// the attribute's original position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectTemplate {
    attributes: Vec<(SubjectAttribute, String)>,
}

impl Default for SubjectTemplate {
    fn default() -> Self {
        Self {
            attributes: vec![
                (SubjectAttribute::CommonName, "Sample Service".to_owned()),
                (SubjectAttribute::CountryName, "US".to_owned()),
                (SubjectAttribute::StateOrProvinceName, "Wisconsin".to_owned()),
                (SubjectAttribute::LocalityName, "Madison".to_owned()),
                (
                    SubjectAttribute::OrganizationName,
                    "University of Wisconsin -- Madison".to_owned(),
                ),
                (
                    SubjectAttribute::OrganizationalUnitName,
                    "Computer Sciences Department".to_owned(),
                ),
                (SubjectAttribute::EmailAddress, "email@sample.com".to_owned()),
            ],
        }
    }
}

impl SubjectTemplate {
    pub fn with_overrides<I, S>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (SubjectAttribute, S)>,
        S: Into<String>,
    {
        for (attribute, value) in overrides {
            self.set(attribute, value);
        }
        self
    }

    pub fn with_common_name(mut self, common_name: impl Into<String>) -> Self {
        self.set(SubjectAttribute::CommonName, common_name);
        self
    }

    pub fn set(&mut self, attribute: SubjectAttribute, value: impl Into<String>) {
        let value = value.into();
        match self
            .attributes
            .iter_mut()
            .find(|(existing, _)| *existing == attribute)
        {
            Some((_, slot)) => *slot = value,
            None => self.attributes.push((attribute, value)),
        }
    }

    pub fn get(&self, attribute: SubjectAttribute) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(existing, _)| *existing == attribute)
            .map(|(_, value)| value.as_str())
    }

    pub fn attributes(&self) -> &[(SubjectAttribute, String)] {
        &self.attributes
    }

    pub fn to_distinguished_name(&self) -> CertResult<DistinguishedName> {
        let mut distinguished_name = DistinguishedName::new();
        for (attribute, value) in &self.attributes {
            distinguished_name.push(attribute.dn_type(), attribute.dn_value(value)?);
        }
        Ok(distinguished_name)
    }
}
