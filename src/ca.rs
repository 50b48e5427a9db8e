//! Root CA and per-hostname leaf certificate issuance.
//!
//! Both issuers are synchronous and CPU bound (RSA-2048 key generation), so
//! async callers should run them on a blocking thread.

use std::{fmt::Write as _, net::IpAddr};

use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber, string::Ia5String,
};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use x509_parser::{certificate::X509Certificate, parse_x509_certificate, pem::parse_x509_pem};

use crate::{
    error::{CertError, CertResult},
    subject::{SubjectAttribute, SubjectOverrides, SubjectTemplate},
};

const VALIDITY_YEARS: i32 = 10;
const ROOT_SERIAL_UPPER_BOUND: u64 = 100_000;
const LEAF_SERIAL_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCa {
    pub private_key_pem: String,
    pub public_key_pem: String,
    pub certificate_pem: String,
}

impl RootCa {
    pub fn signing_material(&self) -> RootCaPem {
        RootCaPem {
            certificate_pem: self.certificate_pem.clone(),
            private_key_pem: self.private_key_pem.clone(),
        }
    }
}

/// The root certificate and key a leaf is signed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCaPem {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    pub hostname: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
    pub certificate_pem: String,
}

/// Extra extensions for the root CA, written after `basicConstraints`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaExtension {
    KeyUsage(Vec<KeyUsagePurpose>),
    ExtendedKeyUsage(Vec<ExtendedKeyUsagePurpose>),
    Custom {
        oid: Vec<u64>,
        critical: bool,
        content: Vec<u8>,
    },
}

impl CaExtension {
    fn apply(&self, params: &mut CertificateParams) {
        match self {
            Self::KeyUsage(usages) => params.key_usages.extend(usages.iter().cloned()),
            Self::ExtendedKeyUsage(purposes) => {
                params.extended_key_usages.extend(purposes.iter().cloned())
            }
            Self::Custom {
                oid,
                critical,
                content,
            } => {
                let mut extension = CustomExtension::from_oid_content(oid, content.clone());
                extension.set_criticality(*critical);
                params.custom_extensions.push(extension);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootCaOptions {
    pub subject: SubjectOverrides,
    pub extensions: Vec<CaExtension>,
    /// Defaults to a random value in `[0, 100000)`.
    pub serial_number: Option<u64>,
}

pub fn generate_root_ca(options: &RootCaOptions) -> CertResult<RootCa> {
    let subject = SubjectTemplate::default().with_overrides(
        options
            .subject
            .iter()
            .map(|(attribute, value)| (*attribute, value.as_str())),
    );
    let serial = options
        .serial_number
        .unwrap_or_else(|| rand::thread_rng().gen_range(0..ROOT_SERIAL_UPPER_BOUND));

    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from(serial));
    set_ten_year_validity(&mut params);
    params.distinguished_name = subject.to_distinguished_name()?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    for extension in &options.extensions {
        extension.apply(&mut params);
    }

    let key_pair = generate_rsa_key_pair()?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|err| CertError::Signing(format!("self-sign root CA certificate: {err}")))?;

    Ok(RootCa {
        private_key_pem: key_pair.serialize_pem(),
        public_key_pem: key_pair.public_key_pem(),
        certificate_pem: cert.pem(),
    })
}

pub fn generate_cert_for_hostname(hostname: &str, root: &RootCaPem) -> CertResult<LeafCertificate> {
    let hostname = hostname.trim();
    if hostname.is_empty() {
        return Err(CertError::InvalidHostname(
            "hostname must not be empty".to_owned(),
        ));
    }

    let ca_key = KeyPair::from_pem(&root.private_key_pem)
        .map_err(|err| CertError::Parse(format!("root CA private key PEM: {err}")))?;
    let ca_public_key = with_certificate(&root.certificate_pem, |certificate| {
        Ok(certificate
            .tbs_certificate
            .subject_pki
            .subject_public_key
            .data
            .to_vec())
    })?;
    if ca_public_key != ca_key.public_key_raw() {
        return Err(CertError::Signing(
            "root CA certificate and private key do not match".to_owned(),
        ));
    }
    let issuer = Issuer::from_ca_cert_pem(&root.certificate_pem, ca_key)
        .map_err(|err| CertError::Parse(format!("root CA issuer metadata: {err}")))?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from_slice(&hostname_serial(hostname)));
    set_ten_year_validity(&mut params);
    params.distinguished_name = SubjectTemplate::default()
        .with_common_name(hostname)
        .to_distinguished_name()?;
    params.subject_alt_names = subject_alt_name(hostname).into_iter().collect();
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let leaf_key = generate_rsa_key_pair()?;
    let cert = params
        .signed_by(&leaf_key, &issuer)
        .map_err(|err| CertError::Signing(format!("sign leaf certificate for `{hostname}`: {err}")))?;

    Ok(LeafCertificate {
        hostname: hostname.to_owned(),
        private_key_pem: leaf_key.serialize_pem(),
        public_key_pem: leaf_key.public_key_pem(),
        certificate_pem: cert.pem(),
    })
}

/// Serial number seed for a leaf: a truncated SHA-256 of the hostname, kept
/// positive so the DER integer needs no sign padding.
pub fn hostname_serial(hostname: &str) -> [u8; LEAF_SERIAL_LEN] {
    let digest = Sha256::digest(hostname.as_bytes());
    let mut serial = [0u8; LEAF_SERIAL_LEN];
    serial.copy_from_slice(&digest[..LEAF_SERIAL_LEN]);
    serial[0] &= 0x7f;
    serial
}

/// Fields read back out of an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    /// `(dotted OID, value)` pairs in certificate order.
    pub subject: Vec<(String, String)>,
    pub issuer: Vec<(String, String)>,
    pub serial_hex: String,
    pub is_ca: bool,
}

impl CertificateSummary {
    pub fn subject_common_name(&self) -> Option<&str> {
        common_name(&self.subject)
    }

    pub fn issuer_common_name(&self) -> Option<&str> {
        common_name(&self.issuer)
    }
}

pub fn describe_certificate(certificate_pem: &str) -> CertResult<CertificateSummary> {
    with_certificate(certificate_pem, |certificate| {
        let is_ca = certificate
            .basic_constraints()
            .map_err(|err| CertError::Parse(format!("basicConstraints extension: {err}")))?
            .is_some_and(|extension| extension.value.ca);
        let mut serial_hex = String::new();
        for byte in certificate.raw_serial() {
            let _ = write!(&mut serial_hex, "{byte:02x}");
        }

        Ok(CertificateSummary {
            subject: name_attributes(certificate.subject())?,
            issuer: name_attributes(certificate.issuer())?,
            serial_hex,
            is_ca,
        })
    })
}

fn with_certificate<T>(
    certificate_pem: &str,
    inspect: impl FnOnce(&X509Certificate<'_>) -> CertResult<T>,
) -> CertResult<T> {
    let (_, pem_block) = parse_x509_pem(certificate_pem.as_bytes())
        .map_err(|err| CertError::Parse(format!("certificate PEM: {err}")))?;
    if pem_block.label != "CERTIFICATE" {
        return Err(CertError::Parse(format!(
            "expected CERTIFICATE block, got {}",
            pem_block.label
        )));
    }
    let (_, certificate) = parse_x509_certificate(&pem_block.contents)
        .map_err(|err| CertError::Parse(format!("certificate DER payload: {err}")))?;
    inspect(&certificate)
}

fn name_attributes(name: &x509_parser::x509::X509Name<'_>) -> CertResult<Vec<(String, String)>> {
    name.iter_attributes()
        .map(|attribute| {
            let value = attribute.as_str().map_err(|err| {
                CertError::Parse(format!(
                    "attribute {} is not a string: {err}",
                    attribute.attr_type()
                ))
            })?;
            Ok((attribute.attr_type().to_id_string(), value.to_owned()))
        })
        .collect()
}

fn common_name(attributes: &[(String, String)]) -> Option<&str> {
    attributes
        .iter()
        .find(|(oid, _)| oid == SubjectAttribute::CommonName.oid())
        .map(|(_, value)| value.as_str())
}

/// IP literals get an `iPAddress` entry, ASCII names a `dNSName`. Names that
/// are not IA5 (unencoded IDNs) keep only the CN.
fn subject_alt_name(hostname: &str) -> Option<SanType> {
    let unbracketed = hostname
        .strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(hostname);
    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return Some(SanType::IpAddress(ip));
    }
    match Ia5String::try_from(hostname) {
        Ok(dns_name) => Some(SanType::DnsName(dns_name)),
        Err(err) => {
            tracing::debug!(%hostname, "leaf issued without subjectAltName: {err}");
            None
        }
    }
}

fn set_ten_year_validity(params: &mut CertificateParams) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now
        .replace_year(now.year() + VALIDITY_YEARS)
        .unwrap_or_else(|_| now + Duration::days(365 * i64::from(VALIDITY_YEARS) + 3));
}

fn generate_rsa_key_pair() -> CertResult<KeyPair> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256).map_err(CertError::KeyGeneration)
}
