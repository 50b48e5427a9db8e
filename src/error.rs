use std::{
    io,
    path::{Path, PathBuf},
};

pub type CertResult<T> = Result<T, CertError>;

#[derive(Debug)]
pub enum CertError {
    /// A filesystem read, write, mkdir or delete failed.
    Io {
        context: String,
        source: io::Error,
    },
    /// The root CA was requested but its files are not on disk.
    NotFound { path: PathBuf },
    /// Root certificate or key PEM handed to the leaf issuer is malformed.
    Parse(String),
    /// The signing primitive rejected the request, e.g. key and certificate do not match.
    Signing(String),
    KeyGeneration(rcgen::Error),
    InvalidHostname(String),
    InvalidConfiguration(String),
    TaskJoin(String),
}

impl CertError {
    pub(crate) fn io(action: &str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            context: format!("{action} {}", path.display()),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl std::fmt::Display for CertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::NotFound { path } => write!(
                f,
                "root CA not found at {}; generate a root CA first",
                path.display()
            ),
            Self::Parse(reason) => write!(f, "parse error: {reason}"),
            Self::Signing(reason) => write!(f, "signing failed: {reason}"),
            Self::KeyGeneration(err) => write!(f, "failed to generate key pair: {err}"),
            Self::InvalidHostname(reason) => write!(f, "invalid hostname: {reason}"),
            Self::InvalidConfiguration(reason) => write!(f, "invalid configuration: {reason}"),
            Self::TaskJoin(reason) => write!(f, "certificate task failed: {reason}"),
        }
    }
}

impl std::error::Error for CertError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::KeyGeneration(err) => Some(err),
            _ => None,
        }
    }
}
