pub mod ca;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod subject;

pub use ca::{
    CaExtension, CertificateSummary, LeafCertificate, RootCa, RootCaOptions, RootCaPem,
    describe_certificate, generate_cert_for_hostname, generate_root_ca,
};
pub use error::{CertError, CertResult};
pub use store::{CertStore, CertificatePair, RootCaFiles, StoreMetricsSnapshot, StoreOptions};
pub use subject::{SubjectAttribute, SubjectOverrides, SubjectTemplate};
