//! Local certificate handling
//!
//! Pre-flight checks for the certificate/key pair about to be deployed and
//! the naming scheme for deployed certificates.

pub mod name;
pub mod verify;

pub use name::certificate_name;
pub use verify::{
    verify_certificate_key_pair, verify_certificate_key_pair_at, CertificateInfo,
    LocalCertificate, EXPIRY_WARNING_DAYS,
};

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Pre-flight failures
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("No certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("Private key does not match the certificate: {0}")]
    KeyMismatch(String),

    #[error("Certificate expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("Certificate is not valid before {0}")]
    NotYetValid(DateTime<Utc>),
}
