//! Pre-flight verification of the certificate/key pair

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::CertError;

/// Certificates expiring within this many days are deployed with a warning
pub const EXPIRY_WARNING_DAYS: i64 = 30;

/// Facts about the leaf certificate, for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Number of certificates in the PEM chain, leaf included
    pub chain_len: usize,
}

impl CertificateInfo {
    /// Whole days left until `not_after`
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }
}

/// A verified certificate/key pair ready for import
#[derive(Clone)]
pub struct LocalCertificate {
    /// PEM-encoded certificate chain, as read from disk
    pub full_chain: String,
    /// PEM-encoded private key, as read from disk
    pub private_key: String,
    pub info: CertificateInfo,
}

impl fmt::Debug for LocalCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCertificate")
            .field("info", &self.info)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl LocalCertificate {
    /// Read and verify the pair
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        Self::load_at(cert_path, key_path, Utc::now())
    }

    /// Read and verify the pair against an explicit clock
    pub fn load_at(cert_path: &Path, key_path: &Path, now: DateTime<Utc>) -> Result<Self, CertError> {
        let full_chain = read_pem(cert_path)?;
        let private_key = read_pem(key_path)?;
        let info = check_pair(&full_chain, &private_key, cert_path, key_path, now)?;

        Ok(Self {
            full_chain,
            private_key,
            info,
        })
    }
}

/// Verify that the pair parses, matches and is currently valid
pub fn verify_certificate_key_pair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<CertificateInfo, CertError> {
    verify_certificate_key_pair_at(cert_path, key_path, Utc::now())
}

pub fn verify_certificate_key_pair_at(
    cert_path: &Path,
    key_path: &Path,
    now: DateTime<Utc>,
) -> Result<CertificateInfo, CertError> {
    Ok(LocalCertificate::load_at(cert_path, key_path, now)?.info)
}

fn read_pem(path: &Path) -> Result<String, CertError> {
    std::fs::read_to_string(path).map_err(|source| CertError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn check_pair(
    cert_pem: &str,
    key_pem: &str,
    cert_path: &Path,
    key_path: &Path,
    now: DateTime<Utc>,
) -> Result<CertificateInfo, CertError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Parse {
            path: cert_path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(CertError::NoCertificate(cert_path.to_path_buf()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| CertError::Parse {
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CertError::NoPrivateKey(key_path.to_path_buf()))?;

    let info = leaf_info(&certs, cert_path)?;
    debug!(
        "Leaf certificate: subject={}, issuer={}, chain length {}",
        info.subject, info.issuer, info.chain_len
    );

    // The server config builder rejects keys that do not belong to the leaf
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CertError::KeyMismatch(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CertError::KeyMismatch(e.to_string()))?;

    if now > info.not_after {
        return Err(CertError::Expired(info.not_after));
    }
    if now < info.not_before {
        return Err(CertError::NotYetValid(info.not_before));
    }

    let days = info.days_remaining(now);
    if days < EXPIRY_WARNING_DAYS {
        warn!(
            "Certificate {} expires soon: {} days left (expires at {})",
            info.subject, days, info.not_after
        );
    } else {
        info!(
            "Certificate {} is valid until {} ({} days left)",
            info.subject, info.not_after, days
        );
    }

    Ok(info)
}

fn leaf_info(certs: &[CertificateDer<'_>], cert_path: &Path) -> Result<CertificateInfo, CertError> {
    let parse_error = |reason: String| CertError::Parse {
        path: cert_path.to_path_buf(),
        reason,
    };

    let leaf = certs
        .first()
        .ok_or_else(|| CertError::NoCertificate(cert_path.to_path_buf()))?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| parse_error(format!("invalid X509 certificate: {}", e)))?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| parse_error("notBefore out of range".to_string()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| parse_error("notAfter out of range".to_string()))?;

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before,
        not_after,
        chain_len: certs.len(),
    })
}
