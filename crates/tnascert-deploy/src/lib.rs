//! Certificate deployment pipeline
//!
//! A [`Deployment`] drives one run against one appliance through strictly
//! ordered phases:
//!
//! ```text
//! preflight -> authenticate -> subscribe -> import (job) -> refresh registry
//!     -> activate UI / FTP / apps -> retire old certificates -> restart UI
//! ```
//!
//! Retirement and the UI restart only happen when the new certificate was
//! activated as the UI certificate. Per-application activation failures and
//! individual retirement failures are logged and recorded in the
//! [`DeployReport`] without stopping the run; every other phase failure
//! ends the run with a [`DeployError`].

pub mod config;
pub mod deploy;
pub mod registry;

pub use config::{DeployConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_CERT_BASENAME, DEFAULT_JOB_TIMEOUT};
pub use deploy::{preflight, DeployReport, Deployment};
pub use registry::{CertificateRegistry, RegistryError};

use std::fmt;
use thiserror::Error;
use tnascert_cert::CertError;
use tnascert_transport::{JobError, TransportError};

/// Ordered phases of a deployment run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preflight,
    Authenticate,
    Subscribe,
    Import,
    Refresh,
    ActivateUi,
    ActivateFtp,
    ActivateApps,
    Retire,
    Restart,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Preflight => "pre-flight",
            Phase::Authenticate => "authenticate",
            Phase::Subscribe => "subscribe",
            Phase::Import => "import",
            Phase::Refresh => "refresh registry",
            Phase::ActivateUi => "activate UI certificate",
            Phase::ActivateFtp => "activate FTP certificate",
            Phase::ActivateApps => "activate app certificates",
            Phase::Retire => "retire old certificates",
            Phase::Restart => "restart UI",
        };
        f.write_str(name)
    }
}

/// Fatal deployment failures
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("certificate verification failed: {0}")]
    Preflight(#[from] CertError),

    #[error("no API key or username and password configured")]
    MissingCredentials,

    #[error("login failed: {0}")]
    Authenticate(#[source] TransportError),

    #[error("unable to subscribe to job notifications: {0}")]
    Subscribe(#[source] TransportError),

    #[error("importing certificate {name} failed: {source}")]
    Import {
        name: String,
        #[source]
        source: JobError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to set {name} as the UI certificate: {source}")]
    ActivateUi {
        name: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to set {name} as the FTP certificate: {source}")]
    ActivateFtp {
        name: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to restart the UI: {0}")]
    Restart(#[source] TransportError),
}

impl DeployError {
    /// Phase the run stopped in
    pub fn phase(&self) -> Phase {
        match self {
            DeployError::Preflight(_) | DeployError::MissingCredentials => Phase::Preflight,
            DeployError::Authenticate(_) => Phase::Authenticate,
            DeployError::Subscribe(_) => Phase::Subscribe,
            DeployError::Import { .. } => Phase::Import,
            DeployError::Registry(_) => Phase::Refresh,
            DeployError::ActivateUi { .. } => Phase::ActivateUi,
            DeployError::ActivateFtp { .. } => Phase::ActivateFtp,
            DeployError::Restart(_) => Phase::Restart,
        }
    }
}
