//! Settings for one deployment run

use std::path::PathBuf;
use std::time::Duration;
use tnascert_transport::Credentials;

/// Default prefix of deployed certificate names
pub const DEFAULT_CERT_BASENAME: &str = "tnas-cert-deploy";

/// Default timeout for synchronous calls
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle timeout while waiting for a job
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// What to deploy and where to activate it
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Appliance host, used in log messages
    pub connect_host: String,

    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Prefix of deployed certificate names; also selects retirement candidates
    pub cert_basename: String,
    pub full_chain_path: PathBuf,
    pub private_key_path: PathBuf,

    pub add_as_ui_certificate: bool,
    pub add_as_ftp_certificate: bool,
    pub add_as_app_certificate: bool,
    /// Applications considered for certificate activation
    pub app_list: Vec<String>,
    pub delete_old_certs: bool,

    pub call_timeout: Duration,
    pub job_timeout: Duration,
}

impl DeployConfig {
    pub fn new(
        connect_host: impl Into<String>,
        full_chain_path: impl Into<PathBuf>,
        private_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            connect_host: connect_host.into(),
            api_key: None,
            username: None,
            password: None,
            cert_basename: DEFAULT_CERT_BASENAME.to_string(),
            full_chain_path: full_chain_path.into(),
            private_key_path: private_key_path.into(),
            add_as_ui_certificate: false,
            add_as_ftp_certificate: false,
            add_as_app_certificate: false,
            app_list: Vec::new(),
            delete_old_certs: false,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    /// Credential form to log in with, preferring the API key
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::resolve(
            self.username.as_deref(),
            self.password.as_deref(),
            self.api_key.as_deref(),
        )
    }
}
