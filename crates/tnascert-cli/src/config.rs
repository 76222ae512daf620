//! Configuration file support
//!
//! One `tnas-cert.yml` file describes any number of deployment targets,
//! with shared connection defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tnascert_deploy::{DeployConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_CERT_BASENAME, DEFAULT_JOB_TIMEOUT};
use tnascert_transport_websocket::WebSocketConfig;

/// Config file used when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "tnas-cert.yml";

/// Target deployed when none is named on the command line
pub const DEFAULT_TARGET: &str = "deploy_default";

/// Connection timeout used when none is configured
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration file format
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    /// Settings applied to every target unless overridden
    #[serde(default)]
    pub defaults: Defaults,

    /// Deployment targets
    #[serde(default)]
    pub targets: Vec<Target>,
}

/// Connection defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Defaults {
    /// `ws` or `wss`
    pub protocol: Option<String>,
    pub port: Option<u16>,
    /// Timeout for synchronous calls
    pub timeout_seconds: Option<i64>,
    /// Idle timeout while waiting for a job
    pub job_timeout_seconds: Option<i64>,
    /// Connection and handshake timeout
    pub connect_timeout_seconds: Option<i64>,
}

/// A single appliance and what to deploy to it
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Target {
    /// Target name (required, must be unique)
    pub name: String,

    /// Appliance host name or address
    #[serde(default)]
    pub connect_host: String,

    pub protocol: Option<String>,
    pub port: Option<u16>,
    pub timeout_seconds: Option<i64>,
    pub job_timeout_seconds: Option<i64>,
    pub connect_timeout_seconds: Option<i64>,

    /// API key (supports ${ENV_VAR} expansion); preferred over username/password
    pub api_key: Option<String>,
    pub username: Option<String>,
    /// Password (supports ${ENV_VAR} expansion)
    pub password: Option<String>,

    /// Accept any server certificate from the appliance
    #[serde(default)]
    pub tls_skip_verify: bool,

    /// PEM bundle of CAs trusted for the appliance's certificate
    pub ca_file: Option<PathBuf>,

    #[serde(default = "default_cert_basename")]
    pub cert_basename: String,
    #[serde(default)]
    pub full_chain_path: PathBuf,
    #[serde(default)]
    pub private_key_path: PathBuf,

    #[serde(default)]
    pub add_as_ui_certificate: bool,
    #[serde(default)]
    pub add_as_ftp_certificate: bool,
    #[serde(default)]
    pub add_as_app_certificate: bool,
    #[serde(default)]
    pub app_list: Vec<String>,
    #[serde(default)]
    pub delete_old_certs: bool,
}

fn default_cert_basename() -> String {
    DEFAULT_CERT_BASENAME.to_string()
}

impl ConfigFile {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: ConfigFile =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            anyhow::bail!("No targets defined");
        }

        if let Some(protocol) = &self.defaults.protocol {
            validate_protocol(protocol, "defaults")?;
        }

        let mut names = std::collections::HashSet::new();
        for target in &self.targets {
            if !names.insert(&target.name) {
                anyhow::bail!("Duplicate target name: {}", target.name);
            }

            if !is_valid_target_name(&target.name) {
                anyhow::bail!(
                    "Invalid target name '{}': must be alphanumeric with hyphens/underscores only",
                    target.name
                );
            }

            if target.connect_host.trim().is_empty() {
                anyhow::bail!("Target '{}': connect_host is required", target.name);
            }
            if target.full_chain_path.as_os_str().is_empty() {
                anyhow::bail!("Target '{}': full_chain_path is required", target.name);
            }
            if target.private_key_path.as_os_str().is_empty() {
                anyhow::bail!("Target '{}': private_key_path is required", target.name);
            }
            if let Some(protocol) = &target.protocol {
                validate_protocol(protocol, &target.name)?;
            }
        }

        Ok(())
    }

    /// Find a target by name
    pub fn get_target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }
}

impl Target {
    fn protocol(&self, defaults: &Defaults) -> String {
        self.protocol
            .as_ref()
            .or(defaults.protocol.as_ref())
            .map(|p| p.to_lowercase())
            .unwrap_or_else(|| "wss".to_string())
    }

    fn port(&self, defaults: &Defaults) -> u16 {
        self.port.or(defaults.port).unwrap_or(443)
    }

    fn call_timeout(&self, defaults: &Defaults) -> Duration {
        positive_seconds(self.timeout_seconds.or(defaults.timeout_seconds))
            .unwrap_or(DEFAULT_CALL_TIMEOUT)
    }

    fn job_timeout(&self, defaults: &Defaults) -> Duration {
        positive_seconds(self.job_timeout_seconds.or(defaults.job_timeout_seconds))
            .unwrap_or(DEFAULT_JOB_TIMEOUT)
    }

    fn connect_timeout(&self, defaults: &Defaults) -> Duration {
        positive_seconds(self.connect_timeout_seconds.or(defaults.connect_timeout_seconds))
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    /// `{protocol}://{host}:{port}`
    pub fn server_url(&self, defaults: &Defaults) -> String {
        format!(
            "{}://{}:{}",
            self.protocol(defaults),
            expand_env_vars(self.connect_host.trim()),
            self.port(defaults)
        )
    }

    /// Transport settings for this target
    pub fn websocket_config(&self, defaults: &Defaults) -> Result<WebSocketConfig> {
        let host = expand_env_vars(self.connect_host.trim());
        let mut config =
            WebSocketConfig::for_host(&self.protocol(defaults), &host, self.port(defaults))
                .with_context(|| format!("Invalid server address for target '{}'", self.name))?
                .with_request_timeout(self.call_timeout(defaults))
                .with_connect_timeout(self.connect_timeout(defaults));

        if let Some(ca_file) = &self.ca_file {
            config = config
                .with_ca_file(&expand_path(ca_file))
                .with_context(|| format!("Target '{}': unusable ca_file", self.name))?;
        }
        if self.tls_skip_verify {
            config = config.with_insecure_skip_verify();
        }
        Ok(config)
    }

    /// Deployment settings for this target
    pub fn to_deploy_config(&self, defaults: &Defaults) -> Result<DeployConfig> {
        let mut config = DeployConfig::new(
            expand_env_vars(self.connect_host.trim()),
            expand_path(&self.full_chain_path),
            expand_path(&self.private_key_path),
        );

        config.api_key = expand_secret(self.api_key.as_deref());
        config.username = expand_secret(self.username.as_deref());
        config.password = expand_secret(self.password.as_deref());

        if config.credentials().is_none() {
            anyhow::bail!(
                "Target '{}': an api_key or a username and password are required",
                self.name
            );
        }

        if !self.cert_basename.trim().is_empty() {
            config.cert_basename = self.cert_basename.trim().to_string();
        }

        config.add_as_ui_certificate = self.add_as_ui_certificate;
        config.add_as_ftp_certificate = self.add_as_ftp_certificate;
        config.add_as_app_certificate = self.add_as_app_certificate;
        config.app_list = self.app_list.clone();
        config.delete_old_certs = self.delete_old_certs;
        config.call_timeout = self.call_timeout(defaults);
        config.job_timeout = self.job_timeout(defaults);

        Ok(config)
    }
}

fn validate_protocol(protocol: &str, scope: &str) -> Result<()> {
    let protocol = protocol.to_lowercase();
    if !["ws", "wss"].contains(&protocol.as_str()) {
        anyhow::bail!(
            "Invalid protocol '{}' for '{}': must be ws or wss",
            protocol,
            scope
        );
    }
    Ok(())
}

fn positive_seconds(seconds: Option<i64>) -> Option<Duration> {
    seconds
        .filter(|s| *s > 0)
        .map(|s| Duration::from_secs(s as u64))
}

fn expand_secret(value: Option<&str>) -> Option<String> {
    value
        .map(expand_env_vars)
        .filter(|value| !value.is_empty())
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_vars(&path.to_string_lossy()))
}

/// Check if a target name is valid (alphanumeric, hyphens, underscores)
fn is_valid_target_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

/// Expand environment variables in a string
///
/// Supports `${VAR}` syntax. If the variable is not set, returns empty string.
pub fn expand_env_vars(input: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };

    re.replace_all(input, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
