//! Deployment orchestrator

use chrono::Local;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tnascert_cert::{certificate_name, LocalCertificate};
use tnascert_proto::methods::{
    APP_CONFIG, APP_QUERY, APP_UPDATE, CERTIFICATE_CREATE, CERTIFICATE_DELETE, FTP_UPDATE,
    SYSTEM_GENERAL_UI_RESTART, SYSTEM_GENERAL_UPDATE, SYSTEM_INFO,
};
use tnascert_transport::{run_job, Credentials, JobError, RemoteClient, TransportError};
use tracing::{debug, error, info, warn};

use crate::config::DeployConfig;
use crate::registry::CertificateRegistry;
use crate::DeployError;

/// `create_type` for importing an existing certificate and key
const CREATE_TYPE_IMPORTED: &str = "CERTIFICATE_CREATE_IMPORTED";

/// Outcome of a successful run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeployReport {
    pub certificate_name: String,
    pub certificate_id: i64,
    pub system_version: Option<String>,
    /// The certificate is the active UI certificate
    pub ui_activated: bool,
    pub ftp_activated: bool,
    pub apps_updated: Vec<String>,
    /// Apps without a certificate binding, left untouched
    pub apps_skipped: Vec<String>,
    pub apps_failed: Vec<(String, String)>,
    /// Set when the installed apps could not be listed
    pub app_listing_error: Option<String>,
    pub retired: Vec<String>,
    pub retire_failed: Vec<(String, String)>,
    pub ui_restarted: bool,
}

impl DeployReport {
    fn new(certificate_name: &str) -> Self {
        Self {
            certificate_name: certificate_name.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
enum AppActivationError {
    #[error("listing the apps failed: {0}")]
    Query(#[source] TransportError),

    #[error("unexpected app listing: {0}")]
    Listing(String),

    #[error("fetching the app config failed: {0}")]
    Config(#[source] TransportError),

    #[error("the app update failed: {0}")]
    Update(#[source] JobError),
}

/// Check the local inputs of a run without touching the network
pub fn preflight(config: &DeployConfig) -> Result<(LocalCertificate, Credentials), DeployError> {
    let local = LocalCertificate::load(&config.full_chain_path, &config.private_key_path)?;
    let credentials = config
        .credentials()
        .ok_or(DeployError::MissingCredentials)?;
    Ok((local, credentials))
}

/// One deployment run against one appliance
///
/// Owns the run's certificate name and registry. The client is closed when
/// [`Deployment::run`] returns.
pub struct Deployment<'a, C: RemoteClient + ?Sized> {
    client: &'a C,
    config: DeployConfig,
    name: String,
    registry: CertificateRegistry,
    verified: Option<(LocalCertificate, Credentials)>,
    activated: bool,
}

impl<'a, C> Deployment<'a, C>
where
    C: RemoteClient + ?Sized,
{
    /// Prepare a run; the certificate name is fixed here
    pub fn new(client: &'a C, config: DeployConfig) -> Self {
        let name = certificate_name(&config.cert_basename, &Local::now());
        Self::with_certificate_name(client, config, name)
    }

    pub fn with_certificate_name(client: &'a C, config: DeployConfig, name: impl Into<String>) -> Self {
        let name = name.into();
        let registry = CertificateRegistry::new(config.cert_basename.clone(), name.clone());
        Self {
            client,
            config,
            name,
            registry,
            verified: None,
            activated: false,
        }
    }

    /// Use inputs already checked by [`preflight`] instead of reading them again
    pub fn with_verified(mut self, local: LocalCertificate, credentials: Credentials) -> Self {
        self.verified = Some((local, credentials));
        self
    }

    pub fn certificate_name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &CertificateRegistry {
        &self.registry
    }

    /// Whether the certificate became the UI certificate
    pub fn is_activated(&self) -> bool {
        self.activated
    }

    /// Run every phase, then close the client
    pub async fn run(&mut self) -> Result<DeployReport, DeployError> {
        info!(
            "Installing certificate {} on {}",
            self.name, self.config.connect_host
        );

        let result = self.execute().await;

        if let Err(e) = self.client.close().await {
            warn!("Error closing the connection: {}", e);
        }

        match &result {
            Ok(_) => info!("Deployment of {} completed", self.name),
            Err(e) => error!("Deployment of {} failed ({}): {}", self.name, e.phase(), e),
        }
        result
    }

    async fn execute(&mut self) -> Result<DeployReport, DeployError> {
        let mut report = DeployReport::new(&self.name);

        let (local, credentials) = match self.verified.take() {
            Some(verified) => verified,
            None => preflight(&self.config)?,
        };
        self.authenticate(&credentials).await?;
        report.system_version = self.system_info().await;
        self.subscribe().await?;
        self.import(&local).await?;

        let id = self
            .registry
            .refresh(self.client, self.config.call_timeout)
            .await?;
        report.certificate_id = id;

        self.activate(id, &mut report).await?;

        if !self.activated {
            info!(
                "{} was not activated as the UI certificate, no certificates will be retired",
                self.name
            );
            return Ok(report);
        }

        if self.config.delete_old_certs {
            self.retire(&mut report).await;
        }

        self.restart_ui().await?;
        report.ui_restarted = true;

        Ok(report)
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<(), DeployError> {
        info!(
            "Logging in to {} with the {}",
            self.config.connect_host,
            credentials.kind()
        );
        self.client
            .login(credentials)
            .await
            .map_err(DeployError::Authenticate)?;
        info!("Logged in to {}", self.config.connect_host);
        Ok(())
    }

    /// Appliance version, for the log only
    async fn system_info(&self) -> Option<String> {
        match self
            .client
            .call(SYSTEM_INFO, self.config.call_timeout, json!([]))
            .await
        {
            Ok(info) => {
                let version = info.get("version").and_then(Value::as_str).map(str::to_string);
                match &version {
                    Some(version) => info!(
                        "{} is running version '{}'",
                        self.config.connect_host, version
                    ),
                    None => warn!(
                        "Unable to get the version of {}",
                        self.config.connect_host
                    ),
                }
                version
            }
            Err(e) => {
                warn!("Could not get the system info: {}", e);
                None
            }
        }
    }

    async fn subscribe(&self) -> Result<(), DeployError> {
        self.client
            .subscribe_to_jobs()
            .await
            .map_err(DeployError::Subscribe)
    }

    async fn import(&self, local: &LocalCertificate) -> Result<(), DeployError> {
        info!("Importing the {} certificate", self.name);

        let params = json!([{
            "name": self.name,
            "certificate": local.full_chain,
            "privatekey": local.private_key,
            "create_type": CREATE_TYPE_IMPORTED,
        }]);

        run_job(self.client, CERTIFICATE_CREATE, params, self.config.job_timeout)
            .await
            .map_err(|source| DeployError::Import {
                name: self.name.clone(),
                source,
            })?;

        info!("Certificate {} imported", self.name);
        Ok(())
    }

    /// UI, FTP and app activation
    ///
    /// Each enabled activation is attempted even if an earlier one failed;
    /// the first UI or FTP failure is returned afterwards.
    async fn activate(&mut self, id: i64, report: &mut DeployReport) -> Result<(), DeployError> {
        let mut fatal: Option<DeployError> = None;

        if self.config.add_as_ui_certificate {
            match self.activate_ui(id).await {
                Ok(()) => {
                    self.activated = true;
                    report.ui_activated = true;
                }
                Err(e) => {
                    error!("{}", e);
                    fatal = Some(e);
                }
            }
        }

        if self.config.add_as_ftp_certificate {
            match self.activate_ftp(id).await {
                Ok(()) => report.ftp_activated = true,
                Err(e) => {
                    error!("{}", e);
                    fatal.get_or_insert(e);
                }
            }
        }

        if self.config.add_as_app_certificate {
            self.activate_apps(id, report).await;
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn activate_ui(&self, id: i64) -> Result<(), DeployError> {
        self.client
            .call(
                SYSTEM_GENERAL_UPDATE,
                self.config.call_timeout,
                json!([{ "ui_certificate": id }]),
            )
            .await
            .map_err(|source| DeployError::ActivateUi {
                name: self.name.clone(),
                source,
            })?;
        info!("{} is now the UI certificate", self.name);
        Ok(())
    }

    async fn activate_ftp(&self, id: i64) -> Result<(), DeployError> {
        self.client
            .call(
                FTP_UPDATE,
                self.config.call_timeout,
                json!([{ "ssltls_certificate": id }]),
            )
            .await
            .map_err(|source| DeployError::ActivateFtp {
                name: self.name.clone(),
                source,
            })?;
        info!("The FTP service certificate was updated to {}", self.name);
        Ok(())
    }

    async fn activate_apps(&self, id: i64, report: &mut DeployReport) {
        let mut apps: Vec<String> = self
            .config
            .app_list
            .iter()
            .map(|app| app.trim())
            .filter(|app| !app.is_empty())
            .map(str::to_string)
            .collect();

        if apps.is_empty() {
            info!("The app list is empty, checking every installed app");
            match self.installed_apps().await {
                Ok(installed) => apps = installed,
                Err(e) => {
                    warn!("Unable to list the installed apps: {}", e);
                    report.app_listing_error = Some(e.to_string());
                    return;
                }
            }
        }

        for app in apps {
            match self.activate_app(&app, id).await {
                Ok(true) => report.apps_updated.push(app),
                Ok(false) => report.apps_skipped.push(app),
                Err(e) => {
                    warn!(
                        "Failed to set {} as the certificate of the '{}' app: {}",
                        self.name, app, e
                    );
                    report.apps_failed.push((app, e.to_string()));
                }
            }
        }
    }

    /// Names of the apps installed on the appliance
    async fn installed_apps(&self) -> Result<Vec<String>, AppActivationError> {
        let listing = self
            .client
            .call(APP_QUERY, self.config.call_timeout, json!([]))
            .await
            .map_err(AppActivationError::Query)?;

        let entries = listing.as_array().ok_or_else(|| {
            AppActivationError::Listing(format!("expected a list of apps, got {}", listing))
        })?;

        let names: Vec<String> = entries
            .iter()
            .filter_map(|entry| {
                entry
                    .get("name")
                    .or_else(|| entry.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect();
        debug!("Installed apps: {:?}", names);
        Ok(names)
    }

    /// Returns false when the app is not using a certificate
    async fn activate_app(&self, app: &str, id: i64) -> Result<bool, AppActivationError> {
        info!("Processing the certificate update for the '{}' app", app);

        let app_config = self
            .client
            .call(APP_CONFIG, self.config.call_timeout, json!([app]))
            .await
            .map_err(AppActivationError::Config)?;

        let Some(network) = app_config.get("network").and_then(Value::as_object) else {
            info!("The '{}' app has no network configuration, skipping", app);
            return Ok(false);
        };
        if !network.contains_key("certificate_id") {
            info!(
                "The '{}' app is currently not using a certificate, will not add one",
                app
            );
            return Ok(false);
        }

        let mut network = network.clone();
        network.insert("certificate_id".to_string(), json!(id));
        let params = json!([app, { "values": { "network": network } }]);
        debug!("App update for '{}': {}", app, params);

        run_job(self.client, APP_UPDATE, params, self.config.job_timeout)
            .await
            .map_err(AppActivationError::Update)?;

        info!(
            "Updated the certificate for the '{}' app to {} (id {})",
            app, self.name, id
        );
        Ok(true)
    }

    /// Delete every earlier certificate with the configured prefix
    async fn retire(&mut self, report: &mut DeployReport) {
        debug!(
            "Retiring certificates named {}* other than {}",
            self.registry.prefix(),
            self.registry.expected_name()
        );
        for (name, id) in self.registry.retirement_candidates() {
            info!("Deleting old certificate {} (id {})", name, id);

            match run_job(
                self.client,
                CERTIFICATE_DELETE,
                json!([id]),
                self.config.job_timeout,
            )
            .await
            {
                Ok(_) => {
                    info!("Certificate {} was deleted", name);
                    self.registry.remove(&name);
                    report.retired.push(name);
                }
                Err(e) => {
                    warn!("Deleting certificate {} failed: {}", name, e);
                    report.retire_failed.push((name, e.to_string()));
                }
            }
        }
    }

    async fn restart_ui(&self) -> Result<(), DeployError> {
        self.client
            .call(
                SYSTEM_GENERAL_UI_RESTART,
                self.config.call_timeout,
                json!([]),
            )
            .await
            .map_err(DeployError::Restart)?;
        info!("Restarted the UI");
        Ok(())
    }
}
