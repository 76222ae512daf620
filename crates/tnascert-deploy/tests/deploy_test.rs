use rcgen::{date_time_ymd, CertificateParams, KeyPair};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use tnascert_deploy::{preflight, DeployConfig, DeployError, Deployment, Phase, RegistryError};
use tnascert_transport::mock::{JobOutcome, MockClient};
use tnascert_transport::TransportError;

const NEW_CERT: &str = "cert-new";

struct Fixture {
    _dir: TempDir,
    config: DeployConfig,
}

fn write_pair(cert_pem: &str, key_pem: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let cert_path = dir.path().join("fullchain.pem");
    let key_path = dir.path().join("privkey.pem");
    std::fs::write(&cert_path, cert_pem).unwrap();
    std::fs::write(&key_path, key_pem).unwrap();

    let mut config = DeployConfig::new("nas01.example.com", cert_path, key_path);
    config.api_key = Some("1-abcdef".to_string());
    config.cert_basename = "cert-".to_string();
    config.call_timeout = Duration::from_secs(1);
    config.job_timeout = Duration::from_secs(1);

    Fixture { _dir: dir, config }
}

fn fixture() -> Fixture {
    let issued = rcgen::generate_simple_self_signed(vec!["nas01.example.com".to_string()]).unwrap();
    write_pair(&issued.cert.pem(), &issued.key_pair.serialize_pem())
}

fn expired_fixture() -> Fixture {
    let mut params = CertificateParams::new(vec!["nas01.example.com".to_string()]).unwrap();
    params.not_before = date_time_ymd(2019, 1, 1);
    params.not_after = date_time_ymd(2020, 1, 1);
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    write_pair(&cert.pem(), &key.serialize_pem())
}

fn listing() -> Value {
    json!([
        {"id": 1, "name": "cert-A"},
        {"id": 2, "name": "cert-B"},
        {"id": 3, "name": "cert-new"},
        {"id": 7, "name": "truenas_default"},
    ])
}

/// Appliance that accepts every call
fn appliance() -> MockClient {
    MockClient::new()
        .on_call("system.info", json!({"version": "25.04.0", "hostname": "nas01"}))
        .on_call("app.certificate_choices", listing())
        .on_call("system.general.update", json!({"ui_certificate": 3}))
        .on_call("ftp.update", json!({"ssltls_certificate": 3}))
}

fn app_configs() -> impl Fn(&Value) -> Result<Value, TransportError> + Send + Sync + 'static {
    |params: &Value| match params[0].as_str() {
        Some("grafana") => Ok(json!({
            "network": {"web_port": 30037, "certificate_id": 1},
            "ix_certificates": {"1": {"name": "cert-A"}}
        })),
        Some("minio") => Ok(json!({"network": {"web_port": 30000}})),
        Some("plex") => Ok(json!({"run_as": {"user": 568}})),
        _ => Err(TransportError::RemoteError {
            method: "app.config".to_string(),
            message: "[ENOENT] App not found".to_string(),
        }),
    }
}

fn count(client: &MockClient, method: &str) -> usize {
    client.methods().iter().filter(|m| *m == method).count()
}

#[tokio::test]
async fn test_full_run_retires_only_superseded_certificates() {
    let mut fx = fixture();
    fx.config.add_as_ui_certificate = true;
    fx.config.delete_old_certs = true;

    let client = appliance();
    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let report = deployment.run().await.unwrap();

    assert!(deployment.is_activated());
    assert!(report.ui_activated);
    assert!(report.ui_restarted);
    assert_eq!(report.certificate_id, 3);
    assert_eq!(report.system_version.as_deref(), Some("25.04.0"));
    assert_eq!(report.retired, vec!["cert-A", "cert-B"]);
    assert!(report.retire_failed.is_empty());

    assert_eq!(
        client.job_params("certificate.delete"),
        vec![json!([1]), json!([2])]
    );
    assert_eq!(
        client.call_params("system.general.update"),
        vec![json!([{"ui_certificate": 3}])]
    );

    // Retired certificates leave the registry, the new one stays
    assert_eq!(deployment.registry().lookup("cert-A"), None);
    assert_eq!(deployment.registry().lookup("cert-B"), None);
    assert_eq!(deployment.registry().lookup(NEW_CERT), Some(3));

    assert_eq!(
        client.methods(),
        vec![
            "auth.login_with_api_key",
            "system.info",
            "core.subscribe",
            "certificate.create",
            "app.certificate_choices",
            "system.general.update",
            "certificate.delete",
            "certificate.delete",
            "system.general.ui_restart",
            "close",
        ]
    );
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_import_sends_pem_and_name() {
    let fx = fixture();
    let client = appliance();

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    deployment.run().await.unwrap();

    let created = client.job_params("certificate.create");
    assert_eq!(created.len(), 1);
    let params = &created[0][0];
    assert_eq!(params["name"], NEW_CERT);
    assert_eq!(params["create_type"], "CERTIFICATE_CREATE_IMPORTED");
    assert!(params["certificate"]
        .as_str()
        .unwrap()
        .contains("BEGIN CERTIFICATE"));
    assert!(params["privatekey"]
        .as_str()
        .unwrap()
        .contains("PRIVATE KEY"));
}

#[tokio::test]
async fn test_ui_failure_still_attempts_ftp_and_apps() {
    let mut fx = fixture();
    fx.config.add_as_ui_certificate = true;
    fx.config.add_as_ftp_certificate = true;
    fx.config.add_as_app_certificate = true;
    fx.config.app_list = vec!["grafana".to_string()];
    fx.config.delete_old_certs = true;

    let client = appliance()
        .on_call_error("system.general.update", "[EINVAL] ui_certificate: invalid")
        .on_call_with("app.config", app_configs());

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let err = deployment.run().await.unwrap_err();

    assert!(matches!(err, DeployError::ActivateUi { .. }));
    assert_eq!(err.phase(), Phase::ActivateUi);
    assert!(!deployment.is_activated());

    assert_eq!(count(&client, "ftp.update"), 1);
    assert_eq!(count(&client, "app.update"), 1);
    assert_eq!(count(&client, "certificate.delete"), 0);
    assert_eq!(count(&client, "system.general.ui_restart"), 0);
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_app_activation_respects_existing_binding() {
    let mut fx = fixture();
    fx.config.add_as_app_certificate = true;
    fx.config.app_list = vec!["grafana".to_string(), " minio ".to_string()];

    let client = appliance().on_call_with("app.config", app_configs());

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let report = deployment.run().await.unwrap();

    assert_eq!(report.apps_updated, vec!["grafana"]);
    assert_eq!(report.apps_skipped, vec!["minio"]);
    assert!(report.apps_failed.is_empty());

    // Only certificate_id changes; other network keys are sent back as fetched
    assert_eq!(
        client.job_params("app.update"),
        vec![json!([
            "grafana",
            {"values": {"network": {"web_port": 30037, "certificate_id": 3}}}
        ])]
    );
    assert_eq!(
        client.call_params("app.config"),
        vec![json!(["grafana"]), json!(["minio"])]
    );
}

#[tokio::test]
async fn test_app_without_network_section_is_skipped() {
    let mut fx = fixture();
    fx.config.add_as_app_certificate = true;
    fx.config.app_list = vec!["plex".to_string()];

    let client = appliance().on_call_with("app.config", app_configs());

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let report = deployment.run().await.unwrap();

    assert_eq!(report.apps_skipped, vec!["plex"]);
    assert_eq!(count(&client, "app.update"), 0);
}

#[tokio::test]
async fn test_app_failures_are_not_fatal() {
    let mut fx = fixture();
    fx.config.add_as_app_certificate = true;
    fx.config.add_as_ftp_certificate = true;
    fx.config.app_list = vec![
        "nextcloud".to_string(),
        "grafana".to_string(),
        "minio".to_string(),
    ];

    let client = appliance()
        .on_call_with("app.config", app_configs())
        .on_job(
            "app.update",
            JobOutcome::failure(vec![100.0], "[EFAULT] Failed to render compose file"),
        );

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let report = deployment.run().await.unwrap();

    assert!(report.ftp_activated);
    assert_eq!(report.apps_failed.len(), 2);
    assert_eq!(report.apps_failed[0].0, "nextcloud");
    assert_eq!(report.apps_failed[1].0, "grafana");
    assert!(report.apps_failed[1].1.contains("Failed to render compose file"));
    assert_eq!(report.apps_skipped, vec!["minio"]);
}

#[tokio::test]
async fn test_empty_app_list_checks_every_installed_app() {
    let mut fx = fixture();
    fx.config.add_as_app_certificate = true;

    let client = appliance()
        .on_call("app.query", json!([{"name": "grafana"}, {"name": "minio"}]))
        .on_call_with("app.config", app_configs());
    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let report = deployment.run().await.unwrap();

    assert_eq!(client.call_params("app.query"), vec![json!([])]);
    assert_eq!(
        client.call_params("app.config"),
        vec![json!(["grafana"]), json!(["minio"])]
    );
    assert_eq!(report.apps_updated, vec!["grafana"]);
    assert_eq!(report.apps_skipped, vec!["minio"]);
    assert_eq!(report.app_listing_error, None);
}

#[tokio::test]
async fn test_configured_app_list_skips_listing() {
    let mut fx = fixture();
    fx.config.add_as_app_certificate = true;
    fx.config.app_list = vec!["grafana".to_string()];

    let client = appliance().on_call_with("app.config", app_configs());
    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    deployment.run().await.unwrap();

    assert_eq!(count(&client, "app.query"), 0);
}

#[tokio::test]
async fn test_app_listing_failure_is_not_fatal() {
    let mut fx = fixture();
    fx.config.add_as_ui_certificate = true;
    fx.config.add_as_app_certificate = true;

    let client = appliance().on_call_error("app.query", "[EPERM] not authorized");
    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let report = deployment.run().await.unwrap();

    assert!(report.app_listing_error.unwrap().contains("not authorized"));
    assert!(report.apps_updated.is_empty());
    assert_eq!(count(&client, "app.config"), 0);
    assert!(report.ui_restarted);
}

#[tokio::test]
async fn test_no_retirement_or_restart_without_ui_activation() {
    for (ftp, apps) in [(false, false), (true, false), (false, true), (true, true)] {
        let mut fx = fixture();
        fx.config.add_as_ftp_certificate = ftp;
        fx.config.add_as_app_certificate = apps;
        fx.config.app_list = vec!["grafana".to_string()];
        fx.config.delete_old_certs = true;

        let client = appliance().on_call_with("app.config", app_configs());

        let mut deployment =
            Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
        let report = deployment.run().await.unwrap();

        assert!(!report.ui_activated, "ftp={} apps={}", ftp, apps);
        assert!(!report.ui_restarted, "ftp={} apps={}", ftp, apps);
        assert_eq!(report.ftp_activated, ftp);
        assert_eq!(report.apps_updated.len(), usize::from(apps));
        assert!(report.retired.is_empty());
        assert_eq!(count(&client, "certificate.delete"), 0);
        assert_eq!(count(&client, "system.general.ui_restart"), 0);
        assert_eq!(deployment.registry().len(), 3);
        assert!(client.is_closed());
    }
}

#[tokio::test]
async fn test_verified_inputs_are_not_read_again() {
    let fx = fixture();
    let (local, credentials) = preflight(&fx.config).unwrap();

    // Files gone after the check: the run must use what was verified
    std::fs::remove_file(&fx.config.full_chain_path).unwrap();
    std::fs::remove_file(&fx.config.private_key_path).unwrap();

    let client = appliance();
    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT)
        .with_verified(local.clone(), credentials);
    deployment.run().await.unwrap();

    let created = client.job_params("certificate.create");
    assert_eq!(created[0][0]["certificate"], local.full_chain);
}

#[tokio::test]
async fn test_retirement_continues_after_failure() {
    let mut fx = fixture();
    fx.config.add_as_ui_certificate = true;
    fx.config.delete_old_certs = true;

    let client = appliance().on_job(
        "certificate.delete",
        JobOutcome::failure(vec![], "[EBUSY] Certificate is being used by a service"),
    );

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let report = deployment.run().await.unwrap();

    assert_eq!(report.retired, vec!["cert-B"]);
    assert_eq!(report.retire_failed.len(), 1);
    assert_eq!(report.retire_failed[0].0, "cert-A");
    assert!(report.ui_restarted);
    assert_eq!(deployment.registry().lookup("cert-A"), Some(1));
}

#[tokio::test]
async fn test_ftp_failure_is_fatal() {
    let mut fx = fixture();
    fx.config.add_as_ui_certificate = true;
    fx.config.add_as_ftp_certificate = true;
    fx.config.delete_old_certs = true;

    let client = appliance().on_call_error("ftp.update", "[EINVAL] ftp_update.ssltls_certificate");

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let err = deployment.run().await.unwrap_err();

    assert!(matches!(err, DeployError::ActivateFtp { .. }));
    assert!(deployment.is_activated());
    assert_eq!(count(&client, "certificate.delete"), 0);
    assert_eq!(count(&client, "system.general.ui_restart"), 0);
}

#[tokio::test]
async fn test_restart_failure_is_fatal() {
    let mut fx = fixture();
    fx.config.add_as_ui_certificate = true;

    let client = appliance().on_call_error("system.general.ui_restart", "[EFAULT] nginx reload failed");

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let err = deployment.run().await.unwrap_err();

    assert!(matches!(err, DeployError::Restart(_)));
    assert_eq!(err.phase(), Phase::Restart);
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_import_failure_stops_the_run() {
    let fx = fixture();
    let client = appliance().on_job(
        "certificate.create",
        JobOutcome::failure(vec![50.0, 100.0], "[EFAULT] Failed to parse certificate"),
    );

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let err = deployment.run().await.unwrap_err();

    match &err {
        DeployError::Import { name, source } => {
            assert_eq!(name, NEW_CERT);
            assert!(source.to_string().contains("Failed to parse certificate"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(count(&client, "app.certificate_choices"), 0);
    assert!(client.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_import_times_out() {
    let fx = fixture();
    let client = appliance().on_job("certificate.create", JobOutcome::Stalled);

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let err = deployment.run().await.unwrap_err();

    assert!(matches!(
        err,
        DeployError::Import {
            source: tnascert_transport::JobError::Timeout { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_missing_certificate_after_import() {
    let fx = fixture();
    let client = appliance().on_call(
        "app.certificate_choices",
        json!([{"id": 1, "name": "cert-A"}]),
    );

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let err = deployment.run().await.unwrap_err();

    assert!(matches!(
        err,
        DeployError::Registry(RegistryError::Missing(ref name)) if name == NEW_CERT
    ));
    assert_eq!(err.phase(), Phase::Refresh);
    assert_eq!(count(&client, "system.general.update"), 0);
}

#[tokio::test]
async fn test_expired_certificate_aborts_before_any_call() {
    let mut fx = expired_fixture();
    fx.config.add_as_ui_certificate = true;

    let client = appliance();
    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let err = deployment.run().await.unwrap_err();

    assert!(matches!(err, DeployError::Preflight(_)));
    assert_eq!(client.methods(), vec!["close"]);
}

#[tokio::test]
async fn test_missing_credentials_abort_before_login() {
    let mut fx = fixture();
    fx.config.api_key = None;
    fx.config.username = Some("admin".to_string());

    let client = appliance();
    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let err = deployment.run().await.unwrap_err();

    assert!(matches!(err, DeployError::MissingCredentials));
    assert_eq!(err.phase(), Phase::Preflight);
    assert_eq!(count(&client, "auth.login"), 0);
}

#[tokio::test]
async fn test_username_password_login() {
    let mut fx = fixture();
    fx.config.api_key = None;
    fx.config.username = Some("admin".to_string());
    fx.config.password = Some("secret".to_string());

    let client = appliance();
    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    deployment.run().await.unwrap();

    assert_eq!(client.methods()[0], "auth.login");
}

#[tokio::test]
async fn test_login_failure_is_fatal() {
    let fx = fixture();
    let client = appliance().with_login_error("invalid API key");

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let err = deployment.run().await.unwrap_err();

    assert!(matches!(err, DeployError::Authenticate(_)));
    assert_eq!(count(&client, "core.subscribe"), 0);
}

#[tokio::test]
async fn test_subscribe_failure_is_fatal() {
    let fx = fixture();
    let client = appliance().with_subscribe_error("[EPERM] not allowed");

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let err = deployment.run().await.unwrap_err();

    assert!(matches!(err, DeployError::Subscribe(_)));
    assert_eq!(count(&client, "certificate.create"), 0);
}

#[tokio::test]
async fn test_system_info_failure_is_not_fatal() {
    let fx = fixture();
    let client = appliance().on_call_error("system.info", "[EPERM] not authorized");

    let mut deployment = Deployment::with_certificate_name(&client, fx.config.clone(), NEW_CERT);
    let report = deployment.run().await.unwrap();

    assert_eq!(report.system_version, None);
    assert_eq!(report.certificate_id, 3);
}

#[tokio::test]
async fn test_generated_name_is_fixed_per_run() {
    let fx = fixture();
    let client = MockClient::new();

    let mut config = fx.config.clone();
    config.cert_basename = "tnas-cert-deploy".to_string();
    let deployment = Deployment::new(&client, config);

    let name = deployment.certificate_name().to_string();
    assert!(name.starts_with("tnas-cert-deploy-"));
    assert_eq!(deployment.certificate_name(), name);
    assert_eq!(deployment.registry().expected_name(), name);
}
