//! WebSocket transport configuration

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tnascert_proto::API_ENDPOINT;
use tnascert_transport::{TransportError, TransportResult};
use url::Url;

/// WebSocket client configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Full endpoint URL (`ws://` or `wss://`)
    pub url: Url,

    /// Whether to verify the server's TLS certificate
    pub verify_server_cert: bool,

    /// Custom root CA certificates in DER form (webpki roots when empty)
    pub root_certs: Vec<Vec<u8>>,

    /// TCP + TLS + WebSocket handshake timeout
    pub connect_timeout: Duration,

    /// Timeout for requests issued by the client itself
    /// (login, subscribe, starting a job)
    pub request_timeout: Duration,
}

impl WebSocketConfig {
    /// Create a configuration for an explicit endpoint URL
    pub fn new(url: &str) -> TransportResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL: {}", e)))?;

        let config = Self {
            url,
            verify_server_cert: true,
            root_certs: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        };
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration for `{protocol}://{host}:{port}/api/current`
    pub fn for_host(protocol: &str, host: &str, port: u16) -> TransportResult<Self> {
        Self::new(&format!("{}://{}:{}{}", protocol, host, port, API_ENDPOINT))
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Trust the CA certificates in a PEM file instead of the webpki roots
    pub fn with_ca_file(mut self, path: &Path) -> TransportResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            TransportError::ConfigurationError(format!("Cannot read CA file {:?}: {}", path, e))
        })?;
        let mut reader = std::io::BufReader::new(file);

        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                TransportError::ConfigurationError(format!("Invalid CA file {:?}: {}", path, e))
            })?;
        if certs.is_empty() {
            return Err(TransportError::ConfigurationError(format!(
                "No certificates found in CA file {:?}",
                path
            )));
        }

        self.root_certs = certs.into_iter().map(|cert| cert.to_vec()).collect();
        Ok(self)
    }

    /// Whether the endpoint uses TLS
    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }

    pub fn validate(&self) -> TransportResult<()> {
        match self.url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::ConfigurationError(format!(
                    "Unsupported scheme '{}': must be ws or wss",
                    other
                )))
            }
        }
        if self.url.host_str().map_or(true, str::is_empty) {
            return Err(TransportError::ConfigurationError(
                "URL has no host".to_string(),
            ));
        }
        Ok(())
    }

    /// Build rustls TlsConnector for the client
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();

        if self.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert_der in &self.root_certs {
                roots
                    .add(rustls::pki_types::CertificateDer::from(cert_der.clone()))
                    .map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
            }
        }

        let client_crypto = if self.verify_server_cert {
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_host_builds_api_url() {
        let config = WebSocketConfig::for_host("wss", "nas01.example.com", 443).unwrap();
        // the default port is elided by the URL parser
        assert_eq!(config.url.as_str(), "wss://nas01.example.com/api/current");
        assert!(config.is_secure());
        assert!(config.verify_server_cert);
    }

    #[test]
    fn test_plain_websocket() {
        let config = WebSocketConfig::for_host("ws", "10.0.0.5", 8080).unwrap();
        assert_eq!(config.url.as_str(), "ws://10.0.0.5:8080/api/current");
        assert!(!config.is_secure());
    }

    #[test]
    fn test_invalid_scheme() {
        assert!(WebSocketConfig::for_host("https", "nas01", 443).is_err());
        assert!(WebSocketConfig::new("not a url").is_err());
    }

    #[test]
    fn test_insecure_skip_verify() {
        let config = WebSocketConfig::for_host("wss", "nas01", 443)
            .unwrap()
            .with_insecure_skip_verify();
        assert!(!config.verify_server_cert);
        assert!(config.build_tls_connector().is_ok());
    }

    #[test]
    fn test_ca_file_replaces_default_roots() {
        let dir = tempfile::TempDir::new().unwrap();
        let ca = rcgen::generate_simple_self_signed(vec!["nas01.lan".to_string()]).unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, ca.cert.pem()).unwrap();

        let config = WebSocketConfig::for_host("wss", "nas01.lan", 443)
            .unwrap()
            .with_connect_timeout(Duration::from_secs(3))
            .with_ca_file(&path)
            .unwrap();
        assert_eq!(config.root_certs, vec![ca.cert.der().to_vec()]);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert!(config.build_tls_connector().is_ok());
    }

    #[test]
    fn test_ca_file_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = WebSocketConfig::for_host("wss", "nas01.lan", 443).unwrap();
        assert!(config.clone().with_ca_file(&dir.path().join("missing.pem")).is_err());

        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "no pem here").unwrap();
        assert!(config.with_ca_file(&empty).is_err());
    }
}
