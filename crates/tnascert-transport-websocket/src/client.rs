//! [`RemoteClient`] over WebSocket

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tnascert_proto::methods::{AUTH_LOGIN, AUTH_LOGIN_WITH_API_KEY, CORE_GET_JOBS, CORE_SUBSCRIBE};
use tnascert_transport::{
    Credentials, Job, ProgressCallback, RemoteClient, TransportError, TransportResult,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::config::WebSocketConfig;
use crate::connection::RpcConnection;

/// TrueNAS API client speaking JSON-RPC over `ws://` or `wss://`
#[derive(Debug)]
pub struct WebSocketClient {
    connection: RpcConnection,
    /// Timeout for login, subscribe and job start requests
    request_timeout: Duration,
    subscribed: AtomicBool,
}

impl WebSocketClient {
    /// Connect to the endpoint described by `config`
    pub async fn connect(config: &WebSocketConfig) -> TransportResult<Self> {
        config.validate()?;

        let url = &config.url;
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .ok_or_else(|| TransportError::ConfigurationError("URL has no host".to_string()))?;
        let port = url.port_or_known_default().ok_or_else(|| {
            TransportError::ConfigurationError(format!("No port for {}", url))
        })?;

        debug!("Connecting to {}", url);

        let connect = async {
            let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
                TransportError::ConnectionError(format!("TCP connect to {}:{} failed: {}", host, port, e))
            })?;

            let stream = if config.is_secure() {
                let connector = config.build_tls_connector()?;
                let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                    .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;
                MaybeTlsStream::Rustls(tls)
            } else {
                MaybeTlsStream::Plain(tcp)
            };

            let (ws_stream, _response) = tokio_tungstenite::client_async(url.as_str(), stream)
                .await
                .map_err(|e| {
                    TransportError::ConnectionError(format!("WebSocket handshake failed: {}", e))
                })?;

            Ok::<_, TransportError>(ws_stream)
        };

        let ws_stream = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout(config.connect_timeout))??;

        let client = Self::from_stream(ws_stream, config.request_timeout);
        info!("Connected to {} [{}]", url, client.connection.connection_id());
        Ok(client)
    }

    /// Wrap an already established WebSocket
    pub fn from_stream<S>(ws_stream: WebSocketStream<S>, request_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            connection: RpcConnection::new(ws_stream),
            request_timeout,
            subscribed: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }
}

#[async_trait]
impl RemoteClient for WebSocketClient {
    async fn login(&self, credentials: &Credentials) -> TransportResult<()> {
        let (method, params) = match credentials {
            Credentials::ApiKey(key) => (AUTH_LOGIN_WITH_API_KEY, json!([key])),
            Credentials::UserPassword { username, password } => {
                (AUTH_LOGIN, json!([username, password]))
            }
        };

        let result = match self
            .connection
            .request(method, params, self.request_timeout)
            .await
        {
            Ok(result) => result,
            Err(TransportError::RemoteError { message, .. }) => {
                return Err(TransportError::AuthenticationFailed(message))
            }
            Err(e) => return Err(e),
        };

        match result {
            Value::Bool(true) => {
                debug!("Authenticated with {}", credentials.kind());
                Ok(())
            }
            other => Err(TransportError::AuthenticationFailed(format!(
                "server rejected the {} (reply: {})",
                credentials.kind(),
                other
            ))),
        }
    }

    async fn call(&self, method: &str, timeout: Duration, params: Value) -> TransportResult<Value> {
        self.connection.request(method, params, timeout).await
    }

    async fn call_with_job(
        &self,
        method: &str,
        params: Value,
        callback: Option<ProgressCallback>,
    ) -> TransportResult<Job> {
        if !self.subscribed.load(Ordering::SeqCst) {
            return Err(TransportError::ProtocolError(
                "job started before subscribing to job notifications".to_string(),
            ));
        }

        let reply = self
            .connection
            .request(method, params, self.request_timeout)
            .await?;

        let id = reply.as_i64().ok_or_else(|| {
            TransportError::ProtocolError(format!("{} did not return a job id: {}", method, reply))
        })?;

        let (job, updater) = Job::channel(id, method);
        self.connection
            .router()
            .register(updater.with_callback(callback));

        Ok(job)
    }

    async fn subscribe_to_jobs(&self) -> TransportResult<()> {
        if self.subscribed.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.connection
            .request(CORE_SUBSCRIBE, json!([CORE_GET_JOBS]), self.request_timeout)
            .await?;
        self.subscribed.store(true, Ordering::SeqCst);
        debug!("Subscribed to {}", CORE_GET_JOBS);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if self.connection.close().await {
            debug!("[{}] Client closed", self.connection.connection_id());
        }
        Ok(())
    }
}
