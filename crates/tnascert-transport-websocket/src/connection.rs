//! JSON-RPC connection over an established WebSocket

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tnascert_proto::methods::COLLECTION_UPDATE;
use tnascert_proto::{CollectionUpdate, IncomingMessage, RpcRequest};
use tnascert_transport::{JobRouter, TransportError, TransportResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, trace, warn};

use crate::pending::PendingCalls;

const CLOSED_REASON: &str = "connection closed";

/// Request/response multiplexer over one WebSocket
///
/// A writer task owns the sink and a reader task owns the stream. Replies
/// are matched to requests by id; `collection_update` notifications for
/// the jobs collection are handed to the [`JobRouter`].
pub struct RpcConnection {
    /// Connection ID for logging
    connection_id: String,
    /// Channel for sending frames to the writer task
    frame_tx: mpsc::Sender<Message>,
    /// Requests awaiting a reply
    pending: PendingCalls,
    /// Producers of in-flight jobs
    router: Arc<JobRouter>,
    /// Next request id
    next_id: AtomicU64,
    /// Whether the connection is closed
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("connection_id", &self.connection_id)
            .field("pending", &self.pending.count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcConnection {
    /// Take over an established WebSocket stream
    pub fn new<S>(ws_stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("rpc-{}", uuid::Uuid::new_v4());
        let (ws_sink, ws_source) = ws_stream.split();

        let (frame_tx, frame_rx) = mpsc::channel::<Message>(64);
        let pending = PendingCalls::new();
        let router = Arc::new(JobRouter::new());
        let closed = Arc::new(AtomicBool::new(false));

        let conn_id = connection_id.clone();
        tokio::spawn(Self::writer_task(ws_sink, frame_rx, conn_id));

        tokio::spawn(Self::reader_task(
            ws_source,
            pending.clone(),
            router.clone(),
            closed.clone(),
            connection_id.clone(),
        ));

        Self {
            connection_id,
            frame_tx,
            pending,
            router,
            next_id: AtomicU64::new(1),
            closed,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Job notification router fed by this connection
    pub fn router(&self) -> &Arc<JobRouter> {
        &self.router
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one request and wait for its reply
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> TransportResult<Value> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let text = RpcRequest::new(id, method, params)
            .to_text()
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        let rx = self.pending.register(id);
        // The reader marks the connection closed before clearing pending calls
        if self.is_closed() {
            self.pending.cancel(id);
            return Err(TransportError::ConnectionClosed);
        }

        trace!("[{}] -> {} (id {})", self.connection_id, method, id);
        if self.frame_tx.send(Message::Text(text)).await.is_err() {
            self.pending.cancel(id);
            return Err(TransportError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.pending.cancel(id);
                warn!(
                    "[{}] {} (id {}) timed out after {:?}",
                    self.connection_id, method, id, timeout
                );
                Err(TransportError::Timeout(timeout))
            }
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(TransportError::RemoteError {
                method: method.to_string(),
                message: error.describe(),
            }),
        }
    }

    /// Send a close frame and fail everything still in flight
    ///
    /// Returns false if the connection was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        debug!("[{}] Closing connection", self.connection_id);
        if self.frame_tx.send(Message::Close(None)).await.is_err() {
            debug!("[{}] Writer already stopped", self.connection_id);
        }

        self.pending.clear();
        self.router.close(CLOSED_REASON);
        true
    }

    /// Writer task - sends frames to the WebSocket
    async fn writer_task<S>(
        mut sink: SplitSink<WebSocketStream<S>, Message>,
        mut rx: mpsc::Receiver<Message>,
        conn_id: String,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, Message::Close(_));

            if let Err(e) = sink.send(message).await {
                error!("[{}] WebSocket send error: {}", conn_id, e);
                break;
            }
            if is_close {
                break;
            }
        }

        debug!("[{}] WebSocket writer task ended", conn_id);
        let _ = sink.close().await;
    }

    /// Reader task - routes replies and job notifications
    async fn reader_task<S>(
        mut source: SplitStream<WebSocketStream<S>>,
        pending: PendingCalls,
        router: Arc<JobRouter>,
        closed: Arc<AtomicBool>,
        conn_id: String,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(result) = source.next().await {
            match result {
                Ok(Message::Text(text)) => Self::handle_text(&text, &pending, &router, &conn_id),
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => Self::handle_text(text, &pending, &router, &conn_id),
                    Err(_) => warn!("[{}] Ignoring non-UTF-8 binary frame", conn_id),
                },
                Ok(Message::Ping(_)) => {
                    // Pong is automatically handled by tungstenite
                    trace!("[{}] Received ping", conn_id);
                }
                Ok(Message::Close(frame)) => {
                    debug!("[{}] WebSocket close received: {:?}", conn_id, frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[{}] WebSocket read error: {}", conn_id, e);
                    break;
                }
            }
        }

        debug!("[{}] WebSocket reader task ended", conn_id);
        closed.store(true, Ordering::SeqCst);
        pending.clear();
        router.close(CLOSED_REASON);
    }

    fn handle_text(text: &str, pending: &PendingCalls, router: &JobRouter, conn_id: &str) {
        let message = match IncomingMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] Dropping undecodable frame: {}", conn_id, e);
                return;
            }
        };

        match message {
            IncomingMessage::Response(response) => {
                trace!("[{}] <- reply (id {})", conn_id, response.id);
                pending.respond(response);
            }
            IncomingMessage::Notification { method, params } if method == COLLECTION_UPDATE => {
                match serde_json::from_value::<CollectionUpdate>(params) {
                    Ok(update) => {
                        if let Some(event) = update.job_event() {
                            trace!("[{}] Job {} update: {:?}", conn_id, event.id, event.state);
                            router.dispatch(event);
                        }
                    }
                    Err(e) => debug!("[{}] Ignoring malformed collection update: {}", conn_id, e),
                }
            }
            IncomingMessage::Notification { method, .. } => {
                trace!("[{}] Ignoring notification {}", conn_id, method);
            }
        }
    }
}
