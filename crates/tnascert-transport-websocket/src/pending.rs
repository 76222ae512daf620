//! Pending call tracker
//!
//! Routes JSON-RPC responses back to the task awaiting them, keyed by
//! request id.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tnascert_proto::{RpcErrorObject, RpcResponse};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome delivered to the caller
pub type CallOutcome = Result<Value, RpcErrorObject>;

/// Tracks requests awaiting a response
#[derive(Clone, Default)]
pub struct PendingCalls {
    /// Maps request id -> oneshot sender for the outcome
    calls: Arc<DashMap<u64, oneshot::Sender<CallOutcome>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request before it is sent
    pub fn register(&self, id: u64) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(id, tx);
        rx
    }

    /// Deliver a response
    /// Returns true if a caller was waiting for it
    pub fn respond(&self, response: RpcResponse) -> bool {
        let id = response.id;
        if let Some((_, tx)) = self.calls.remove(&id) {
            if tx.send(response.outcome).is_err() {
                debug!("Caller for request {} went away", id);
                return false;
            }
            return true;
        }
        warn!("No pending call found for response id {}", id);
        false
    }

    /// Forget a request (timeout or send failure)
    pub fn cancel(&self, id: u64) {
        if self.calls.remove(&id).is_some() {
            debug!("Cancelled pending call {}", id);
        }
    }

    /// Drop every waiter; their receivers observe a closed channel
    pub fn clear(&self) {
        self.calls.clear();
    }

    pub fn count(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_respond() {
        let pending = PendingCalls::new();
        let rx = pending.register(3);
        assert_eq!(pending.count(), 1);

        assert!(pending.respond(RpcResponse {
            id: 3,
            outcome: Ok(json!(true)),
        }));
        assert_eq!(pending.count(), 0);
        assert_eq!(rx.await.unwrap(), Ok(json!(true)));
    }

    #[tokio::test]
    async fn test_respond_with_error_object() {
        let pending = PendingCalls::new();
        let rx = pending.register(9);
        let error = RpcErrorObject {
            code: -32601,
            message: "Method not found".to_string(),
            data: None,
        };
        pending.respond(RpcResponse {
            id: 9,
            outcome: Err(error.clone()),
        });
        assert_eq!(rx.await.unwrap(), Err(error));
    }

    #[test]
    fn test_respond_unknown_id() {
        let pending = PendingCalls::new();
        assert!(!pending.respond(RpcResponse {
            id: 42,
            outcome: Ok(Value::Null),
        }));
    }

    #[tokio::test]
    async fn test_cancel_and_clear() {
        let pending = PendingCalls::new();
        let first = pending.register(1);
        let second = pending.register(2);

        pending.cancel(1);
        assert_eq!(pending.count(), 1);
        assert!(first.await.is_err());

        pending.clear();
        assert_eq!(pending.count(), 0);
        assert!(second.await.is_err());
    }
}
