//! WebSocket transport using tokio-tungstenite
//!
//! This crate implements [`tnascert_transport::RemoteClient`] on top of the
//! appliance's JSON-RPC 2.0 WebSocket endpoint (`/api/current`).
//!
//! # Features
//!
//! - **Encryption**: TLS via rustls (`wss://`), with an opt-in
//!   skip-verification mode for self-signed appliance certificates
//! - **Request multiplexing**: many in-flight calls over one socket,
//!   correlated by numeric request id
//! - **Job notifications**: `collection_update` messages for the
//!   `core.get_jobs` collection are routed to the matching [`Job`]
//!
//! [`Job`]: tnascert_transport::Job

pub mod client;
pub mod config;
pub mod connection;
pub mod pending;

pub use client::WebSocketClient;
pub use config::WebSocketConfig;
pub use connection::RpcConnection;
pub use pending::PendingCalls;
