//! # modlink-server
//!
//! Axum `WebSocket` endpoint serving the modules of one process.
//!
//! - Upgrade handshake: peer id, shared secret, codec negotiation
//! - Peer sessions: ordered frame dispatch, per-connection writer task
//! - Task workers: plain calls and suspended generators
//! - Topic fan-out to all or selected peers
//! - `wss:` served through rustls
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod tasks;
pub mod tls;

pub use config::ServerConfig;
pub use server::RpcServer;
