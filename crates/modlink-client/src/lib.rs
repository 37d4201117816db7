//! # modlink-client
//!
//! Client endpoint of the modlink RPC channel.
//!
//! - Handshake with id, secret and codec negotiation
//! - Remote modules exposed through the shared routing table
//! - Call handles with per-call deadlines and generator stepping
//! - Keepalive pings and automatic reconnection
//! - Topic subscriptions

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod connection;
pub mod keepalive;
pub mod remote;
pub mod tasks;
pub mod topics;

pub use client::{ClientState, RpcClient};
pub use config::ClientConfig;
pub use remote::RemoteTarget;
pub use topics::SubscriptionId;
