//! # modlink-core
//!
//! Shared vocabulary of the modlink RPC channel.
//!
//! - Wire frames, event codes and the `JSON` / `CLONE` codecs
//! - Connection addresses, TLS material and the endpoint error sink
//! - Module interface, registry and lifecycle hooks
//! - Routing table and provider selection
//! - Call handles that hide local vs. remote execution
//! - Settings loading and logging bootstrap

#![deny(unsafe_code)]

pub mod address;
pub mod call;
pub mod codec;
pub mod context;
pub mod errors;
pub mod local;
pub mod logging;
pub mod module;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod settings;
pub mod sink;
pub mod task;
pub mod tls;

pub use address::{Address, AddressOptions, Protocol};
pub use call::{Call, CallRequest, Invocation};
pub use codec::{Codec, Payload};
pub use context::AppContext;
pub use errors::{ChannelError, RemoteError, Result};
pub use module::{FnModule, Generator, Module, ModuleDescriptor, Outcome, StreamGenerator};
pub use protocol::{Event, IterResult, Request, Response, Target};
pub use registry::{ModuleRegistry, RegistryEntry};
pub use routing::{CallTarget, Provider, RoutingTable};
pub use sink::ErrorSink;
pub use task::Operation;
pub use tls::TlsOptions;
