//! # sensord-adapter-ipc
//!
//! IPC adapter: the local control channel between `sensord` and
//! `sensorctl`.
//!
//! ## Responsibilities
//! - Serve the control service over a Unix domain socket, one JSON-RPC 2.0
//!   object per line, one task per connection
//! - Refuse to start when another daemon already answers on the socket
//! - Stream events to connections that subscribed
//! - Provide the matching client used by the CLI
//!
//! ## Dependency rule
//! Same as other adapters: depends on `sensord-app` and `sensord-domain`.

pub mod client;
pub mod error;
pub mod server;

pub use client::{EventStream, IpcClient};
pub use error::IpcError;
pub use server::IpcServer;
