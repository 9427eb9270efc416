//! # sensord-adapter-ws
//!
//! WebSocket adapter: publishes sensor events to outbound WebSocket
//! endpoints.
//!
//! ## Responsibilities
//! - Keep one reconnecting client connection per configured endpoint name
//! - Implement the `EventSink` port for every endpoint binding
//!
//! ## Dependency rule
//! Same as other adapters: depends on `sensord-app` and `sensord-domain`.

pub mod config;
pub mod endpoint;
pub mod error;

pub use config::EndpointConfig;
pub use endpoint::{EndpointRegistry, WsEndpoint, WsSink};
pub use error::WsError;
