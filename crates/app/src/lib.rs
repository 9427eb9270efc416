//! # sensord-app
//!
//! Application layer: device protocols, sensor instances and **port
//! definitions** (traits).
//!
//! ## Responsibilities
//! - Define **port traits** that adapters must implement (driven/outbound ports):
//!   - `TransportOpener`: open the byte stream to a device
//!   - `EventSink`: deliver events to one external destination
//!   - `EventPublisher`: publish events in-process
//! - Encode and decode the wire protocol of each device family (`devices`)
//! - Run the per-command confirmation state machine (`protocol`)
//! - Own one task per sensor that drives the transport, the protocol engine
//!   and the presence filter (`instance`)
//! - Keep the name-to-instance map and fan commands out (`registry`)
//! - Deliver events to every bound sink with per-sink isolation (`dispatcher`)
//! - Route JSON-RPC control requests to the registry (`control`)
//!
//! ## Dependency rule
//! Depends on `sensord-domain` only (plus `tokio` sync/time/io primitives).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod control;
pub mod devices;
pub mod dispatcher;
pub mod event_bus;
pub mod instance;
pub mod ports;
pub mod protocol;
pub mod registry;

#[cfg(test)]
mod testing;
