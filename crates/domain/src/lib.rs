//! # sensord-domain
//!
//! Pure domain model for the sensord sensor middleware.
//!
//! ## Responsibilities
//! - Foundational types: error conventions, event timestamps
//! - Define **Sensors** (identity, configuration, lifecycle, status)
//! - Define **Commands** (requests sent to devices and their results)
//! - Define **Samples** (raw device readings)
//! - Define the **Presence filter** (debounces samples into presence changes)
//! - Define **Events** (the wire-stable unit delivered to sinks)
//! - Define **Sink bindings** (where a sensor's events go)
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod time;

pub mod command;
pub mod event;
pub mod presence;
pub mod sample;
pub mod sensor;
pub mod sink;
