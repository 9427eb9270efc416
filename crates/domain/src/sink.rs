//! Sink bindings: where a sensor's events are delivered.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One configured destination for a sensor's events.
///
/// Names refer to brokers and endpoints declared elsewhere in the
/// configuration; they are resolved into live publishers at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkBinding {
    Mqtt { broker: String, topic: String },
    WebSocket { endpoint: String },
}

impl fmt::Display for SinkBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mqtt { broker, topic } => write!(f, "mqtt:{broker}/{topic}"),
            Self::WebSocket { endpoint } => write!(f, "ws:{endpoint}"),
        }
    }
}
