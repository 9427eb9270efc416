//! WebSocket adapter error types.

use sensord_domain::error::SensordError;

/// Errors specific to the WebSocket adapter.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    /// A sensor binding names an endpoint that is not configured.
    #[error("unknown WebSocket endpoint {0}")]
    UnknownEndpoint(String),

    /// The endpoint is currently disconnected.
    #[error("WebSocket endpoint {0} not connected")]
    NotConnected(String),

    /// Too many events are waiting for the connection.
    #[error("WebSocket endpoint {0} is backlogged")]
    Backlogged(String),

    /// The endpoint was shut down.
    #[error("WebSocket endpoint {0} is closed")]
    Closed(String),
}

impl WsError {
    /// Convert into a [`SensordError::Transport`] for propagation across
    /// port boundaries.
    pub fn into_domain(self) -> SensordError {
        SensordError::transport(self)
    }
}

impl From<WsError> for SensordError {
    fn from(err: WsError) -> Self {
        err.into_domain()
    }
}
