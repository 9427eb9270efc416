//! IPC adapter error types.

use std::path::PathBuf;

use sensord_app::control::RpcError;
use sensord_domain::error::SensordError;

/// Errors specific to the IPC adapter.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Another daemon already answers on the socket.
    #[error("another daemon is already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),

    /// The socket could not be created.
    #[error("unable to bind control socket {}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The daemon could not be reached.
    #[error("unable to connect to control socket {}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading or writing the socket failed.
    #[error("control socket I/O failed")]
    Io(#[from] std::io::Error),

    /// A message was not valid JSON.
    #[error("invalid control message")]
    Json(#[from] serde_json::Error),

    /// The daemon answered with an error.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The peer closed the connection before answering.
    #[error("control connection closed")]
    Closed,
}

impl IpcError {
    /// Convert into a [`SensordError::Transport`] for propagation across
    /// port boundaries.
    pub fn into_domain(self) -> SensordError {
        SensordError::transport(self)
    }
}

impl From<IpcError> for SensordError {
    fn from(err: IpcError) -> Self {
        err.into_domain()
    }
}
