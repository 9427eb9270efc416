//! Serial adapter error types.

use sensord_domain::error::SensordError;

/// Errors specific to the serial adapter.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    /// The port could not be opened.
    #[error("unable to open serial port {path}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },

    /// The port handle could not be duplicated for writing.
    #[error("unable to clone serial port handle")]
    Clone(#[source] serialport::Error),

    /// A pump thread could not be started.
    #[error("unable to start serial pump thread")]
    Thread(#[source] std::io::Error),

    /// The blocking open task was cancelled or panicked.
    #[error("serial open task failed")]
    Join(#[source] tokio::task::JoinError),
}

impl SerialError {
    /// Convert into a [`SensordError::Transport`] for propagation across
    /// port boundaries.
    pub fn into_domain(self) -> SensordError {
        SensordError::transport(self)
    }
}

impl From<SerialError> for SensordError {
    fn from(err: SerialError) -> Self {
        err.into_domain()
    }
}
