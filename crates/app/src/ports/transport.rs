//! Transport port: the duplex byte stream a sensor talks over.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use sensord_domain::error::SensordError;
use sensord_domain::sensor::SensorConfig;

/// A duplex byte stream owned by exactly one sensor instance.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// Type-erased transport handed to a sensor instance.
pub type BoxTransport = Box<dyn Transport>;

/// Opens the transport referenced by a sensor configuration.
pub trait TransportOpener: Send + Sync + 'static {
    /// Open `config.transport` at `baud_rate`.
    fn open(
        &self,
        config: &SensorConfig,
        baud_rate: u32,
    ) -> impl Future<Output = Result<BoxTransport, SensordError>> + Send;
}
