//! In-memory doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use sensord_domain::error::SensordError;
use sensord_domain::event::Event;
use sensord_domain::sensor::SensorConfig;

use crate::ports::{BoxTransport, EventSink, SinkError, TransportOpener};

/// Hands out one end of an in-memory duplex per sensor and keeps the other
/// end so tests can play the device.
#[derive(Default)]
pub struct DuplexOpener {
    devices: Mutex<HashMap<String, DuplexStream>>,
    missing: Vec<String>,
}

impl DuplexOpener {
    /// Opener failing with "no such port" for every transport in `missing`.
    pub fn with_missing<I, S>(missing: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: Mutex::default(),
            missing: missing.into_iter().map(Into::into).collect(),
        }
    }

    /// Device side of the sensor's transport.
    pub fn take(&self, name: &str) -> BufReader<DuplexStream> {
        BufReader::new(self.devices.lock().unwrap().remove(name).unwrap())
    }
}

impl TransportOpener for Arc<DuplexOpener> {
    async fn open(
        &self,
        config: &SensorConfig,
        _baud_rate: u32,
    ) -> Result<BoxTransport, SensordError> {
        if self.missing.contains(&config.transport) {
            return Err(SensordError::transport(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such port",
            )));
        }
        let (ours, theirs) = tokio::io::duplex(1024);
        self.devices
            .lock()
            .unwrap()
            .insert(config.name.clone(), theirs);
        Ok(Box::new(ours))
    }
}

/// Read one command line from the device side, check it, then write `reply`.
pub async fn answer(device: &mut BufReader<DuplexStream>, expected: &str, reply: &[u8]) {
    let mut line = String::new();
    device.read_line(&mut line).await.unwrap();
    assert_eq!(line.trim(), expected);
    device.get_mut().write_all(reply).await.unwrap();
}

/// Sink forwarding every delivered event to a channel.
pub struct ChannelSink {
    pub name: &'static str,
    pub tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new(name: &'static str) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { name, tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn name(&self) -> String {
        self.name.to_string()
    }

    async fn deliver(&self, event: &Event) -> Result<(), SinkError> {
        self.tx
            .send(event.clone())
            .map_err(|err| SinkError::Unavailable(err.to_string()))
    }
}
