//! Reconnecting outbound WebSocket endpoints and their [`EventSink`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use sensord_app::ports::{EventSink, SinkError};
use sensord_domain::event::Event;

use crate::config::EndpointConfig;
use crate::error::WsError;

/// Events waiting for the socket.
const OUTBOX_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Ended {
    Shutdown,
    Disconnected,
}

/// One outbound connection, shared by every sensor bound to it.
pub struct WsEndpoint {
    name: String,
    outbox: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl WsEndpoint {
    /// Spawn the connection task. Must be called from within a tokio runtime.
    #[must_use]
    pub fn connect(config: &EndpointConfig) -> Self {
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (stop, stop_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));
        let driver = tokio::spawn(drive(
            config.clone(),
            rx,
            stop_rx,
            Arc::clone(&connected),
        ));
        Self {
            name: config.name.clone(),
            outbox,
            connected,
            stop,
            driver: Mutex::new(Some(driver)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue one text frame.
    ///
    /// # Errors
    ///
    /// Fails without waiting when the endpoint is disconnected, backlogged
    /// or shut down.
    pub fn send(&self, payload: String) -> Result<(), WsError> {
        if !self.is_connected() {
            return Err(WsError::NotConnected(self.name.clone()));
        }
        self.outbox.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => WsError::Backlogged(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => WsError::Closed(self.name.clone()),
        })
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut driver) = driver
            && tokio::time::timeout(CLOSE_GRACE, &mut driver).await.is_err()
        {
            driver.abort();
        }
        tracing::debug!(endpoint = %self.name, "WebSocket endpoint closed");
    }
}

async fn drive(
    config: EndpointConfig,
    mut outbox: mpsc::Receiver<String>,
    mut stop: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
) {
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
    let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms);
    loop {
        let attempt = tokio::time::timeout(
            connect_timeout,
            tokio_tungstenite::connect_async(config.uri.as_str()),
        );
        let attempt = tokio::select! {
            _ = stop.changed() => break,
            attempt = attempt => attempt,
        };
        match attempt {
            Ok(Ok((socket, _))) => {
                tracing::info!(endpoint = %config.name, uri = %config.uri, "WebSocket connected");
                connected.store(true, Ordering::Release);
                let ended = forward(&config.name, socket, &mut outbox, &mut stop).await;
                connected.store(false, Ordering::Release);
                if matches!(ended, Ended::Shutdown) {
                    break;
                }
                tracing::warn!(endpoint = %config.name, "WebSocket disconnected");
            }
            Ok(Err(err)) => {
                tracing::warn!(endpoint = %config.name, %err, "WebSocket connection failed");
            }
            Err(_) => {
                tracing::warn!(endpoint = %config.name, "WebSocket connection timed out");
            }
        }
        tokio::select! {
            _ = stop.changed() => break,
            () = tokio::time::sleep(reconnect_delay) => {}
        }
    }
}

async fn forward(
    name: &str,
    socket: Socket,
    outbox: &mut mpsc::Receiver<String>,
    stop: &mut watch::Receiver<bool>,
) -> Ended {
    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            _ = stop.changed() => {
                if let Err(err) = write.send(Message::Close(None)).await {
                    tracing::debug!(endpoint = %name, %err, "WebSocket close failed");
                }
                return Ended::Shutdown;
            }
            payload = outbox.recv() => match payload {
                Some(text) => {
                    if let Err(err) = write.send(Message::Text(text)).await {
                        tracing::warn!(endpoint = %name, %err, "WebSocket send failed");
                        return Ended::Disconnected;
                    }
                }
                None => return Ended::Shutdown,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => return Ended::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(endpoint = %name, %err, "WebSocket read failed");
                    return Ended::Disconnected;
                }
            },
        }
    }
}

/// [`EventSink`] sending event JSON as text frames to one endpoint.
#[derive(Clone)]
pub struct WsSink {
    endpoint: Arc<WsEndpoint>,
}

impl WsSink {
    pub fn new(endpoint: Arc<WsEndpoint>) -> Self {
        Self { endpoint }
    }
}

impl EventSink for WsSink {
    fn name(&self) -> String {
        format!("ws:{}", self.endpoint.name())
    }

    async fn deliver(&self, event: &Event) -> Result<(), SinkError> {
        let payload = event.to_json()?;
        self.endpoint
            .send(payload)
            .map_err(|err| SinkError::Unavailable(err.to_string()))
    }
}

/// All configured endpoints, by name.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: BTreeMap<String, Arc<WsEndpoint>>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn connect(configs: &[EndpointConfig]) -> Self {
        let endpoints = configs
            .iter()
            .map(|config| {
                tracing::info!(endpoint = %config.name, uri = %config.uri, "WebSocket endpoint configured");
                (config.name.clone(), Arc::new(WsEndpoint::connect(config)))
            })
            .collect();
        Self { endpoints }
    }

    /// Sink for the endpoint named `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`WsError::UnknownEndpoint`] when no such endpoint exists.
    pub fn sink(&self, endpoint: &str) -> Result<WsSink, WsError> {
        self.endpoints
            .get(endpoint)
            .map(|endpoint| WsSink::new(Arc::clone(endpoint)))
            .ok_or_else(|| WsError::UnknownEndpoint(endpoint.to_string()))
    }

    pub async fn shutdown(&self) {
        for endpoint in self.endpoints.values() {
            endpoint.shutdown().await;
        }
    }
}
