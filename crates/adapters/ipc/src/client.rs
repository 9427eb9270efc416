//! Control client used by the CLI.

use std::path::Path;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use sensord_app::control::{RpcRequest, RpcResponse};
use sensord_domain::event::Event;

use crate::error::IpcError;

/// One connection to the daemon's control socket.
pub struct IpcClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl IpcClient {
    /// # Errors
    ///
    /// Returns [`IpcError::Connect`] when nothing listens on `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| IpcError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 1,
        })
    }

    /// Call `method` and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Rpc`] when the daemon answers with an error, or an
    /// I/O or decoding error when the exchange itself fails.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, IpcError> {
        let id = self.next_id;
        self.next_id += 1;
        let mut bytes = serde_json::to_vec(&RpcRequest::new(id, method, params))?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;

        let line = self.lines.next_line().await?.ok_or(IpcError::Closed)?;
        let response: RpcResponse = serde_json::from_str(&line)?;
        Ok(response.into_result()?)
    }

    /// Switch the connection into an event stream.
    ///
    /// # Errors
    ///
    /// Same as [`IpcClient::call`].
    pub async fn subscribe(mut self) -> Result<EventStream, IpcError> {
        self.call("events.subscribe", Value::Null).await?;
        Ok(EventStream {
            lines: self.lines,
            _writer: self.writer,
        })
    }
}

/// Events pushed by the daemon after `events.subscribe`.
pub struct EventStream {
    lines: Lines<BufReader<OwnedReadHalf>>,
    // Held open: the daemon ends the stream once this half closes.
    _writer: OwnedWriteHalf,
}

impl EventStream {
    /// Next event, or `None` once the daemon closes the stream.
    ///
    /// # Errors
    ///
    /// Returns an error when the socket fails or a line is not an event.
    pub async fn next_event(&mut self) -> Result<Option<Event>, IpcError> {
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }
}
