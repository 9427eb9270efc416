//! Unix-domain-socket control server.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;

use sensord_app::control::{ControlReply, ControlService, RpcError, RpcResponse, codes};
use sensord_app::event_bus::Subscription;
use sensord_app::ports::TransportOpener;

use crate::error::IpcError;

/// Permissions of the socket file: owner and group may connect.
const SOCKET_MODE: u32 = 0o660;

/// Longest request line accepted, terminator included.
const MAX_REQUEST_LINE: usize = 64 * 1024;

/// A bound control socket, ready to serve.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the control socket at `path`.
    ///
    /// A socket file nobody answers on is stale and gets replaced.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::AlreadyRunning`] when a daemon answers on `path`,
    /// [`IpcError::Bind`] when the socket cannot be created.
    pub async fn bind(path: impl Into<PathBuf>) -> Result<Self, IpcError> {
        let path = path.into();
        if path.exists() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(IpcError::AlreadyRunning(path));
            }
            tracing::info!(path = %path.display(), "removing stale control socket");
            std::fs::remove_file(&path).map_err(|source| IpcError::Bind {
                path: path.clone(),
                source,
            })?;
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| IpcError::Bind {
                path: path.clone(),
                source,
            })?;
        }
        let listener = UnixListener::bind(&path).map_err(|source| IpcError::Bind {
            path: path.clone(),
            source,
        })?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE)).map_err(
            |source| IpcError::Bind {
                path: path.clone(),
                source,
            },
        )?;
        tracing::info!(path = %path.display(), "control socket listening");
        Ok(Self { listener, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` resolves, then close every
    /// connection and remove the socket file.
    pub async fn serve<O, F>(self, service: Arc<ControlService<O>>, shutdown: F)
    where
        O: TransportOpener,
        F: Future<Output = ()> + Send,
    {
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let service = Arc::clone(&service);
                        connections.spawn(async move {
                            if let Err(err) = handle_connection(stream, service).await {
                                tracing::debug!(%err, "control connection ended with error");
                            }
                        });
                    }
                    Err(err) => tracing::warn!(%err, "unable to accept control connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        connections.shutdown().await;
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), %err, "unable to remove control socket");
        }
        tracing::info!("control socket closed");
    }
}

async fn handle_connection<O: TransportOpener>(
    stream: UnixStream,
    service: Arc<ControlService<O>>,
) -> Result<(), IpcError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    tracing::debug!("control connection opened");
    loop {
        let line = match next_request(&mut reader, &mut buf).await? {
            Request::Line(line) => line,
            Request::TooLong => {
                tracing::warn!(limit = MAX_REQUEST_LINE, "control request too long");
                let error = RpcError::new(
                    codes::PARSE_ERROR,
                    format!("parse error: request longer than {MAX_REQUEST_LINE} bytes"),
                );
                write_line(&mut writer, &RpcResponse::failure(Value::Null, error)).await?;
                continue;
            }
            Request::Closed => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        match service.handle_line(&line).await {
            ControlReply::Response(response) => write_line(&mut writer, &response).await?,
            ControlReply::Subscribe(response) => {
                let events = service.subscribe();
                write_line(&mut writer, &response).await?;
                return stream_events(events, reader, writer).await;
            }
        }
    }
    tracing::debug!("control connection closed");
    Ok(())
}

enum Request {
    Line(String),
    TooLong,
    Closed,
}

/// Read the next newline-terminated request, never buffering more than
/// [`MAX_REQUEST_LINE`] bytes. The rest of an oversized line is discarded.
async fn next_request(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
) -> std::io::Result<Request> {
    buf.clear();
    let limit = u64::try_from(MAX_REQUEST_LINE).unwrap_or(u64::MAX);
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(Request::Closed);
    }
    if buf.last() != Some(&b'\n') && read >= MAX_REQUEST_LINE {
        loop {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            if let Some(end) = available.iter().position(|b| *b == b'\n') {
                reader.consume(end + 1);
                break;
            }
            let len = available.len();
            reader.consume(len);
        }
        return Ok(Request::TooLong);
    }
    Ok(Request::Line(String::from_utf8_lossy(buf).into_owned()))
}

async fn stream_events(
    mut events: Subscription,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
) -> Result<(), IpcError> {
    let mut buf = Vec::new();
    loop {
        tokio::select! {
            received = events.next() => match received {
                Some(event) => write_line(&mut writer, &event).await?,
                None => return Ok(()),
            },
            request = next_request(&mut reader, &mut buf) => match request? {
                Request::Line(_) | Request::TooLong => {}
                Request::Closed => return Ok(()),
            },
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, value: &impl Serialize) -> Result<(), IpcError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    Ok(())
}
