//! Bridge between a blocking serial port and an async duplex stream.

use std::io::{self, Read, Write};
use std::thread;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use crate::error::SerialError;

/// Capacity of the in-memory duplex handed to the sensor instance.
const DUPLEX_CAPACITY: usize = 4096;
/// Chunks in flight between the pump threads and the bridge task.
const CHANNEL_DEPTH: usize = 32;
const CHUNK: usize = 256;

/// Start the pump threads and the bridge task, returning the stream end the
/// sensor instance owns. Dropping that stream stops the pumps and closes the
/// port.
pub(crate) fn spawn<R, W>(name: &str, reader: R, writer: W) -> Result<DuplexStream, SerialError>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (ours, theirs) = tokio::io::duplex(DUPLEX_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_DEPTH);

    thread::Builder::new()
        .name(format!("serial-rx-{name}"))
        .spawn(move || read_port(reader, &inbound_tx))
        .map_err(SerialError::Thread)?;
    thread::Builder::new()
        .name(format!("serial-tx-{name}"))
        .spawn(move || write_port(writer, outbound_rx))
        .map_err(SerialError::Thread)?;
    tokio::spawn(pump(theirs, inbound_rx, outbound_tx));
    Ok(ours)
}

fn read_port(mut port: impl Read, tx: &mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; CHUNK];
    loop {
        match port.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {
                if tx.is_closed() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(%err, "serial read failed");
                break;
            }
        }
    }
    tracing::debug!("serial reader stopped");
}

fn write_port(mut port: impl Write, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.blocking_recv() {
        if let Err(err) = port.write_all(&bytes).and_then(|()| port.flush()) {
            tracing::warn!(%err, "serial write failed");
            break;
        }
    }
    tracing::debug!("serial writer stopped");
}

async fn pump(
    stream: DuplexStream,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = [0u8; CHUNK];
    let mut device_open = true;
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if outbound.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            },
            bytes = inbound.recv(), if device_open => match bytes {
                Some(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                None => {
                    device_open = false;
                    if let Err(err) = writer.shutdown().await {
                        tracing::debug!(%err, "closing serial stream failed");
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn should_move_bytes_both_ways() {
        let written = SharedBuf::default();
        let mut stream = spawn(
            "desk",
            io::Cursor::new(b"Done\nleapMMW:/>".to_vec()),
            written.clone(),
        )
        .unwrap();

        stream.write_all(b"sensorStart\n").await.unwrap();

        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"Done\nleapMMW:/>");

        for _ in 0..100 {
            if written.0.lock().unwrap().as_slice() == b"sensorStart\n" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("command never reached the port");
    }

    #[tokio::test]
    async fn should_end_stream_when_port_closes() {
        let mut stream = spawn("hall", io::Cursor::new(Vec::new()), io::sink()).unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }
}
