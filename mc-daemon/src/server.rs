//! Unix Socket Server
//!
//! Line-delimited JSON bridge between the mesh stack and the device hub.
//! Every line a client writes is one `WireEnvelope`; every line the server
//! writes is one `HostMessage`. Host messages from all devices are sent to
//! every connected client.
//!
//! # Limits
//! - **Connections**: maximum concurrent clients enforced
//! - **Messages**: lines above `MAX_MESSAGE_SIZE` are rejected before buffering
//! - **Timeouts**: writes that stall are dropped with the connection

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mc_protocol::{parse_envelope, HostMessage, MAX_MESSAGE_SIZE};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::hub::Hub;

// ============================================================================
// Constants
// ============================================================================

/// Maximum concurrent client connections
const MAX_CONNECTIONS: usize = 16;

/// Write timeout per message
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lines queued per client writer
const CLIENT_QUEUE: usize = 256;

/// Socket permissions (owner and group read/write)
const SOCKET_MODE: u32 = 0o660;

static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Read one newline-terminated line without buffering more than `max_len`
/// bytes. Returns 0 at EOF.
pub(crate) async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(out.len());
        }

        let mut take_len = available.len();
        let mut found_newline = false;
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            take_len = pos + 1;
            found_newline = true;
        }

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "Message too large"));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Accept clients until `shutdown` flips to true
pub async fn run_server(socket_path: &str, hub: Arc<Hub>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let path = Path::new(socket_path);

    if path.exists() {
        let metadata = path.symlink_metadata()?;
        if metadata.file_type().is_symlink() {
            anyhow::bail!("Socket path is a symlink, refusing to use it");
        }
        std::fs::remove_file(path)?;
        debug!("Removed stale socket file");
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

    info!(
        socket = socket_path,
        mode = SOCKET_MODE,
        max_conn = MAX_CONNECTIONS,
        max_msg = MAX_MESSAGE_SIZE,
        "Listening"
    );

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, _addr)) => {
                    let current = ACTIVE_CONNECTIONS.load(Ordering::SeqCst);
                    if current >= MAX_CONNECTIONS {
                        warn!(current, "Connection limit reached, rejecting client");
                        drop(stream);
                        continue;
                    }

                    ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
                    let hub = Arc::clone(&hub);
                    tokio::spawn(async move {
                        handle_client(stream, hub).await;
                        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) => error!(error = %e, "Accept error"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Shutdown requested, no longer accepting clients");
                    break;
                }
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

/// Serve one client until it disconnects
async fn handle_client(stream: UnixStream, hub: Arc<Hub>) {
    let (reader, writer) = stream.into_split();
    let (line_tx, line_rx) = mpsc::channel::<String>(CLIENT_QUEUE);

    let writer_task = tokio::spawn(write_lines(writer, line_rx));
    let forward_task = tokio::spawn(forward_host_messages(hub.subscribe(), line_tx.clone()));

    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(4096);
    let mut received: u64 = 0;

    loop {
        match read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE).await {
            Ok(0) => {
                debug!(received, "Client disconnected");
                break;
            }
            Ok(n) => {
                received += 1;
                trace!(bytes = n, "Envelope received");

                let Ok(text) = std::str::from_utf8(&line) else {
                    send_error(&line_tx, HostMessage::error(None, None, "Invalid message encoding")).await;
                    continue;
                };
                if text.trim().is_empty() {
                    continue;
                }

                let envelope = match parse_envelope(text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!(error = %e, "Rejected envelope");
                        send_error(&line_tx, HostMessage::error(None, None, e)).await;
                        continue;
                    }
                };

                let device = envelope.device.clone();
                let id = envelope.id;
                let kind = envelope.event.kind();
                if let Err(e) = hub.dispatch(envelope).await {
                    debug!(device = %device, event = kind, error = %e, "Dispatch failed");
                    send_error(&line_tx, HostMessage::error(Some(device), Some(id), e.to_string())).await;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(max = MAX_MESSAGE_SIZE, "Message too large, closing connection");
                send_error(&line_tx, HostMessage::error(None, None, "Message too large")).await;
                break;
            }
            Err(e) => {
                error!(error = %e, "Read error");
                break;
            }
        }
    }

    forward_task.abort();
    drop(line_tx);
    let _ = writer_task.await;
}

async fn send_error(line_tx: &mpsc::Sender<String>, message: HostMessage) {
    match message.to_line() {
        Ok(line) => {
            let _ = line_tx.send(line).await;
        }
        Err(e) => warn!(error = %e, "Could not serialize error message"),
    }
}

async fn forward_host_messages(mut rx: broadcast::Receiver<HostMessage>, line_tx: mpsc::Sender<String>) {
    loop {
        match rx.recv().await {
            Ok(message) => match message.to_line() {
                Ok(line) => {
                    if line_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Dropping host message"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Client too slow, host messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_lines(mut writer: tokio::net::unix::OwnedWriteHalf, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        let result = timeout(WRITE_TIMEOUT, async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            Ok::<_, std::io::Error>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Write error");
                break;
            }
            Err(_) => {
                warn!("Write timeout, dropping client");
                break;
            }
        }
    }
}
