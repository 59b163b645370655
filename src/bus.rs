//! Framed Unix-socket transport.
//!
//! The control socket speaks length-prefixed frames (see
//! `invoker-protocol`). This module owns the listening socket and the
//! per-connection I/O workers: one reader task reassembling frames, one
//! writer task draining a queue so concurrent senders never interleave
//! frame bytes. Everything observable funnels into a single
//! [`BusEvent`] stream consumed by the session router.
//!
//! An I/O error on one connection tears down only that connection. A
//! partial frame buffered at EOF is discarded.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use invoker_protocol::{encode_frame, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{unix::OwnedWriteHalf, UnixListener};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Read buffer size for connection reader tasks.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Identifier of one accepted connection, unique for the process lifetime.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0);

/// Events emitted by the bus, in per-connection arrival order.
#[derive(Debug)]
pub enum BusEvent {
    /// A new connection was accepted.
    Connected(Connection),
    /// One complete frame arrived on a connection.
    Frame(ConnId, Vec<u8>),
    /// A connection ended (peer close or I/O error).
    Closed(ConnId),
}

#[derive(Debug)]
enum WriteOp {
    Frame(Vec<u8>),
    Shutdown,
}

/// Writable handle to one accepted connection.
///
/// Clones share the connection; frames queue in order and are written
/// atomically by the connection's writer task.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnId,
    writes: mpsc::UnboundedSender<WriteOp>,
}

impl Connection {
    /// Connection identifier.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue one frame for delivery. Delivery order matches call order;
    /// errors after the connection died are silently dropped (the
    /// [`BusEvent::Closed`] event is the authoritative signal).
    pub fn send(&self, payload: &[u8]) {
        let _ = self.writes.send(WriteOp::Frame(encode_frame(payload)));
    }

    /// Close the connection after any queued frames are flushed.
    pub fn close(&self) {
        let _ = self.writes.send(WriteOp::Shutdown);
    }

    /// Handle with no transport behind it; sends vanish.
    #[cfg(test)]
    pub(crate) fn disconnected(id: ConnId) -> Self {
        let (writes, _) = mpsc::unbounded_channel();
        Self { id, writes }
    }

    /// Handle whose written frames are captured for assertions.
    #[cfg(test)]
    pub(crate) fn capture(id: ConnId) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (writes, mut writes_rx) = mpsc::unbounded_channel();
        let (captured_tx, captured_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(op) = writes_rx.recv().await {
                if let WriteOp::Frame(bytes) = op {
                    if captured_tx.send(bytes).is_err() {
                        break;
                    }
                }
            }
        });
        (Self { id, writes }, captured_rx)
    }
}

/// Listening control socket.
///
/// Dropping the server unlinks the socket path.
pub struct BusServer {
    path: PathBuf,
}

impl BusServer {
    /// Bind the control socket and start accepting connections.
    ///
    /// A stale socket file from a previous run is unlinked before
    /// binding. Bind failures are fatal and reported synchronously.
    pub fn bind(path: &Path) -> Result<(Self, mpsc::UnboundedReceiver<BusEvent>)> {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        let listener = UnixListener::bind(path).map_err(|source| Error::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(listener, events_tx));
        Ok((
            Self {
                path: path.to_path_buf(),
            },
            events_rx,
        ))
    }

    /// Path the server is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(listener: UnixListener, events: mpsc::UnboundedSender<BusEvent>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                // Transient accept errors (EMFILE and friends) must not
                // kill the listener.
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let connection = Connection {
            id,
            writes: writes_tx,
        };
        debug!(conn = id, "connection accepted");
        if events.send(BusEvent::Connected(connection)).is_err() {
            return;
        }
        tokio::spawn(write_loop(id, write_half, writes_rx));
        tokio::spawn(read_loop(id, read_half, events.clone()));
    }
}

async fn write_loop(
    id: ConnId,
    mut half: OwnedWriteHalf,
    mut writes: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = writes.recv().await {
        match op {
            WriteOp::Frame(bytes) => {
                if let Err(e) = half.write_all(&bytes).await {
                    debug!(conn = id, error = %e, "write failed");
                    return;
                }
            }
            WriteOp::Shutdown => {
                let _ = half.shutdown().await;
                return;
            }
        }
    }
}

async fn read_loop(
    id: ConnId,
    mut half: tokio::net::unix::OwnedReadHalf,
    events: mpsc::UnboundedSender<BusEvent>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(conn = id, error = %e, "read failed");
                break;
            }
        };
        decoder.extend(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if events.send(BusEvent::Frame(id, frame)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(conn = id, error = %e, "dropping connection");
                    let _ = events.send(BusEvent::Closed(id));
                    return;
                }
            }
        }
    }
    if decoder.buffered() > 0 {
        debug!(
            conn = id,
            bytes = decoder.buffered(),
            "discarding partial frame at close"
        );
    }
    let _ = events.send(BusEvent::Closed(id));
}

/// Connect to a control socket as a client and return the raw stream.
///
/// Used by tests and local tooling; operators use the blocking client in
/// `invoker-protocol`.
pub async fn connect(path: &Path) -> Result<tokio::net::UnixStream> {
    Ok(tokio::net::UnixStream::connect(path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<BusEvent>) -> BusEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("bus gone")
    }

    #[tokio::test]
    async fn test_frames_delivered_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.sock");
        let (_server, mut events) = BusServer::bind(&path).unwrap();

        let mut client = connect(&path).await.unwrap();
        let BusEvent::Connected(_) = next_event(&mut events).await else {
            panic!("expected Connected");
        };

        // Two frames written as one syscall, then a third split in half.
        let mut bytes = encode_frame(b"one");
        bytes.extend_from_slice(&encode_frame(b"two"));
        client.write_all(&bytes).await.unwrap();
        let third = encode_frame(b"three");
        client.write_all(&third[..3]).await.unwrap();
        client.flush().await.unwrap();
        client.write_all(&third[3..]).await.unwrap();

        for expected in [b"one".as_slice(), b"two", b"three"] {
            let BusEvent::Frame(_, frame) = next_event(&mut events).await else {
                panic!("expected Frame");
            };
            assert_eq!(frame, expected);
        }
    }

    #[tokio::test]
    async fn test_zero_length_frame_is_delivered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.sock");
        let (_server, mut events) = BusServer::bind(&path).unwrap();

        let mut client = connect(&path).await.unwrap();
        let BusEvent::Connected(_) = next_event(&mut events).await else {
            panic!("expected Connected");
        };
        client.write_all(&encode_frame(b"")).await.unwrap();

        let BusEvent::Frame(_, frame) = next_event(&mut events).await else {
            panic!("expected Frame");
        };
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn test_close_discards_partial_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.sock");
        let (_server, mut events) = BusServer::bind(&path).unwrap();

        let mut client = connect(&path).await.unwrap();
        let BusEvent::Connected(conn) = next_event(&mut events).await else {
            panic!("expected Connected");
        };
        // Header promising 100 bytes, then EOF.
        client.write_all(&100u32.to_le_bytes()).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);

        let BusEvent::Closed(id) = next_event(&mut events).await else {
            panic!("expected Closed");
        };
        assert_eq!(id, conn.id());
    }

    #[tokio::test]
    async fn test_server_sends_frames_to_client() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.sock");
        let (_server, mut events) = BusServer::bind(&path).unwrap();

        let mut client = connect(&path).await.unwrap();
        let BusEvent::Connected(conn) = next_event(&mut events).await else {
            panic!("expected Connected");
        };
        conn.send(b"STDOUT 7\nhi");

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 1024];
        let frame = loop {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0);
            decoder.extend(&buf[..n]);
            if let Some(frame) = decoder.next_frame().unwrap() {
                break frame;
            }
        };
        assert_eq!(frame, b"STDOUT 7\nhi");
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.sock");
        {
            let (_server, _events) = BusServer::bind(&path).unwrap();
        }
        // First server dropped; binding again over the leftover path works.
        let (_server, _events) = BusServer::bind(&path).unwrap();
    }
}
