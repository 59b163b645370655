//! Attach-stream demultiplexer.
//!
//! The engine multiplexes a container's stdout and stderr onto one HTTP
//! response body. Each chunk is preceded by an 8-byte header: byte 0 is
//! the stream (1 = stdout, 2 = stderr), bytes 4..8 are the payload length
//! as a big-endian u32. Chunks may be split or coalesced arbitrarily by
//! the transport; this module reassembles them and emits whole payloads
//! in stream order.

use hyper::body::HttpBody;
use hyper::Body;
use tokio::sync::mpsc;
use tracing::debug;

/// Size of the engine's stream-frame header.
const STREAM_HEADER_LEN: usize = 8;

/// Stream selector byte for stdout.
const STREAM_STDOUT: u8 = 1;

/// Stream selector byte for stderr.
const STREAM_STDERR: u8 = 2;

/// One demultiplexed chunk of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachEvent {
    /// Bytes the container wrote to stdout.
    Stdout(Vec<u8>),
    /// Bytes the container wrote to stderr.
    Stderr(Vec<u8>),
}

/// Demultiplex an attach response body until it ends.
///
/// The receiver side observes end-of-stream (container exit or engine
/// close) as channel closure. Within the body, stdout bytes observed
/// before stderr bytes are emitted first; ordering is the engine's.
pub(crate) async fn demux(container: String, mut body: Body, events: mpsc::UnboundedSender<AttachEvent>) {
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(container = %container, error = %e, "attach stream error");
                return;
            }
        };
        buf.extend_from_slice(&chunk);
        while buf.len() >= STREAM_HEADER_LEN {
            let stream = buf[0];
            let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
            if buf.len() < STREAM_HEADER_LEN + len {
                break;
            }
            let payload = buf[STREAM_HEADER_LEN..STREAM_HEADER_LEN + len].to_vec();
            buf.drain(..STREAM_HEADER_LEN + len);
            let event = match stream {
                STREAM_STDOUT => AttachEvent::Stdout(payload),
                STREAM_STDERR => AttachEvent::Stderr(payload),
                other => {
                    // Stream 0 is stdin echo; nothing to route.
                    debug!(container = %container, stream = other, "ignoring stream frame");
                    continue;
                }
            };
            if events.send(event).is_err() {
                return;
            }
        }
    }
    debug!(container = %container, "attach stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![stream, 0, 0, 0];
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    async fn collect(chunks: Vec<Vec<u8>>) -> Vec<AttachEvent> {
        let (mut body_tx, body) = Body::channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let demux_task = tokio::spawn(demux("c0".to_string(), body, events_tx));
        for chunk in chunks {
            body_tx.send_data(chunk.into()).await.unwrap();
        }
        drop(body_tx);
        demux_task.await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = events_rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_demux_routes_streams_separately() {
        let mut bytes = stream_frame(1, b"out");
        bytes.extend_from_slice(&stream_frame(2, b"err"));
        bytes.extend_from_slice(&stream_frame(1, b"out2"));
        let events = collect(vec![bytes]).await;
        assert_eq!(
            events,
            vec![
                AttachEvent::Stdout(b"out".to_vec()),
                AttachEvent::Stderr(b"err".to_vec()),
                AttachEvent::Stdout(b"out2".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_demux_handles_split_frames() {
        let frame = stream_frame(1, b"split across reads");
        let (a, b) = frame.split_at(5);
        let events = collect(vec![a.to_vec(), b.to_vec()]).await;
        assert_eq!(events, vec![AttachEvent::Stdout(b"split across reads".to_vec())]);
    }

    #[tokio::test]
    async fn test_demux_skips_unknown_stream() {
        let mut bytes = stream_frame(0, b"stdin echo");
        bytes.extend_from_slice(&stream_frame(2, b"err"));
        let events = collect(vec![bytes]).await;
        assert_eq!(events, vec![AttachEvent::Stderr(b"err".to_vec())]);
    }

    #[tokio::test]
    async fn test_demux_ends_on_body_close() {
        // Partial header left in the buffer is dropped at end of stream.
        let events = collect(vec![vec![1, 0, 0]]).await;
        assert!(events.is_empty());
    }
}
