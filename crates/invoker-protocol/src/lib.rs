//! Wire protocol for invoker control-socket communication.
//!
//! This crate defines the framing and the operator command grammar spoken
//! between the invoker and the operator programs it launches inside task
//! containers. It is shared by the invoker binary (server side) and by
//! operator drivers linking against [`operator::OperatorApi`].
//!
//! # Framing
//!
//! Each logical message is prefixed with a 4-byte little-endian length
//! header. The length counts payload bytes only; payloads are arbitrary
//! bytes and may contain newlines and zeros.
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4 LE)  | payload           |
//! +----------------+-------------------+
//! ```
//!
//! # Command layer
//!
//! Inside a frame, operator commands are line-oriented UTF-8 text (see
//! [`command`]). Two commands escape the line grammar and consume the
//! remainder of the frame verbatim: `WRITE` bodies and `VERDICT` data.

#![deny(missing_docs)]

use thiserror::Error;

pub mod command;
pub mod operator;

pub use command::{InvokerMessage, OperatorCommand, RunSpec, StreamMode, Verdict};
pub use operator::{ContainerHandle, ImageHandle, OperatorApi, ReplyWaiters, RunTemplate};

/// Maximum frame size (256 MB, large enough for uploaded build contexts).
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// Length of the frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Error produced while decoding frames from a byte stream.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A frame header announced a payload larger than [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes")]
    TooLarge(u64),
}

/// Encode one payload as a length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Incremental frame reassembler.
///
/// Feed raw bytes from the transport with [`FrameDecoder::extend`], then
/// drain complete frames with [`FrameDecoder::next_frame`]. Frames come out
/// exactly once, in arrival order, regardless of how reads were chunked.
/// A trailing partial frame stays buffered until more bytes arrive; callers
/// discard it by dropping the decoder (the close path).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw transport bytes to the reassembly buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame payload, if one is buffered.
    ///
    /// Zero-length frames are valid and come out as empty payloads.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(len as u64));
        }
        let total = FRAME_HEADER_LEN + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[FRAME_HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(payload))
    }

    /// Number of bytes currently buffered (header included).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
