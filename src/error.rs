//! Error types for the invoker.
//!
//! One enum covers the whole binary, grouped by the failure domain each
//! variant belongs to: transport, protocol, auth, engine, resource.
//! Engine failures keep the HTTP status and a coarse [`EngineErrorKind`]
//! so callers can react without string-matching messages.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the invoker's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a container-engine failure, derived from the HTTP
/// status of the engine's reply (or its absence).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The engine endpoint could not be reached at all.
    Unreachable,
    /// The engine rejected the request as malformed (4xx other than below).
    BadRequest,
    /// The referenced container/image/network does not exist (404).
    NotFound,
    /// The operation conflicts with current engine state (409).
    Conflict,
    /// The engine failed internally (5xx).
    Internal,
}

impl EngineErrorKind {
    /// Map an HTTP status code to a kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => EngineErrorKind::NotFound,
            409 => EngineErrorKind::Conflict,
            400..=499 => EngineErrorKind::BadRequest,
            _ => EngineErrorKind::Internal,
        }
    }
}

/// Errors that can occur in invoker operations.
#[derive(Debug, Error)]
pub enum Error {
    // ========================================================================
    // Transport
    // ========================================================================
    /// Binding the control socket failed. This is the only fatal error.
    #[error("control socket bind failed: {path}: {source}")]
    Bind {
        /// Socket path that could not be bound.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A connection-level I/O operation failed.
    #[error("connection i/o failed: {0}")]
    ConnectionIo(#[from] std::io::Error),

    /// Connecting to the upstream coordinator failed.
    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    // ========================================================================
    // Protocol
    // ========================================================================
    /// Frame reassembly failed (oversized frame).
    #[error("frame decode failed: {0}")]
    Frame(#[from] invoker_protocol::FrameError),

    /// An operator command did not parse.
    #[error("command parse failed: {0}")]
    Command(#[from] invoker_protocol::command::CommandError),

    /// An upstream message did not match the `<taskId> <type>` header form.
    #[error("malformed upstream message: {0}")]
    UpstreamMessage(String),

    // ========================================================================
    // Engine
    // ========================================================================
    /// The container engine answered outside the success range.
    #[error("engine request failed ({kind:?}): {message}")]
    Engine {
        /// Coarse failure classification.
        kind: EngineErrorKind,
        /// HTTP status, absent when the engine was unreachable.
        status: Option<u16>,
        /// Engine diagnostics (response body or transport error).
        message: String,
    },

    /// An image build was rejected by the engine.
    #[error("image build failed: {tag}: {message}")]
    BuildFailed {
        /// Tag the image would have carried.
        tag: String,
        /// Engine diagnostics.
        message: String,
    },

    // ========================================================================
    // Resource
    // ========================================================================
    /// A build context path is not a directory.
    #[error("build context is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Reading or packing an archive failed.
    #[error("archive operation failed: {0}")]
    Archive(String),

    /// Creating or removing a task volume directory failed.
    #[error("volume provisioning failed: {path}: {source}")]
    Volume {
        /// Directory being provisioned.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A task with this id is already registered.
    #[error("task already exists: {0}")]
    TaskExists(String),

    /// No task with this id is registered.
    #[error("task not found: {0}")]
    TaskNotFound(String),
}

impl Error {
    /// Engine error from a reply status and body.
    pub fn engine(status: u16, message: impl Into<String>) -> Self {
        Error::Engine {
            kind: EngineErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
        }
    }

    /// Engine error for transport-level failures.
    pub fn engine_unreachable(message: impl Into<String>) -> Self {
        Error::Engine {
            kind: EngineErrorKind::Unreachable,
            status: None,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_status() {
        assert_eq!(EngineErrorKind::from_status(404), EngineErrorKind::NotFound);
        assert_eq!(EngineErrorKind::from_status(409), EngineErrorKind::Conflict);
        assert_eq!(
            EngineErrorKind::from_status(400),
            EngineErrorKind::BadRequest
        );
        assert_eq!(EngineErrorKind::from_status(500), EngineErrorKind::Internal);
    }

    #[test]
    fn test_engine_error_keeps_diagnostics() {
        let err = Error::engine(409, "name already in use");
        assert!(err.to_string().contains("name already in use"));
        let Error::Engine { status, .. } = err else {
            panic!("expected Engine variant");
        };
        assert_eq!(status, Some(409));
    }
}
