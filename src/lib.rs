//! invoker - container-workload executor for coordinator-submitted tasks
//!
//! The invoker receives tasks from an upstream coordinator over a
//! WebSocket, runs each one as an isolated set of containers, and lets
//! the task's own driver program (the operator) orchestrate those
//! containers over a framed Unix-socket protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │  coordinator (WebSocket)                              │
//! └──────────────────────┬────────────────────────────────┘
//!                        │ START / STOP        verdicts, exits, errors
//! ┌──────────────────────┴────────────────────────────────┐
//! │  gateway ──▶ registry ──▶ engine client ──▶ container │
//! │                 │                              engine │
//! │  bus ──▶ session router ──▶ sessions ──┘              │
//! └──────────────────────┬────────────────────────────────┘
//!                        │ framed Unix socket
//! ┌──────────────────────┴────────────────────────────────┐
//! │  operator container (driver program, per task)        │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! A task arrives as a tar archive carrying a Dockerfile. The registry
//! builds the operator image, provisions per-task networks and a volume
//! directory, and starts the operator container with a one-time
//! `INIT_TOKEN`. The operator connects back through the mounted control
//! socket, authenticates with that token, and from then on builds
//! images, runs containers, pipes their stdio, and reports verdicts.
//!
//! Isolation is per task: networks, volume trees, images, containers,
//! and tokens are all disambiguated by task id and never shared. State
//! lives in memory only; a restarted invoker starts empty.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod archive;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod session;

// Re-export main types for convenience
pub use bus::{BusEvent, BusServer, Connection};
pub use config::Config;
pub use engine::{AttachEvent, CreateOptions, EngineClient};
pub use error::{EngineErrorKind, Error, Result};
pub use gateway::{Gateway, Outbound, UpstreamSink};
pub use registry::{Task, TaskRegistry, TaskState};
pub use session::{SessionHandle, SessionRouter};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
