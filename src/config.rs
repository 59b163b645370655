//! Invoker runtime configuration.
//!
//! Everything the invoker needs to know at startup: where to listen for
//! operators, where the coordinator and the container engine live, and
//! where task volumes are provisioned. Values come from CLI flags with
//! environment fallbacks; nothing is persisted.

use std::path::PathBuf;

/// Default host path of the control socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/invoker.sock";

/// Path at which the control socket is mounted inside operator containers.
pub const SOCKET_INNER_PATH: &str = "/invoker.sock";

/// Mount point of the per-task volume inside every task container.
pub const VOLUME_INNER_PATH: &str = "/volume";

/// Default upstream coordinator endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "ws://localhost:9000/invoker";

/// Default container-engine endpoint, used when `PODMAN_SOCKET` is unset.
pub const DEFAULT_ENGINE_ENDPOINT: &str = "http://localhost:8888";

/// Directory under `$HOME` holding per-task volume trees.
const VOLUMES_DIR_NAME: &str = ".invokerVolumes";

/// Resolved invoker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host path of the control socket.
    pub socket_path: PathBuf,
    /// Upstream coordinator WebSocket URL.
    pub upstream_url: String,
    /// Container-engine endpoint: `unix:///…` or `http://host:port`.
    pub engine_endpoint: String,
    /// Root directory for per-task volumes.
    pub volumes_root: PathBuf,
}

impl Config {
    /// Build a configuration from environment defaults.
    ///
    /// `PODMAN_SOCKET` overrides the engine endpoint; `HOME` anchors the
    /// volumes root (falling back to `/root` when unset, matching the
    /// container deployments this runs in).
    pub fn from_env() -> Self {
        let engine_endpoint = std::env::var("PODMAN_SOCKET")
            .unwrap_or_else(|_| DEFAULT_ENGINE_ENDPOINT.to_string());
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            engine_endpoint,
            volumes_root: PathBuf::from(home).join(VOLUMES_DIR_NAME),
        }
    }
}
