//! Container-engine HTTP client.
//!
//! A typed wrapper over the engine's Docker-compatible REST API. The
//! endpoint is either a `unix:///…` socket path or an `http://host:port`
//! URL; both speak the same routes:
//!
//! - `POST /build` — build an image from a tar stream
//! - `POST /containers/create`, `…/{id}/start|stop|restart|wait`
//! - `POST /containers/{id}/attach` — stdio streams (stdin upload and
//!   stdout/stderr download are separate attach requests)
//! - `POST /networks/create`, `DELETE /networks/{name}`
//! - `DELETE /containers/{id}`, `DELETE /images/{tag}`
//!
//! All calls are request-scoped except [`EngineClient::attach`], which
//! spawns a demux worker for the lifetime of the stream. The client is
//! cheap to clone and safe for concurrent use; hyper's connection pool
//! is the unit of parallelism underneath.

mod attach;

pub use attach::AttachEvent;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::archive;
use crate::error::{Error, Result};

/// Content type of tar upload bodies.
const TAR_CONTENT_TYPE: &str = "application/x-tar";

/// Content type of raw stdio stream bodies.
const RAW_STREAM_CONTENT_TYPE: &str = "application/vnd.docker.raw-stream";

/// Cap on engine diagnostics kept from an error response body.
const MAX_ERROR_BODY: usize = 16 * 1024;

/// Container configuration passed to [`EngineClient::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Command to run; empty means the image default.
    pub cmd: Vec<String>,
    /// Port bindings as (container port, host port), TCP.
    pub ports: Vec<(u16, u16)>,
    /// Environment variables as (key, value).
    pub env: Vec<(String, String)>,
    /// Bind mounts as (host path, container path).
    pub binds: Vec<(PathBuf, String)>,
    /// Engine network names to attach.
    pub networks: Vec<String>,
}

#[derive(Serialize)]
struct CreateBody {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Cmd")]
    cmd: Vec<String>,
    #[serde(rename = "Env")]
    env: Vec<String>,
    #[serde(rename = "OpenStdin")]
    open_stdin: bool,
    #[serde(rename = "Tty")]
    tty: bool,
    #[serde(rename = "AttachStdout")]
    attach_stdout: bool,
    #[serde(rename = "AttachStderr")]
    attach_stderr: bool,
    #[serde(rename = "ExposedPorts")]
    exposed_ports: HashMap<String, serde_json::Value>,
    #[serde(rename = "HostConfig")]
    host_config: HostConfig,
    #[serde(rename = "NetworkingConfig", skip_serializing_if = "Option::is_none")]
    networking_config: Option<NetworkingConfig>,
}

#[derive(Serialize)]
struct HostConfig {
    #[serde(rename = "PortBindings")]
    port_bindings: HashMap<String, Vec<PortBinding>>,
    #[serde(rename = "Mounts")]
    mounts: Vec<Mount>,
}

#[derive(Serialize)]
struct PortBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

#[derive(Serialize)]
struct Mount {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Source")]
    source: String,
    #[serde(rename = "Target")]
    target: String,
}

#[derive(Serialize)]
struct NetworkingConfig {
    #[serde(rename = "EndpointsConfig")]
    endpoints_config: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct InspectResponse {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Deserialize)]
struct WaitResponse {
    #[serde(rename = "StatusCode")]
    status_code: i64,
}

#[derive(Serialize)]
struct CreateNetworkBody {
    #[serde(rename = "Name")]
    name: String,
}

enum Transport {
    Unix {
        client: Client<UnixConnector>,
        socket: PathBuf,
    },
    Http {
        client: Client<HttpConnector>,
        base: String,
    },
}

/// Client for one container-engine endpoint.
#[derive(Clone)]
pub struct EngineClient {
    transport: std::sync::Arc<Transport>,
}

impl EngineClient {
    /// Create a client for `endpoint`.
    ///
    /// `unix:///run/podman/podman.sock` and bare filesystem paths select
    /// the unix transport; `http://host:port` selects TCP.
    pub fn new(endpoint: &str) -> Self {
        let transport = if let Some(rest) = endpoint.strip_prefix("unix://") {
            Transport::Unix {
                client: Client::unix(),
                socket: PathBuf::from(rest),
            }
        } else if endpoint.starts_with("http://") {
            Transport::Http {
                client: Client::new(),
                base: endpoint.trim_end_matches('/').to_string(),
            }
        } else {
            Transport::Unix {
                client: Client::unix(),
                socket: PathBuf::from(endpoint),
            }
        };
        Self {
            transport: std::sync::Arc::new(transport),
        }
    }

    async fn request(
        &self,
        method: Method,
        path_query: &str,
        content_type: &str,
        body: Body,
    ) -> Result<hyper::Response<Body>> {
        let builder = Request::builder()
            .method(method)
            .header(CONTENT_TYPE, content_type);
        let response = match &*self.transport {
            Transport::Unix { client, socket } => {
                let uri: hyper::Uri = hyperlocal::Uri::new(socket, path_query).into();
                let request = builder
                    .uri(uri)
                    .body(body)
                    .map_err(|e| Error::engine_unreachable(e.to_string()))?;
                client.request(request).await
            }
            Transport::Http { client, base } => {
                let uri: hyper::Uri = format!("{}{}", base, path_query)
                    .parse()
                    .map_err(|e: hyper::http::uri::InvalidUri| {
                        Error::engine_unreachable(e.to_string())
                    })?;
                let request = builder
                    .uri(uri)
                    .body(body)
                    .map_err(|e| Error::engine_unreachable(e.to_string()))?;
                client.request(request).await
            }
        };
        response.map_err(|e| Error::engine_unreachable(e.to_string()))
    }

    /// Issue a request and fail unless the reply status is a success.
    ///
    /// 304 counts as success: lifecycle posts return it when the
    /// container is already in the requested state.
    async fn request_ok(
        &self,
        method: Method,
        path_query: &str,
        content_type: &str,
        body: Body,
    ) -> Result<Vec<u8>> {
        let response = self.request(method, path_query, content_type, body).await?;
        let status = response.status();
        let bytes = read_body(response.into_body()).await;
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(bytes)
        } else {
            Err(Error::engine(
                status.as_u16(),
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        }
    }

    /// Build an image from raw tar bytes, tagging the result.
    pub async fn build_tar(&self, tag: &str, tar: Vec<u8>, dockerfile: &str) -> Result<()> {
        let path = format!("/build?t={}&dockerfile={}", tag, dockerfile);
        info!(tag, bytes = tar.len(), "building image from tar");
        self.request_ok(Method::POST, &path, TAR_CONTENT_TYPE, Body::from(tar))
            .await
            .map_err(|e| match e {
                Error::Engine { message, .. } => Error::BuildFailed {
                    tag: tag.to_string(),
                    message,
                },
                other => other,
            })?;
        Ok(())
    }

    /// Package `context` into a tar archive and build it.
    pub async fn build_dir(&self, tag: &str, context: &Path, dockerfile: &str) -> Result<()> {
        let context = context.to_path_buf();
        let tar = tokio::task::spawn_blocking(move || archive::pack_dir(&context))
            .await
            .map_err(|e| Error::Archive(e.to_string()))??;
        self.build_tar(tag, tar, dockerfile).await
    }

    /// Create a container. Stdio attach points are always enabled.
    pub async fn create(&self, image: &str, options: &CreateOptions) -> Result<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for (container_port, host_port) in &options.ports {
            let key = format!("{}/tcp", container_port);
            exposed_ports.insert(key.clone(), serde_json::json!({}));
            port_bindings.insert(
                key,
                vec![PortBinding {
                    host_port: host_port.to_string(),
                }],
            );
        }
        let networking_config = if options.networks.is_empty() {
            None
        } else {
            Some(NetworkingConfig {
                endpoints_config: options
                    .networks
                    .iter()
                    .map(|name| (name.clone(), serde_json::json!({})))
                    .collect(),
            })
        };
        let body = CreateBody {
            image: image.to_string(),
            cmd: options.cmd.clone(),
            env: options
                .env
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect(),
            open_stdin: true,
            tty: true,
            attach_stdout: true,
            attach_stderr: true,
            exposed_ports,
            host_config: HostConfig {
                port_bindings,
                mounts: options
                    .binds
                    .iter()
                    .map(|(host, target)| Mount {
                        kind: "bind".to_string(),
                        source: host.display().to_string(),
                        target: target.clone(),
                    })
                    .collect(),
            },
            networking_config,
        };
        let payload =
            serde_json::to_vec(&body).map_err(|e| Error::engine_unreachable(e.to_string()))?;
        let reply = self
            .request_ok(
                Method::POST,
                "/containers/create",
                "application/json",
                Body::from(payload),
            )
            .await?;
        let created: CreateResponse =
            serde_json::from_slice(&reply).map_err(|e| Error::engine_unreachable(e.to_string()))?;
        debug!(container = %created.id, image, "container created");
        Ok(created.id)
    }

    /// Start a container; deliver `init_stdin` right after, when non-empty.
    pub async fn start(&self, container: &str, init_stdin: &[u8]) -> Result<()> {
        let path = format!("/containers/{}/start", container);
        self.request_ok(Method::POST, &path, "application/json", Body::empty())
            .await?;
        if !init_stdin.is_empty() {
            self.write_stdin(container, init_stdin.to_vec()).await?;
        }
        debug!(container, "container started");
        Ok(())
    }

    /// Create and start in one call.
    pub async fn run(
        &self,
        image: &str,
        options: &CreateOptions,
        init_stdin: &[u8],
    ) -> Result<String> {
        let container = self.create(image, options).await?;
        self.start(&container, init_stdin).await?;
        Ok(container)
    }

    /// Stop a container.
    pub async fn stop(&self, container: &str) -> Result<()> {
        let path = format!("/containers/{}/stop", container);
        self.request_ok(Method::POST, &path, "application/json", Body::empty())
            .await?;
        Ok(())
    }

    /// Restart a container.
    pub async fn restart(&self, container: &str) -> Result<()> {
        let path = format!("/containers/{}/restart", container);
        self.request_ok(Method::POST, &path, "application/json", Body::empty())
            .await?;
        Ok(())
    }

    /// Force-remove a container.
    pub async fn remove_container(&self, container: &str) -> Result<()> {
        let path = format!("/containers/{}?force=true", container);
        self.request_ok(Method::DELETE, &path, "application/json", Body::empty())
            .await?;
        Ok(())
    }

    /// Write bytes to a container's stdin stream.
    pub async fn write_stdin(&self, container: &str, bytes: Vec<u8>) -> Result<()> {
        let path = format!("/containers/{}/attach?stdin=1&stream=1", container);
        self.request_ok(Method::POST, &path, RAW_STREAM_CONTENT_TYPE, Body::from(bytes))
            .await?;
        Ok(())
    }

    /// Resolve the engine-assigned name of a container.
    pub async fn container_name(&self, container: &str) -> Result<String> {
        let path = format!("/containers/{}/json", container);
        let reply = self
            .request_ok(Method::GET, &path, "application/json", Body::empty())
            .await?;
        let inspect: InspectResponse =
            serde_json::from_slice(&reply).map_err(|e| Error::engine_unreachable(e.to_string()))?;
        // Inspect reports names with a leading slash.
        Ok(inspect.name.trim_start_matches('/').to_string())
    }

    /// Block until a container exits; returns its exit code.
    pub async fn wait(&self, container: &str) -> Result<i64> {
        let path = format!("/containers/{}/wait", container);
        let reply = self
            .request_ok(Method::POST, &path, "application/json", Body::empty())
            .await?;
        let waited: WaitResponse =
            serde_json::from_slice(&reply).map_err(|e| Error::engine_unreachable(e.to_string()))?;
        Ok(waited.status_code)
    }

    /// Create a named network.
    pub async fn create_network(&self, name: &str) -> Result<()> {
        let body = serde_json::to_vec(&CreateNetworkBody {
            name: name.to_string(),
        })
        .map_err(|e| Error::engine_unreachable(e.to_string()))?;
        self.request_ok(
            Method::POST,
            "/networks/create",
            "application/json",
            Body::from(body),
        )
        .await?;
        info!(network = name, "network created");
        Ok(())
    }

    /// Remove a named network.
    pub async fn remove_network(&self, name: &str) -> Result<()> {
        let path = format!("/networks/{}", name);
        self.request_ok(Method::DELETE, &path, "application/json", Body::empty())
            .await?;
        Ok(())
    }

    /// Force-remove an image by tag.
    pub async fn remove_image(&self, tag: &str) -> Result<()> {
        let path = format!("/images/{}?force=true", tag);
        self.request_ok(Method::DELETE, &path, "application/json", Body::empty())
            .await?;
        Ok(())
    }

    /// Open the container's stdout/stderr stream.
    ///
    /// Returns a channel of demultiplexed chunks; the channel closes when
    /// the container exits or the engine drops the stream. The demux
    /// worker runs on its own task.
    pub async fn attach(&self, container: &str) -> Result<mpsc::UnboundedReceiver<AttachEvent>> {
        let path = format!("/containers/{}/attach?stdout=1&stderr=1&stream=1", container);
        let response = self
            .request(Method::POST, &path, RAW_STREAM_CONTENT_TYPE, Body::empty())
            .await?;
        let status = response.status();
        if !status.is_success() {
            let bytes = read_body(response.into_body()).await;
            return Err(Error::engine(
                status.as_u16(),
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(attach::demux(
            container.to_string(),
            response.into_body(),
            events_tx,
        ));
        Ok(events_rx)
    }
}

/// Drain a response body, keeping at most [`MAX_ERROR_BODY`] bytes.
async fn read_body(mut body: Body) -> Vec<u8> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(chunk) => {
                if bytes.len() < MAX_ERROR_BODY {
                    bytes.extend_from_slice(&chunk);
                    bytes.truncate(MAX_ERROR_BODY);
                }
            }
            Err(_) => break,
        }
    }
    bytes
}
