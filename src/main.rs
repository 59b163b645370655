//! invoker CLI entry point.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use invoker::{BusServer, Config, EngineClient, Gateway, SessionRouter, TaskRegistry};

/// invoker - runs coordinator-submitted tasks as container workloads
#[derive(Parser, Debug)]
#[command(name = "invoker")]
#[command(about = "Runs coordinator-submitted tasks as container workloads")]
#[command(version)]
struct Cli {
    /// Control socket path operators connect to
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Upstream coordinator WebSocket URL
    #[arg(long)]
    upstream: Option<String>,

    /// Container engine endpoint (unix:///… or http://host:port)
    #[arg(long)]
    engine: Option<String>,

    /// Root directory for per-task volumes
    #[arg(long)]
    volumes_root: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Config {
        let mut config = Config::from_env();
        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        if let Some(upstream) = self.upstream {
            config.upstream_url = upstream;
        }
        if let Some(engine) = self.engine {
            config.engine_endpoint = engine;
        }
        if let Some(volumes_root) = self.volumes_root {
            config.volumes_root = volumes_root;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let config = cli.into_config();
    tracing::info!(
        version = invoker::VERSION,
        socket = %config.socket_path.display(),
        upstream = %config.upstream_url,
        engine = %config.engine_endpoint,
        "starting invoker"
    );

    // The control socket is the one resource the invoker cannot run
    // without; a bind failure is fatal.
    let (server, bus_events) = match BusServer::bind(&config.socket_path) {
        Ok(bound) => bound,
        Err(e) => {
            tracing::error!(error = %e, "fatal: control socket unavailable");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let engine = EngineClient::new(&config.engine_endpoint);
    let (gateway, upstream) = Gateway::new(config.upstream_url.clone());
    let registry = TaskRegistry::new(engine, config, upstream);

    // An unreachable or lost coordinator is not fatal: running tasks and
    // their operators keep being served; a supervisor restart brings the
    // upstream back.
    let gateway_task = tokio::spawn(gateway.run(Arc::clone(&registry)));

    let router = SessionRouter::new(registry);
    router.run(bus_events).await;

    gateway_task.abort();
    drop(server);
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("invoker=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
