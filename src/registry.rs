//! Task registry and task lifecycle.
//!
//! A task is one coordinator-initiated workload: an operator image built
//! from the uploaded archive, a private volume directory, zero or more
//! private networks, and the operator container driving it all. The
//! registry owns the process-wide `taskId → Task` map and the
//! construction/teardown choreography around the engine.
//!
//! Construction is atomic from the outside: if any step fails, the
//! networks, volume directory, and image provisioned so far are rolled
//! back best-effort and the task never becomes visible.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::distributions::Alphanumeric;
use rand::Rng;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use crate::bus::Connection;
use crate::config::{Config, SOCKET_INNER_PATH, VOLUME_INNER_PATH};
use crate::engine::{CreateOptions, EngineClient};
use crate::error::{Error, Result};
use crate::gateway::{Outbound, UpstreamSink};
use crate::{archive, session};

/// Random alphanumeric characters in an init token (the millisecond
/// timestamp prefix comes on top).
const TOKEN_RANDOM_LEN: usize = 256;

/// Random suffix length of engine network names.
const NETWORK_SUFFIX_LEN: usize = 16;

/// Name of the optional network-list file at the archive root.
const NETWORKS_ENTRY: &str = "networks";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Image build and provisioning in progress.
    Building,
    /// Operator container launched.
    Running,
    /// Torn down.
    Stopped,
    /// Construction or teardown failed.
    Failed,
}

/// A live session bound to a task.
#[derive(Debug, Clone)]
pub struct SessionSlot {
    /// Session identifier.
    pub session_id: u64,
    /// Connection carrying the session.
    pub connection: Connection,
}

/// One registered task.
#[derive(Debug)]
pub struct Task {
    id: String,
    init_token: String,
    image_tag: String,
    operator_container: String,
    volume_path: PathBuf,
    networks: HashMap<String, String>,
    state: Mutex<TaskState>,
    session: Mutex<Option<SessionSlot>>,
    child_containers: Mutex<Vec<String>>,
}

impl Task {
    /// Coordinator-supplied task id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Per-task volume directory on the host.
    pub fn volume_path(&self) -> &PathBuf {
        &self.volume_path
    }

    /// Engine id of the operator container.
    pub fn operator_container(&self) -> &str {
        &self.operator_container
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.state.lock().expect("state lock")
    }

    /// Resolve a logical network name to its engine name.
    ///
    /// Unknown names pass through untouched, so operators may also name
    /// pre-existing engine networks.
    pub fn resolve_network(&self, logical: &str) -> String {
        self.networks
            .get(logical)
            .cloned()
            .unwrap_or_else(|| logical.to_string())
    }

    /// Logical → engine network map.
    pub fn networks(&self) -> &HashMap<String, String> {
        &self.networks
    }

    /// Record a container created on behalf of this task, for teardown.
    pub fn track_container(&self, container: &str) {
        self.child_containers
            .lock()
            .expect("containers lock")
            .push(container.to_string());
    }

    /// Bind the operator session. Fails when one is already bound; a
    /// task has at most one live session.
    pub fn bind_session(&self, slot: SessionSlot) -> bool {
        let mut session = self.session.lock().expect("session lock");
        if session.is_some() {
            return false;
        }
        *session = Some(slot);
        true
    }

    /// Clear the session slot if `session_id` still owns it.
    pub fn clear_session(&self, session_id: u64) {
        let mut session = self.session.lock().expect("session lock");
        if session.as_ref().is_some_and(|s| s.session_id == session_id) {
            *session = None;
        }
    }

    /// Whether an operator session is currently bound.
    pub fn has_session(&self) -> bool {
        self.session.lock().expect("session lock").is_some()
    }

    fn take_session(&self) -> Option<SessionSlot> {
        self.session.lock().expect("session lock").take()
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock().expect("state lock") = state;
    }
}

/// Allocate the next session id.
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Process-wide registry of live tasks.
pub struct TaskRegistry {
    engine: EngineClient,
    config: Config,
    upstream: UpstreamSink,
    tasks: Mutex<HashMap<String, Arc<Task>>>,
}

impl TaskRegistry {
    /// Create a registry working against `engine`.
    pub fn new(engine: EngineClient, config: Config, upstream: UpstreamSink) -> Arc<Self> {
        Arc::new(Self {
            engine,
            config,
            upstream,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Engine client shared with sessions.
    pub fn engine(&self) -> &EngineClient {
        &self.engine
    }

    /// Upstream message queue.
    pub fn upstream(&self) -> &UpstreamSink {
        &self.upstream
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().expect("tasks lock").len()
    }

    /// Whether no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a task from an uploaded tar archive.
    ///
    /// Provisions networks named by the archive's `networks` file, the
    /// volume directory, the operator image, and finally the operator
    /// container. The task only becomes findable by token once the
    /// operator container is up.
    pub async fn start_task(self: &Arc<Self>, task_id: &str, tar: Vec<u8>) -> Result<Arc<Task>> {
        if self
            .tasks
            .lock()
            .expect("tasks lock")
            .contains_key(task_id)
        {
            return Err(Error::TaskExists(task_id.to_string()));
        }

        let init_token = generate_token();
        let image_tag = image_tag_for(task_id);
        info!(task_id, image_tag = %image_tag, "starting task");

        match self.provision(task_id, &image_tag, &init_token, tar).await {
            Ok(task) => {
                let task = Arc::new(task);
                self.tasks
                    .lock()
                    .expect("tasks lock")
                    .insert(task_id.to_string(), Arc::clone(&task));
                self.spawn_exit_watcher(&task);
                info!(task_id, operator = task.operator_container(), "task running");
                Ok(task)
            }
            Err(e) => {
                error!(task_id, error = %e, "task construction failed");
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        task_id: &str,
        image_tag: &str,
        init_token: &str,
        tar: Vec<u8>,
    ) -> Result<Task> {
        // Networks file is optional; absence means no private networks.
        let logical_networks = match archive::read_entry(&tar, NETWORKS_ENTRY)? {
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };

        let mut networks = HashMap::new();
        let mut rollback = Rollback::new(&self.engine);
        for logical in &logical_networks {
            let engine_name = network_name_for(task_id, logical);
            if let Err(e) = self.engine.create_network(&engine_name).await {
                rollback.run().await;
                return Err(e);
            }
            rollback.networks.push(engine_name.clone());
            networks.insert(logical.clone(), engine_name);
        }

        let volume_path = self.config.volumes_root.join(image_tag);
        if let Err(source) = std::fs::create_dir_all(&volume_path) {
            rollback.run().await;
            return Err(Error::Volume {
                path: volume_path,
                source,
            });
        }
        rollback.volume = Some(volume_path.clone());

        if let Err(e) = self.engine.build_tar(image_tag, tar, "./Dockerfile").await {
            rollback.run().await;
            return Err(e);
        }
        rollback.image = Some(image_tag.to_string());

        let options = CreateOptions {
            env: vec![
                ("INIT_TOKEN".to_string(), init_token.to_string()),
                ("SOCKET_PATH".to_string(), SOCKET_INNER_PATH.to_string()),
            ],
            binds: vec![
                (
                    self.config.socket_path.clone(),
                    SOCKET_INNER_PATH.to_string(),
                ),
                (volume_path.clone(), VOLUME_INNER_PATH.to_string()),
            ],
            networks: networks.values().cloned().collect(),
            ..CreateOptions::default()
        };
        let operator_container = match self.engine.run(image_tag, &options, &[]).await {
            Ok(id) => id,
            Err(e) => {
                rollback.run().await;
                return Err(e);
            }
        };

        Ok(Task {
            id: task_id.to_string(),
            init_token: init_token.to_string(),
            image_tag: image_tag.to_string(),
            operator_container,
            volume_path,
            networks,
            state: Mutex::new(TaskState::Running),
            session: Mutex::new(None),
            child_containers: Mutex::new(Vec::new()),
        })
    }

    /// Report operator exit upstream; tear the task down when no session
    /// is left to speak for it.
    fn spawn_exit_watcher(self: &Arc<Self>, task: &Arc<Task>) {
        let registry = Arc::clone(self);
        let task = Arc::clone(task);
        tokio::spawn(async move {
            let exit_code = match registry.engine.wait(task.operator_container()).await {
                Ok(code) => code,
                Err(e) => {
                    // The wait stream dies during teardown too; nothing
                    // to report then.
                    if registry.get(task.id()).is_some() {
                        warn!(task_id = task.id(), error = %e, "operator wait failed");
                    }
                    return;
                }
            };
            if registry.get(task.id()).is_none() {
                return;
            }
            info!(task_id = task.id(), exit_code, "operator container exited");
            let _ = registry.upstream.send(Outbound::Exited {
                task_id: task.id().to_string(),
                exit_code,
                data: String::new(),
            });
            if !task.has_session() {
                registry.stop_task(task.id()).await;
            }
        });
    }

    /// Look up a task by id.
    pub fn get(&self, task_id: &str) -> Option<Arc<Task>> {
        self.tasks.lock().expect("tasks lock").get(task_id).cloned()
    }

    /// Find the task whose init token matches `candidate`.
    ///
    /// Comparison is constant-time per candidate; the scan is linear,
    /// which is fine for the handful of concurrent tasks an invoker
    /// carries.
    pub fn find_by_token(&self, candidate: &[u8]) -> Option<Arc<Task>> {
        let tasks = self.tasks.lock().expect("tasks lock");
        tasks
            .values()
            .find(|task| bool::from(task.init_token.as_bytes().ct_eq(candidate)))
            .cloned()
    }

    /// Stop a task and release everything it owns.
    ///
    /// Idempotent: stopping an unknown or already-stopped task logs and
    /// returns. Teardown is best-effort; a failing step is logged and
    /// the cascade continues.
    pub async fn stop_task(&self, task_id: &str) {
        let task = {
            let mut tasks = self.tasks.lock().expect("tasks lock");
            tasks.remove(task_id)
        };
        let Some(task) = task else {
            info!(task_id, "stop for unknown task ignored");
            return;
        };
        info!(task_id, "stopping task");

        if let Some(slot) = task.take_session() {
            slot.connection.close();
        }

        let children = task
            .child_containers
            .lock()
            .expect("containers lock")
            .clone();
        for container in children.iter().rev() {
            if let Err(e) = self.engine.stop(container).await {
                warn!(task_id, container = %container, error = %e, "container stop failed");
            }
            if let Err(e) = self.engine.remove_container(container).await {
                warn!(task_id, container = %container, error = %e, "container remove failed");
            }
        }

        let operator = task.operator_container();
        if let Err(e) = self.engine.stop(operator).await {
            warn!(task_id, container = %operator, error = %e, "operator stop failed");
        }
        if let Err(e) = self.engine.remove_container(operator).await {
            warn!(task_id, container = %operator, error = %e, "operator remove failed");
        }

        for engine_name in task.networks.values() {
            if let Err(e) = self.engine.remove_network(engine_name).await {
                warn!(task_id, network = %engine_name, error = %e, "network remove failed");
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&task.volume_path) {
            warn!(task_id, path = %task.volume_path.display(), error = %e, "volume remove failed");
        }

        if let Err(e) = self.engine.remove_image(&task.image_tag).await {
            warn!(task_id, image = %task.image_tag, error = %e, "image remove failed");
        }

        task.set_state(TaskState::Stopped);
        info!(task_id, "task stopped");
    }

    /// Route an operator session binding through the registry so the
    /// task's slot and the session's task stay consistent.
    pub fn bind_session(
        &self,
        task: &Arc<Task>,
        connection: Connection,
    ) -> Option<session::SessionHandle> {
        let session_id = next_session_id();
        let slot = SessionSlot {
            session_id,
            connection: connection.clone(),
        };
        if !task.bind_session(slot) {
            warn!(task_id = task.id(), "second session rejected");
            return None;
        }
        Some(session::SessionHandle::spawn(
            session_id,
            connection,
            Arc::clone(task),
            self.engine.clone(),
            self.upstream.clone(),
        ))
    }
}

/// Best-effort rollback of partially provisioned task resources.
struct Rollback<'a> {
    engine: &'a EngineClient,
    networks: Vec<String>,
    volume: Option<PathBuf>,
    image: Option<String>,
}

impl<'a> Rollback<'a> {
    fn new(engine: &'a EngineClient) -> Self {
        Self {
            engine,
            networks: Vec::new(),
            volume: None,
            image: None,
        }
    }

    async fn run(self) {
        for network in &self.networks {
            if let Err(e) = self.engine.remove_network(network).await {
                warn!(network = %network, error = %e, "rollback: network remove failed");
            }
        }
        if let Some(volume) = &self.volume {
            if let Err(e) = std::fs::remove_dir_all(volume) {
                warn!(path = %volume.display(), error = %e, "rollback: volume remove failed");
            }
        }
        if let Some(image) = &self.image {
            if let Err(e) = self.engine.remove_image(image).await {
                warn!(image = %image, error = %e, "rollback: image remove failed");
            }
        }
    }
}

pub(crate) fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Init tokens: millisecond timestamp prefix + 256 random alphanumerics.
fn generate_token() -> String {
    format!("{}{}", timestamp_millis(), random_alphanumeric(TOKEN_RANDOM_LEN))
}

fn image_tag_for(task_id: &str) -> String {
    format!("task-{}-{}", task_id, timestamp_millis())
}

fn network_name_for(task_id: &str, logical: &str) -> String {
    format!(
        "task-{}-{}-{}-{}",
        task_id,
        logical,
        timestamp_millis(),
        random_alphanumeric(NETWORK_SUFFIX_LEN)
    )
}

#[cfg(test)]
impl Task {
    /// Bare task for unit tests; nothing behind it on the engine side.
    pub(crate) fn for_tests(id: &str, token: &str) -> Arc<Self> {
        Arc::new(Task {
            id: id.to_string(),
            init_token: token.to_string(),
            image_tag: image_tag_for(id),
            operator_container: format!("op-{}", id),
            volume_path: std::env::temp_dir().join("invoker_test_vol"),
            networks: HashMap::new(),
            state: Mutex::new(TaskState::Running),
            session: Mutex::new(None),
            child_containers: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
impl TaskRegistry {
    /// Registry with an unreachable engine endpoint for unit tests.
    pub(crate) fn for_tests() -> Arc<Self> {
        let (upstream, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut config = Config::from_env();
        config.volumes_root = std::env::temp_dir().join("invoker_registry_test");
        TaskRegistry::new(
            EngineClient::new("unix:///nonexistent/engine.sock"),
            config,
            upstream,
        )
    }

    pub(crate) fn insert_for_tests(&self, task: Arc<Task>) {
        self.tasks
            .lock()
            .expect("tasks lock")
            .insert(task.id().to_string(), task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Arc<TaskRegistry> {
        TaskRegistry::for_tests()
    }

    fn test_task(id: &str, token: &str) -> Arc<Task> {
        Task::for_tests(id, token)
    }

    #[test]
    fn test_token_recipe() {
        let token = generate_token();
        assert!(token.len() >= TOKEN_RANDOM_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_token(), token);
    }

    #[test]
    fn test_unique_names_per_call() {
        let tag_a = image_tag_for("42");
        let net_a = network_name_for("42", "net_a");
        let net_b = network_name_for("42", "net_a");
        assert!(tag_a.starts_with("task-42-"));
        assert!(net_a.starts_with("task-42-net_a-"));
        // Random suffix keeps same-millisecond names apart.
        assert_ne!(net_a, net_b);
    }

    #[test]
    fn test_find_by_token() {
        let registry = test_registry();
        let task = test_task("42", "sekrit-token-0000");
        registry
            .tasks
            .lock()
            .unwrap()
            .insert("42".to_string(), Arc::clone(&task));

        let found = registry.find_by_token(b"sekrit-token-0000").unwrap();
        assert_eq!(found.id(), "42");
        assert!(registry.find_by_token(b"sekrit-token-0001").is_none());
        assert!(registry.find_by_token(b"sekrit").is_none());
    }

    #[tokio::test]
    async fn test_start_task_rejects_duplicate_id() {
        let registry = test_registry();
        registry
            .tasks
            .lock()
            .unwrap()
            .insert("42".to_string(), test_task("42", "tok"));

        // The duplicate check runs before any engine traffic, so the
        // unreachable engine endpoint is never touched.
        let err = registry.start_task("42", Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::TaskExists(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_task_is_idempotent() {
        let registry = test_registry();
        registry.stop_task("missing").await;
        assert!(registry.is_empty());
        registry.stop_task("missing").await;
        assert!(registry.is_empty());
    }

    #[test]
    fn test_session_slot_is_exclusive() {
        let task = test_task("42", "tok");
        let conn = crate::bus::Connection::disconnected(7);
        assert!(task.bind_session(SessionSlot {
            session_id: 1,
            connection: conn.clone(),
        }));
        assert!(!task.bind_session(SessionSlot {
            session_id: 2,
            connection: conn,
        }));
        // Clearing with the wrong id leaves the slot occupied.
        task.clear_session(2);
        assert!(task.has_session());
        task.clear_session(1);
        assert!(!task.has_session());
    }

    #[test]
    fn test_resolve_network_falls_through() {
        let mut task = test_task("42", "tok");
        Arc::get_mut(&mut task).unwrap().networks.insert(
            "net_a".to_string(),
            "task-42-net_a-170000-abcdefgh".to_string(),
        );
        assert_eq!(
            task.resolve_network("net_a"),
            "task-42-net_a-170000-abcdefgh"
        );
        assert_eq!(task.resolve_network("bridge"), "bridge");
    }
}
