//! Operator sessions and the connection router.
//!
//! The router owns the map from control-socket connections to sessions.
//! A fresh connection is unauthenticated: its first frame is interpreted
//! solely as a candidate init token and matched against the registered
//! tasks. On a match a [`Session`] is created and every later frame on
//! that connection is an operator command; on a mismatch the frame is
//! dropped and the connection stays open for another attempt.
//!
//! Each session runs on its own task and processes its frames strictly
//! in arrival order. Long-lived stdio attach streams run on separate
//! pump tasks and interleave their `STDOUT`/`STDERR` frames with command
//! replies, which is why every streamed chunk is tagged with its
//! container handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use invoker_protocol::command::CommandError;
use invoker_protocol::{InvokerMessage, OperatorCommand, ReplyWaiters, RunSpec, StreamMode};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, ConnId, Connection};
use crate::engine::{AttachEvent, CreateOptions, EngineClient};
use crate::gateway::{Outbound, UpstreamSink};
use crate::registry::{self, Task, TaskRegistry};

/// Handle to a running session task.
pub struct SessionHandle {
    session_id: u64,
    frames: mpsc::UnboundedSender<Vec<u8>>,
}

impl SessionHandle {
    /// Spawn the session worker for an authenticated connection.
    pub fn spawn(
        session_id: u64,
        connection: Connection,
        task: Arc<Task>,
        engine: EngineClient,
        upstream: UpstreamSink,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let session = Session {
            id: session_id,
            connection,
            task,
            engine,
            upstream,
            images: HashMap::new(),
            rev_images: HashMap::new(),
            containers: HashMap::new(),
            rev_containers: HashMap::new(),
            ports: HashMap::new(),
            waiters: ReplyWaiters::new(),
        };
        tokio::spawn(session.run(frames_rx));
        Self {
            session_id,
            frames: frames_tx,
        }
    }

    /// Session identifier.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Queue one inbound frame for the session worker.
    pub fn deliver(&self, frame: Vec<u8>) {
        let _ = self.frames.send(frame);
    }
}

/// One authenticated operator connection.
struct Session {
    id: u64,
    connection: Connection,
    task: Arc<Task>,
    engine: EngineClient,
    upstream: UpstreamSink,
    /// Operator image handle → engine tag, and the inverse.
    images: HashMap<u32, String>,
    rev_images: HashMap<String, u32>,
    /// Operator container handle → engine id, and the inverse.
    containers: HashMap<u32, String>,
    rev_containers: HashMap<String, u32>,
    /// Port bindings recorded at create time, per container handle.
    ports: HashMap<u32, Vec<(u16, u16)>>,
    /// Pending one-shot reply matchers, tried before command dispatch.
    waiters: ReplyWaiters,
}

impl Session {
    async fn run(mut self, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
        info!(session = self.id, task_id = self.task.id(), "session started");
        while let Some(frame) = frames.recv().await {
            self.handle_frame(frame).await;
        }
        self.task.clear_session(self.id);
        info!(session = self.id, task_id = self.task.id(), "session closed");
    }

    async fn handle_frame(&mut self, frame: Vec<u8>) {
        if self.waiters.try_dispatch(&frame) {
            return;
        }
        let command = match OperatorCommand::parse(&frame) {
            Ok(command) => command,
            Err(CommandError::Unknown(keyword)) => {
                warn!(session = self.id, keyword = %keyword, "unknown command ignored");
                return;
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "malformed command ignored");
                return;
            }
        };
        self.handle_command(command).await;
    }

    async fn handle_command(&mut self, command: OperatorCommand) {
        match command {
            OperatorCommand::Build {
                image,
                context,
                dockerfile,
            } => self.build(image, context, dockerfile).await,
            OperatorCommand::Run {
                container,
                image,
                spec,
            } => self.handle_run(container, image, spec).await,
            OperatorCommand::Restart { container } => {
                if let Some(engine_id) = self.engine_container(container) {
                    if let Err(e) = self.engine.restart(&engine_id).await {
                        warn!(session = self.id, container, error = %e, "restart failed");
                    }
                }
            }
            OperatorCommand::Stop { container } => {
                if let Some(engine_id) = self.engine_container(container) {
                    if let Err(e) = self.engine.stop(&engine_id).await {
                        warn!(session = self.id, container, error = %e, "stop failed");
                    }
                }
            }
            OperatorCommand::Write { container, data } => {
                if let Some(engine_id) = self.engine_container(container) {
                    if let Err(e) = self.engine.write_stdin(&engine_id, data).await {
                        warn!(session = self.id, container, error = %e, "stdin write failed");
                    }
                }
            }
            OperatorCommand::Host { container } => {
                let Some(engine_id) = self.engine_container(container) else {
                    return;
                };
                match self.engine.container_name(&engine_id).await {
                    Ok(name) => self
                        .connection
                        .send(&InvokerMessage::Host { name }.to_payload()),
                    Err(e) => {
                        warn!(session = self.id, container, error = %e, "host lookup failed");
                    }
                }
            }
            OperatorCommand::Port { container, port } => {
                let bound = self
                    .ports
                    .get(&container)
                    .and_then(|bindings| {
                        bindings
                            .iter()
                            .find(|(container_port, _)| *container_port == port)
                    })
                    .map(|(_, host_port)| *host_port);
                match bound {
                    Some(host_port) => self
                        .connection
                        .send(&InvokerMessage::Port { port: host_port }.to_payload()),
                    None => {
                        debug!(session = self.id, container, port, "no binding for PORT query");
                    }
                }
            }
            OperatorCommand::Verdict {
                verdict,
                subtask,
                data,
            } => {
                let message = match subtask {
                    Some(subtask) => Outbound::SubtaskVerdict {
                        task_id: self.task.id().to_string(),
                        subtask,
                        verdict,
                        data,
                    },
                    None => Outbound::FullVerdict {
                        task_id: self.task.id().to_string(),
                        verdict,
                        data,
                    },
                };
                let _ = self.upstream.send(message);
            }
        }
    }

    async fn build(&mut self, image: u32, context: String, dockerfile: String) {
        let tag = build_image_tag(self.id, image);
        self.insert_image(image, tag.clone());
        info!(session = self.id, image, tag = %tag, context = %context, "building image");
        if let Err(e) = self
            .engine
            .build_dir(&tag, &PathBuf::from(&context), &dockerfile)
            .await
        {
            warn!(session = self.id, image, error = %e, "build failed");
            self.operator_error(format!("build {} failed: {}", image, e));
        }
    }

    async fn handle_run(&mut self, container: u32, image: u32, spec: RunSpec) {
        let Some(tag) = self.images.get(&image).cloned() else {
            warn!(session = self.id, image, "RUN names unknown image handle");
            return;
        };
        let options = CreateOptions {
            cmd: Vec::new(),
            ports: spec.ports.iter().map(|&port| (port, port)).collect(),
            env: spec.env.clone(),
            binds: spec
                .volumes
                .iter()
                .map(|(host, target)| (PathBuf::from(host), target.clone()))
                .collect(),
            networks: spec
                .networks
                .iter()
                .map(|logical| self.task.resolve_network(logical))
                .collect(),
        };
        let engine_id = match self.engine.run(&tag, &options, &spec.init_stdin).await {
            Ok(id) => id,
            Err(e) => {
                warn!(session = self.id, container, error = %e, "run failed");
                self.operator_error(format!("run {} failed: {}", container, e));
                return;
            }
        };
        self.insert_container(container, engine_id.clone());
        self.ports.insert(container, options.ports.clone());
        self.task.track_container(&engine_id);
        info!(session = self.id, container, engine_id = %engine_id, "container running");

        if spec.stdout != StreamMode::None || spec.stderr != StreamMode::None {
            match self.engine.attach(&engine_id).await {
                Ok(events) => {
                    tokio::spawn(pump_streams(
                        self.connection.clone(),
                        container,
                        spec.stdout,
                        spec.stderr,
                        events,
                    ));
                }
                Err(e) => {
                    warn!(session = self.id, container, error = %e, "attach failed");
                    self.operator_error(format!("attach {} failed: {}", container, e));
                }
            }
        }
    }

    fn engine_container(&self, handle: u32) -> Option<String> {
        let engine_id = self.containers.get(&handle).cloned();
        if engine_id.is_none() {
            warn!(session = self.id, handle, "unknown container handle");
        }
        engine_id
    }

    fn insert_image(&mut self, handle: u32, tag: String) {
        if let Some(old) = self.images.insert(handle, tag.clone()) {
            self.rev_images.remove(&old);
        }
        self.rev_images.insert(tag, handle);
    }

    fn insert_container(&mut self, handle: u32, engine_id: String) {
        if let Some(old) = self.containers.insert(handle, engine_id.clone()) {
            self.rev_containers.remove(&old);
        }
        self.rev_containers.insert(engine_id, handle);
    }

    fn operator_error(&self, message: String) {
        let _ = self.upstream.send(Outbound::OperatorError {
            task_id: self.task.id().to_string(),
            message,
        });
    }
}

/// Route one container's demultiplexed stdio back to the operator.
///
/// `normal` chunks are forwarded as they arrive; `onEnd` chunks are
/// buffered and flushed as a single frame when the stream ends; `none`
/// chunks are dropped. The stream ends when the container exits or the
/// engine closes the attach connection.
async fn pump_streams(
    connection: Connection,
    container: u32,
    stdout_mode: StreamMode,
    stderr_mode: StreamMode,
    mut events: mpsc::UnboundedReceiver<AttachEvent>,
) {
    let mut stdout_buf: Vec<u8> = Vec::new();
    let mut stderr_buf: Vec<u8> = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            AttachEvent::Stdout(data) => match stdout_mode {
                StreamMode::Normal => connection.send(
                    &InvokerMessage::Stdout { container, data }.to_payload(),
                ),
                StreamMode::OnEnd => stdout_buf.extend_from_slice(&data),
                StreamMode::None => {}
            },
            AttachEvent::Stderr(data) => match stderr_mode {
                StreamMode::Normal => connection.send(
                    &InvokerMessage::Stderr { container, data }.to_payload(),
                ),
                StreamMode::OnEnd => stderr_buf.extend_from_slice(&data),
                StreamMode::None => {}
            },
        }
    }
    if stdout_mode == StreamMode::OnEnd && !stdout_buf.is_empty() {
        connection.send(
            &InvokerMessage::Stdout {
                container,
                data: stdout_buf,
            }
            .to_payload(),
        );
    }
    if stderr_mode == StreamMode::OnEnd && !stderr_buf.is_empty() {
        connection.send(
            &InvokerMessage::Stderr {
                container,
                data: stderr_buf,
            }
            .to_payload(),
        );
    }
}

/// Session-build image tags: timestamp, session id, operator handle.
fn build_image_tag(session_id: u64, image: u32) -> String {
    format!("{}-{}-{}", registry::timestamp_millis(), session_id, image)
}

/// Routes bus events to sessions, authenticating fresh connections.
pub struct SessionRouter {
    registry: Arc<TaskRegistry>,
    connections: HashMap<ConnId, Connection>,
    sessions: HashMap<ConnId, SessionHandle>,
}

impl SessionRouter {
    /// Create a router over `registry`.
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            connections: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Consume bus events until the bus shuts down.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<BusEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Connected(connection) => {
                self.connections.insert(connection.id(), connection);
            }
            BusEvent::Frame(conn_id, frame) => self.handle_frame(conn_id, frame),
            BusEvent::Closed(conn_id) => {
                self.connections.remove(&conn_id);
                if self.sessions.remove(&conn_id).is_some() {
                    debug!(conn = conn_id, "session connection closed");
                }
            }
        }
    }

    fn handle_frame(&mut self, conn_id: ConnId, frame: Vec<u8>) {
        if let Some(session) = self.sessions.get(&conn_id) {
            session.deliver(frame);
            return;
        }
        // Unauthenticated: the frame is a candidate init token, nothing
        // else. A mismatch leaves the connection open for retries.
        let Some(connection) = self.connections.get(&conn_id).cloned() else {
            return;
        };
        let Some(task) = self.registry.find_by_token(&frame) else {
            warn!(conn = conn_id, "init token mismatch");
            return;
        };
        let Some(handle) = self.registry.bind_session(&task, connection) else {
            return;
        };
        info!(
            conn = conn_id,
            session = handle.session_id(),
            task_id = task.id(),
            "operator authenticated"
        );
        self.sessions.insert(conn_id, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invoker_protocol::{FrameDecoder, Verdict};

    fn test_session(
        task: Arc<Task>,
        connection: Connection,
    ) -> (Session, mpsc::UnboundedReceiver<Outbound>) {
        let (upstream, upstream_rx) = mpsc::unbounded_channel();
        let session = Session {
            id: registry::next_session_id(),
            connection,
            task,
            engine: EngineClient::new("unix:///nonexistent/engine.sock"),
            upstream,
            images: HashMap::new(),
            rev_images: HashMap::new(),
            containers: HashMap::new(),
            rev_containers: HashMap::new(),
            ports: HashMap::new(),
            waiters: ReplyWaiters::new(),
        };
        (session, upstream_rx)
    }

    fn decode_frame(bytes: &[u8]) -> Vec<u8> {
        let mut decoder = FrameDecoder::new();
        decoder.extend(bytes);
        decoder.next_frame().unwrap().expect("complete frame")
    }

    #[tokio::test]
    async fn test_verdict_forwarded_upstream() {
        let task = Task::for_tests("42", "tok");
        let (mut session, mut upstream) =
            test_session(task, Connection::disconnected(0));

        session
            .handle_frame(b"VERDICT OK SUB sub1 DATA\nhello".to_vec())
            .await;
        let message = upstream.try_recv().unwrap();
        assert_eq!(
            message,
            Outbound::SubtaskVerdict {
                task_id: "42".to_string(),
                subtask: "sub1".to_string(),
                verdict: Verdict::Ok,
                data: b"hello".to_vec(),
            }
        );
        assert_eq!(message.to_text(), "42\nSUBTASK sub1\nVERDICT OK\nhello");

        session.handle_frame(b"VERDICT WA".to_vec()).await;
        assert_eq!(
            upstream.try_recv().unwrap(),
            Outbound::FullVerdict {
                task_id: "42".to_string(),
                verdict: Verdict::Wa,
                data: Vec::new(),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_session_alive() {
        let task = Task::for_tests("42", "tok");
        let (mut session, mut upstream) =
            test_session(task, Connection::disconnected(0));

        session.handle_frame(b"FLY 1 high".to_vec()).await;
        session.handle_frame(b"VERDICT OK".to_vec()).await;
        assert!(matches!(
            upstream.try_recv().unwrap(),
            Outbound::FullVerdict { .. }
        ));
    }

    #[tokio::test]
    async fn test_handle_maps_stay_bijective() {
        let task = Task::for_tests("42", "tok");
        let (mut session, _upstream) = test_session(task, Connection::disconnected(0));

        session.insert_container(7, "engine-a".to_string());
        session.insert_container(8, "engine-b".to_string());
        // Rebinding handle 7 must drop the stale inverse entry.
        session.insert_container(7, "engine-c".to_string());

        assert_eq!(session.containers.len(), 2);
        assert_eq!(session.rev_containers.len(), 2);
        for (handle, engine_id) in &session.containers {
            assert_eq!(session.rev_containers.get(engine_id), Some(handle));
        }
        assert!(!session.rev_containers.contains_key("engine-a"));
    }

    #[tokio::test]
    async fn test_port_reply_from_recorded_bindings() {
        let task = Task::for_tests("42", "tok");
        let (connection, mut written) = Connection::capture(0);
        let (mut session, _upstream) = test_session(task, connection);
        session.insert_container(7, "engine-a".to_string());
        session.ports.insert(7, vec![(8080, 8080)]);

        session.handle_frame(b"PORT 7\n8080".to_vec()).await;
        let frame = decode_frame(&written.recv().await.unwrap());
        assert_eq!(frame, b"PORT 8080");

        // Unbound port: no reply, no crash.
        session.handle_frame(b"PORT 7\n9090".to_vec()).await;
        assert!(written.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reply_waiters_run_before_dispatch() {
        let task = Task::for_tests("42", "tok");
        let (mut session, mut upstream) =
            test_session(task, Connection::disconnected(0));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        session.waiters.expect_reply("VERDICT", move |bytes: &[u8]| {
            let _ = seen_tx.send(bytes.to_vec());
        });

        // Consumed by the waiter, not the command dispatcher.
        session.handle_frame(b"VERDICT OK".to_vec()).await;
        assert_eq!(seen_rx.try_recv().unwrap(), b"OK");
        assert!(upstream.try_recv().is_err());

        // One-shot: the next identical frame reaches the dispatcher.
        session.handle_frame(b"VERDICT OK".to_vec()).await;
        assert!(upstream.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_stream_pump_normal_and_on_end() {
        let (connection, mut written) = Connection::capture(0);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_streams(
            connection,
            7,
            StreamMode::Normal,
            StreamMode::OnEnd,
            events_rx,
        ));

        events_tx.send(AttachEvent::Stdout(b"hi".to_vec())).unwrap();
        events_tx.send(AttachEvent::Stderr(b"part one, ".to_vec())).unwrap();
        events_tx.send(AttachEvent::Stderr(b"part two".to_vec())).unwrap();

        // Normal mode: forwarded immediately.
        let frame = decode_frame(&written.recv().await.unwrap());
        assert_eq!(frame, b"STDOUT 7\nhi");

        // onEnd mode: one frame at stream end with everything buffered.
        drop(events_tx);
        pump.await.unwrap();
        let frame = decode_frame(&written.recv().await.unwrap());
        assert_eq!(frame, b"STDERR 7\npart one, part two");
        assert!(written.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_pump_none_discards() {
        let (connection, mut written) = Connection::capture(0);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_streams(
            connection,
            7,
            StreamMode::None,
            StreamMode::None,
            events_rx,
        ));
        events_tx.send(AttachEvent::Stdout(b"hi".to_vec())).unwrap();
        events_tx.send(AttachEvent::Stderr(b"err".to_vec())).unwrap();
        drop(events_tx);
        pump.await.unwrap();
        assert!(written.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_router_authenticates_token_then_commands() {
        let registry = TaskRegistry::for_tests();
        let task = Task::for_tests("42", "correct-token");
        registry.insert_for_tests(Arc::clone(&task));
        let mut router = SessionRouter::new(registry);

        let connection = Connection::disconnected(3);
        router.handle_event(BusEvent::Connected(connection));

        // Wrong token: no session, connection stays usable.
        router.handle_event(BusEvent::Frame(3, b"wrong-token".to_vec()));
        assert!(!task.has_session());
        assert!(router.sessions.is_empty());

        // Correct token on the same connection binds a session.
        router.handle_event(BusEvent::Frame(3, b"correct-token".to_vec()));
        assert!(task.has_session());
        assert_eq!(router.sessions.len(), 1);

        // A second connection presenting the same token is rejected.
        router.handle_event(BusEvent::Connected(Connection::disconnected(4)));
        router.handle_event(BusEvent::Frame(4, b"correct-token".to_vec()));
        assert_eq!(router.sessions.len(), 1);

        router.handle_event(BusEvent::Closed(3));
        assert!(router.sessions.is_empty());
    }
}
