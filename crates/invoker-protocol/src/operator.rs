//! Operator-side client API.
//!
//! A driver program running inside a task container links against this
//! module to control its task: connect to the invoker's control socket,
//! authenticate with the init token, build images, run containers, and
//! report verdicts.
//!
//! The invoker hands both endpoints to the operator via environment
//! variables: `SOCKET_PATH` (the socket as mounted inside the container)
//! and `INIT_TOKEN` (replayed verbatim as the first frame).

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::command::{StreamMode, Verdict};
use crate::{encode_frame, FrameDecoder};

/// How long request-reply commands (`HOST`, `PORT`) wait for their reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Read buffer size for the reader thread.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Callback invoked with one stdio chunk.
pub type ChunkCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Ordered set of pending one-shot reply handlers.
///
/// Request-reply commands register a handler keyed by the reply's keyword
/// prefix (`HOST`, `PORT`). Inbound frames are tried against the pending
/// handlers first, FIFO, before any other interpretation; the first
/// matching handler fires exactly once and is removed.
#[derive(Default)]
pub struct ReplyWaiters {
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    prefix: String,
    callback: Box<dyn FnOnce(&[u8]) + Send>,
}

impl ReplyWaiters {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a one-shot handler for the next frame starting with
    /// `prefix`. The handler receives the frame bytes after the prefix
    /// and one separating space.
    pub fn expect_reply(
        &mut self,
        prefix: impl Into<String>,
        callback: impl FnOnce(&[u8]) + Send + 'static,
    ) {
        self.waiters.push_back(Waiter {
            prefix: prefix.into(),
            callback: Box::new(callback),
        });
    }

    /// Try the frame against pending handlers, front to back.
    ///
    /// Returns `true` if a handler matched (and was consumed).
    pub fn try_dispatch(&mut self, frame: &[u8]) -> bool {
        let matched = self.waiters.iter().position(|w| {
            let prefix = w.prefix.as_bytes();
            frame.starts_with(prefix)
                && matches!(frame.get(prefix.len()), None | Some(b' ') | Some(b'\n'))
        });
        let Some(idx) = matched else {
            return false;
        };
        let waiter = self.waiters.remove(idx).expect("index from position");
        let mut rest = &frame[waiter.prefix.len()..];
        if let Some((_, tail)) = rest.split_first() {
            rest = tail;
        }
        (waiter.callback)(rest);
        true
    }

    /// Number of handlers still pending.
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

#[derive(Default)]
struct StreamHandlers {
    stdout: Option<ChunkCallback>,
    stderr: Option<ChunkCallback>,
}

struct ApiInner {
    writer: Mutex<UnixStream>,
    waiters: Mutex<ReplyWaiters>,
    streams: Mutex<HashMap<u32, StreamHandlers>>,
    images: AtomicU32,
    containers: AtomicU32,
}

impl ApiInner {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        let frame = encode_frame(payload);
        let mut writer = self.writer.lock().expect("writer lock");
        writer.write_all(&frame)
    }
}

/// Container configuration, assembled before [`OperatorApi::run`].
#[derive(Clone)]
pub struct RunTemplate {
    image: u32,
    stdout: StreamMode,
    stderr: StreamMode,
    ports: Vec<u16>,
    volumes: Vec<(String, String)>,
    env: Vec<(String, String)>,
    networks: Vec<String>,
    init_stdin: Vec<u8>,
}

impl RunTemplate {
    /// Start a template for the given image handle.
    pub fn new(image: ImageHandle) -> Self {
        Self {
            image: image.0,
            stdout: StreamMode::Normal,
            stderr: StreamMode::OnEnd,
            ports: Vec::new(),
            volumes: Vec::new(),
            env: Vec::new(),
            networks: Vec::new(),
            init_stdin: Vec::new(),
        }
    }

    /// Set the stdout routing mode.
    pub fn stdout(mut self, mode: StreamMode) -> Self {
        self.stdout = mode;
        self
    }

    /// Set the stderr routing mode.
    pub fn stderr(mut self, mode: StreamMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Publish a container port on the same-numbered host port.
    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    /// Add a bind mount.
    pub fn volume(mut self, host: impl Into<String>, container: impl Into<String>) -> Self {
        self.volumes.push((host.into(), container.into()));
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Attach the container to a logical task network.
    pub fn network(mut self, name: impl Into<String>) -> Self {
        self.networks.push(name.into());
        self
    }

    /// Append bytes delivered to the container's stdin right after start.
    pub fn stdin(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.init_stdin.extend_from_slice(bytes.as_ref());
        self
    }

    fn to_payload(&self, container: u32) -> Vec<u8> {
        let mut out = format!(
            "RUN {} {}\nSTDOUT {}\nSTDERR {}",
            container, self.image, self.stdout, self.stderr
        )
        .into_bytes();
        if !self.ports.is_empty() {
            out.extend_from_slice(b"\nPORTS");
            for port in &self.ports {
                out.extend_from_slice(format!(" {}", port).as_bytes());
            }
        }
        for (host, cont) in &self.volumes {
            out.extend_from_slice(format!("\nVOLUME\n{}\n{}", host, cont).as_bytes());
        }
        for (key, value) in &self.env {
            out.extend_from_slice(format!("\nENV {} {}", key, value).as_bytes());
        }
        for network in &self.networks {
            out.extend_from_slice(format!("\nNETWORK {}", network).as_bytes());
        }
        if !self.init_stdin.is_empty() {
            out.extend_from_slice(b"\nWRITE\n");
            out.extend_from_slice(&self.init_stdin);
        }
        out
    }
}

/// Handle to an image built through [`OperatorApi::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHandle(u32);

/// Handle to a container started through [`OperatorApi::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHandle(u32);

impl ContainerHandle {
    /// The raw operator-assigned id, as it appears on the wire.
    pub fn id(&self) -> u32 {
        self.0
    }
}

/// Client connection to the invoker's control socket.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct OperatorApi {
    inner: Arc<ApiInner>,
}

impl OperatorApi {
    /// Connect using `SOCKET_PATH` and `INIT_TOKEN` from the environment.
    pub fn from_env() -> io::Result<Self> {
        let path = std::env::var("SOCKET_PATH")
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "SOCKET_PATH not set"))?;
        let token = std::env::var("INIT_TOKEN")
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "INIT_TOKEN not set"))?;
        Self::connect(path, &token)
    }

    /// Connect to the control socket and authenticate with `token`.
    pub fn connect(path: impl AsRef<Path>, token: &str) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        let reader = stream.try_clone()?;
        let inner = Arc::new(ApiInner {
            writer: Mutex::new(stream),
            waiters: Mutex::new(ReplyWaiters::new()),
            streams: Mutex::new(HashMap::new()),
            images: AtomicU32::new(0),
            containers: AtomicU32::new(0),
        });
        inner.send(token.as_bytes())?;
        let thread_inner = Arc::clone(&inner);
        std::thread::spawn(move || read_loop(reader, thread_inner));
        Ok(Self { inner })
    }

    /// Build an image from a context directory on the invoker side.
    pub fn build(&self, context: &str, dockerfile: &str) -> io::Result<ImageHandle> {
        let handle = self.inner.images.fetch_add(1, Ordering::Relaxed);
        let payload = format!("BUILD {}\n{}\n{}", handle, context, dockerfile);
        self.inner.send(payload.as_bytes())?;
        Ok(ImageHandle(handle))
    }

    /// Create and start a container from a template.
    pub fn run(&self, template: &RunTemplate) -> io::Result<ContainerHandle> {
        let handle = self.inner.containers.fetch_add(1, Ordering::Relaxed);
        self.inner.send(&template.to_payload(handle))?;
        Ok(ContainerHandle(handle))
    }

    /// Restart a container.
    pub fn restart(&self, container: ContainerHandle) -> io::Result<()> {
        self.inner.send(format!("RESTART {}", container.0).as_bytes())
    }

    /// Stop a container.
    pub fn stop(&self, container: ContainerHandle) -> io::Result<()> {
        self.inner.send(format!("STOP {}", container.0).as_bytes())
    }

    /// Write bytes to a container's stdin.
    pub fn write(&self, container: ContainerHandle, data: impl AsRef<[u8]>) -> io::Result<()> {
        let mut payload = format!("WRITE {}\n", container.0).into_bytes();
        payload.extend_from_slice(data.as_ref());
        self.inner.send(&payload)
    }

    /// Resolve the engine-assigned name of a container, blocking for the reply.
    pub fn host(&self, container: ContainerHandle) -> io::Result<String> {
        let (tx, rx) = mpsc::channel();
        self.inner
            .waiters
            .lock()
            .expect("waiters lock")
            .expect_reply("HOST", move |bytes: &[u8]| {
                let _ = tx.send(String::from_utf8_lossy(bytes).into_owned());
            });
        self.inner.send(format!("HOST {}", container.0).as_bytes())?;
        rx.recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no HOST reply"))
    }

    /// Resolve the published host port for a container port, blocking for
    /// the reply. Legacy; invokers without port bindings never answer.
    pub fn port(&self, container: ContainerHandle, port: u16) -> io::Result<u16> {
        let (tx, rx) = mpsc::channel();
        self.inner
            .waiters
            .lock()
            .expect("waiters lock")
            .expect_reply("PORT", move |bytes: &[u8]| {
                let _ = tx.send(String::from_utf8_lossy(bytes).trim().parse::<u16>());
            });
        self.inner
            .send(format!("PORT {}\n{}", container.0, port).as_bytes())?;
        rx.recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no PORT reply"))?
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad PORT reply"))
    }

    /// Subscribe to stdout chunks of a container.
    pub fn on_stdout(&self, container: ContainerHandle, callback: impl FnMut(&[u8]) + Send + 'static) {
        let mut streams = self.inner.streams.lock().expect("streams lock");
        streams.entry(container.0).or_default().stdout = Some(Box::new(callback));
    }

    /// Subscribe to stderr chunks of a container.
    pub fn on_stderr(&self, container: ContainerHandle, callback: impl FnMut(&[u8]) + Send + 'static) {
        let mut streams = self.inner.streams.lock().expect("streams lock");
        streams.entry(container.0).or_default().stderr = Some(Box::new(callback));
    }

    /// Report the verdict for the whole task.
    pub fn verdict(&self, verdict: Verdict, data: impl AsRef<[u8]>) -> io::Result<()> {
        self.send_verdict(verdict, None, data.as_ref())
    }

    /// Report the verdict for one subtask.
    pub fn subtask_verdict(
        &self,
        subtask: &str,
        verdict: Verdict,
        data: impl AsRef<[u8]>,
    ) -> io::Result<()> {
        self.send_verdict(verdict, Some(subtask), data.as_ref())
    }

    fn send_verdict(&self, verdict: Verdict, subtask: Option<&str>, data: &[u8]) -> io::Result<()> {
        let mut payload = format!("VERDICT {}", verdict).into_bytes();
        if let Some(subtask) = subtask {
            payload.extend_from_slice(format!(" SUB {}", subtask).as_bytes());
        }
        if !data.is_empty() {
            payload.extend_from_slice(b" DATA\n");
            payload.extend_from_slice(data);
        }
        self.inner.send(&payload)
    }
}

/// Reader thread: reassemble frames, route replies then stream chunks.
fn read_loop(mut stream: UnixStream, inner: Arc<ApiInner>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.extend(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => dispatch_frame(&inner, &frame),
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
}

fn dispatch_frame(inner: &ApiInner, frame: &[u8]) {
    if inner
        .waiters
        .lock()
        .expect("waiters lock")
        .try_dispatch(frame)
    {
        return;
    }
    // STDOUT <id>\n<bytes> / STDERR <id>\n<bytes>
    let Some(nl) = frame.iter().position(|&b| b == b'\n') else {
        return;
    };
    let Ok(header) = std::str::from_utf8(&frame[..nl]) else {
        return;
    };
    let mut words = header.split_whitespace();
    let keyword = words.next();
    let Some(container) = words.next().and_then(|w| w.parse::<u32>().ok()) else {
        return;
    };
    let chunk = &frame[nl + 1..];
    let mut streams = inner.streams.lock().expect("streams lock");
    let Some(handlers) = streams.get_mut(&container) else {
        return;
    };
    match keyword {
        Some("STDOUT") => {
            if let Some(cb) = handlers.stdout.as_mut() {
                cb(chunk);
            }
        }
        Some("STDERR") => {
            if let Some(cb) = handlers.stderr.as_mut() {
                cb(chunk);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::OperatorCommand;
    use std::os::unix::net::UnixListener;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_reply_waiters_fifo_one_shot() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = ReplyWaiters::new();
        for label in ["first", "second"] {
            let fired = Arc::clone(&fired);
            waiters.expect_reply("HOST", move |bytes: &[u8]| {
                fired
                    .lock()
                    .unwrap()
                    .push((label, String::from_utf8_lossy(bytes).into_owned()));
            });
        }
        assert!(waiters.try_dispatch(b"HOST alpha"));
        assert!(waiters.try_dispatch(b"HOST beta"));
        assert!(!waiters.try_dispatch(b"HOST gamma"));
        assert_eq!(
            *fired.lock().unwrap(),
            vec![
                ("first", "alpha".to_string()),
                ("second", "beta".to_string())
            ]
        );
    }

    #[test]
    fn test_reply_waiters_prefix_must_be_word() {
        let hit = Arc::new(AtomicBool::new(false));
        let mut waiters = ReplyWaiters::new();
        let flag = Arc::clone(&hit);
        waiters.expect_reply("PORT", move |_: &[u8]| {
            flag.store(true, Ordering::SeqCst);
        });
        // "PORTS" must not satisfy a "PORT" waiter.
        assert!(!waiters.try_dispatch(b"PORTS 8080"));
        assert!(waiters.try_dispatch(b"PORT 8080"));
        assert!(hit.load(Ordering::SeqCst));
        assert_eq!(waiters.pending(), 0);
    }

    #[test]
    fn test_run_template_payload_parses_back() {
        let template = RunTemplate::new(ImageHandle(2))
            .stdout(StreamMode::Normal)
            .stderr(StreamMode::None)
            .volume("/vol", "/v")
            .env("X", "1")
            .network("net_a")
            .stdin(b"seed\ndata");
        let cmd = OperatorCommand::parse(&template.to_payload(9)).unwrap();
        let OperatorCommand::Run {
            container,
            image,
            spec,
        } = cmd
        else {
            panic!("expected Run");
        };
        assert_eq!(container, 9);
        assert_eq!(image, 2);
        assert_eq!(spec.stderr, StreamMode::None);
        assert_eq!(spec.volumes, vec![("/vol".to_string(), "/v".to_string())]);
        assert_eq!(spec.init_stdin, b"seed\ndata");
    }

    #[test]
    fn test_connect_sends_token_then_commands() {
        let dir = std::env::temp_dir().join(format!("invoker_op_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let socket = dir.join("op.sock");
        let _ = std::fs::remove_file(&socket);
        let listener = UnixListener::bind(&socket).unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut decoder = FrameDecoder::new();
            let mut frames = Vec::new();
            let mut buf = [0u8; 4096];
            while frames.len() < 2 {
                let n = conn.read(&mut buf).unwrap();
                assert!(n > 0, "peer closed early");
                decoder.extend(&buf[..n]);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    frames.push(frame);
                }
            }
            // Frame 0 is the raw token; frame 1 the HOST request.
            assert_eq!(frames[0], b"secret-token");
            assert_eq!(frames[1], b"HOST 0");
            conn.write_all(&encode_frame(b"HOST task-42-operator")).unwrap();
            conn
        });

        let api = OperatorApi::connect(&socket, "secret-token").unwrap();
        let name = api.host(ContainerHandle(0)).unwrap();
        assert_eq!(name, "task-42-operator");

        drop(server.join().unwrap());
        let _ = std::fs::remove_file(&socket);
        let _ = std::fs::remove_dir(&dir);
    }
}
