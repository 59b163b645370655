//! Upstream WebSocket gateway.
//!
//! The gateway is the invoker's only link to the coordinator. Inbound
//! binary frames carry `START` (with the task archive as body) and
//! `STOP`; outbound text frames carry verdicts, operator exits, and
//! errors. All outbound traffic funnels through one queue drained by a
//! single writer task, so message order matches enqueue order.
//!
//! On transport failure the gateway goes Disconnected and queued writes
//! are dropped; reconnecting is the job of whatever supervises the
//! process.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use invoker_protocol::Verdict;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::registry::TaskRegistry;

/// Handshake timeout for the upstream connection.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Queue of messages bound for the coordinator.
pub type UpstreamSink = mpsc::UnboundedSender<Outbound>;

/// A message bound for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Verdict covering the whole task.
    FullVerdict {
        /// Task the verdict belongs to.
        task_id: String,
        /// Verdict code.
        verdict: Verdict,
        /// Free-form verdict payload.
        data: Vec<u8>,
    },
    /// Verdict covering one subtask.
    SubtaskVerdict {
        /// Task the verdict belongs to.
        task_id: String,
        /// Subtask identifier.
        subtask: String,
        /// Verdict code.
        verdict: Verdict,
        /// Free-form verdict payload.
        data: Vec<u8>,
    },
    /// The operator container exited.
    Exited {
        /// Task whose operator exited.
        task_id: String,
        /// Container exit code.
        exit_code: i64,
        /// Additional exit data.
        data: String,
    },
    /// A failure inside the invoker kept the task from running.
    InvokerError {
        /// Task the failure belongs to.
        task_id: String,
        /// Diagnostics.
        message: String,
    },
    /// A failure attributable to the operator program.
    OperatorError {
        /// Task the failure belongs to.
        task_id: String,
        /// Diagnostics.
        message: String,
    },
}

impl Outbound {
    /// Wire text of the message.
    pub fn to_text(&self) -> String {
        match self {
            Outbound::FullVerdict {
                task_id,
                verdict,
                data,
            } => format!(
                "{}\nVERDICT {}\n{}",
                task_id,
                verdict,
                String::from_utf8_lossy(data)
            ),
            Outbound::SubtaskVerdict {
                task_id,
                subtask,
                verdict,
                data,
            } => format!(
                "{}\nSUBTASK {}\nVERDICT {}\n{}",
                task_id,
                subtask,
                verdict,
                String::from_utf8_lossy(data)
            ),
            Outbound::Exited {
                task_id,
                exit_code,
                data,
            } => format!("{}\nEXITED {}\n{}", task_id, exit_code, data),
            Outbound::InvokerError { task_id, message } => {
                format!("{}\nERROR\n{}", task_id, message)
            }
            Outbound::OperatorError { task_id, message } => {
                format!("{}\nOPERROR\n{}", task_id, message)
            }
        }
    }
}

/// A parsed coordinator message.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Start { task_id: String, tar: Vec<u8> },
    Stop { task_id: String },
}

/// Parse `<taskId> <type>\n<body…>`.
fn parse_inbound(message: &[u8]) -> Result<Inbound> {
    let (header, body) = match message.iter().position(|&b| b == b'\n') {
        Some(nl) => (&message[..nl], &message[nl + 1..]),
        None => (message, &message[message.len()..]),
    };
    let header = std::str::from_utf8(header)
        .map_err(|_| Error::UpstreamMessage("header is not utf-8".to_string()))?;
    let mut words = header.split_whitespace();
    let task_id = words
        .next()
        .ok_or_else(|| Error::UpstreamMessage("missing task id".to_string()))?
        .to_string();
    let kind = words
        .next()
        .ok_or_else(|| Error::UpstreamMessage("missing message type".to_string()))?;
    match kind {
        "START" => Ok(Inbound::Start {
            task_id,
            tar: body.to_vec(),
        }),
        "STOP" => Ok(Inbound::Stop { task_id }),
        other => Err(Error::UpstreamMessage(format!(
            "unknown message type: {}",
            other
        ))),
    }
}

/// WebSocket client to the coordinator.
pub struct Gateway {
    url: String,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl Gateway {
    /// Create a gateway targeting `url`, along with the sink other
    /// components use to queue outbound messages.
    ///
    /// The sink is live immediately; messages queued before (or without)
    /// a successful connect are dropped when the gateway ends.
    pub fn new(url: impl Into<String>) -> (Self, UpstreamSink) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                url: url.into(),
                outbound: outbound_rx,
            },
            outbound_tx,
        )
    }

    /// Connect and serve until the transport drops.
    ///
    /// Inbound `START`/`STOP` dispatch to `registry`; each runs on its
    /// own task so a slow image build never stalls the read loop.
    pub async fn run(self, registry: Arc<TaskRegistry>) {
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()));
        let stream = match connect.await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                error!(url = %self.url, error = %e, "upstream connect failed");
                return;
            }
            Err(_) => {
                error!(url = %self.url, timeout_secs = CONNECT_TIMEOUT.as_secs(), "upstream connect timed out");
                return;
            }
        };
        info!(url = %self.url, "connected to coordinator");
        let (mut ws_sink, mut ws_stream) = stream.split();

        let mut outbound = self.outbound;
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(message.to_text())).await {
                    warn!(error = %e, "upstream write failed, dropping queue");
                    break;
                }
            }
        });

        while let Some(message) = ws_stream.next().await {
            let bytes = match message {
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "upstream read failed");
                    break;
                }
            };
            match parse_inbound(&bytes) {
                Ok(Inbound::Start { task_id, tar }) => {
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        match registry.start_task(&task_id, tar).await {
                            Ok(_) => {}
                            Err(Error::TaskExists(_)) => {
                                warn!(task_id = %task_id, "duplicate START ignored");
                            }
                            Err(e) => {
                                let _ = registry.upstream().send(Outbound::InvokerError {
                                    task_id: task_id.clone(),
                                    message: e.to_string(),
                                });
                            }
                        }
                    });
                }
                Ok(Inbound::Stop { task_id }) => {
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        registry.stop_task(&task_id).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "ignoring malformed upstream message");
                }
            }
        }
        info!("upstream connection closed");
        writer.abort();
    }
}
