//! Operator command grammar.
//!
//! Commands travel one per frame. The first whitespace-separated token of
//! the first line selects the command; the rest of the grammar is
//! line-oriented except for `WRITE` bodies and `VERDICT` data, which
//! consume the remainder of the frame as raw bytes (newlines included).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error produced while parsing an operator command frame.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The frame was empty or contained only whitespace.
    #[error("empty command frame")]
    Empty,
    /// The command header was not valid UTF-8.
    #[error("command header is not utf-8")]
    NotUtf8,
    /// The frame did not match the grammar of its command.
    #[error("malformed {command} command: {reason}")]
    Malformed {
        /// Command keyword being parsed.
        command: &'static str,
        /// What was wrong.
        reason: &'static str,
    },
    /// The first token did not name a known command.
    #[error("unknown command: {0}")]
    Unknown(String),
}

fn malformed(command: &'static str, reason: &'static str) -> CommandError {
    CommandError::Malformed { command, reason }
}

/// How a container stdio stream is routed back to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Do not attach the stream.
    None,
    /// Buffer the stream and deliver it as one frame when the container exits.
    OnEnd,
    /// Forward each chunk as it arrives.
    Normal,
}

impl FromStr for StreamMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(StreamMode::None),
            "onEnd" => Ok(StreamMode::OnEnd),
            "normal" => Ok(StreamMode::Normal),
            _ => Err(()),
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamMode::None => write!(f, "none"),
            StreamMode::OnEnd => write!(f, "onEnd"),
            StreamMode::Normal => write!(f, "normal"),
        }
    }
}

/// Judgement outcome reported by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // the codes are the contest-standard abbreviations
pub enum Verdict {
    Ok,
    Wa,
    Tl,
    Ml,
    Itl,
    Rtl,
    Rml,
    Ce,
    Err,
}

impl FromStr for Verdict {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "OK" => Ok(Verdict::Ok),
            "WA" => Ok(Verdict::Wa),
            "TL" => Ok(Verdict::Tl),
            "ML" => Ok(Verdict::Ml),
            "ITL" => Ok(Verdict::Itl),
            "RTL" => Ok(Verdict::Rtl),
            "RML" => Ok(Verdict::Rml),
            "CE" => Ok(Verdict::Ce),
            "ERR" => Ok(Verdict::Err),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Verdict::Ok => "OK",
            Verdict::Wa => "WA",
            Verdict::Tl => "TL",
            Verdict::Ml => "ML",
            Verdict::Itl => "ITL",
            Verdict::Rtl => "RTL",
            Verdict::Rml => "RML",
            Verdict::Ce => "CE",
            Verdict::Err => "ERR",
        };
        write!(f, "{}", code)
    }
}

/// Parsed body of a `RUN` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    /// Stdout routing mode.
    pub stdout: StreamMode,
    /// Stderr routing mode.
    pub stderr: StreamMode,
    /// Container ports published to same-numbered host ports (legacy).
    pub ports: Vec<u16>,
    /// Bind mounts as (host path, container path).
    pub volumes: Vec<(String, String)>,
    /// Environment variables as (key, value).
    pub env: Vec<(String, String)>,
    /// Logical network names, resolved against the task's network map.
    pub networks: Vec<String>,
    /// Bytes written to the container's stdin right after start.
    pub init_stdin: Vec<u8>,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            stdout: StreamMode::Normal,
            stderr: StreamMode::OnEnd,
            ports: Vec::new(),
            volumes: Vec::new(),
            env: Vec::new(),
            networks: Vec::new(),
            init_stdin: Vec::new(),
        }
    }
}

/// A command received from an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Build an image from a context directory.
    Build {
        /// Operator-assigned image handle.
        image: u32,
        /// Build context directory path.
        context: String,
        /// Dockerfile path relative to the context.
        dockerfile: String,
    },
    /// Create and start a container from a previously built image.
    Run {
        /// Operator-assigned container handle.
        container: u32,
        /// Image handle to run.
        image: u32,
        /// Container configuration.
        spec: RunSpec,
    },
    /// Restart a container.
    Restart {
        /// Container handle.
        container: u32,
    },
    /// Stop a container.
    Stop {
        /// Container handle.
        container: u32,
    },
    /// Write bytes to a container's stdin.
    Write {
        /// Container handle.
        container: u32,
        /// Raw bytes to deliver.
        data: Vec<u8>,
    },
    /// Ask for the container's engine-assigned name.
    Host {
        /// Container handle.
        container: u32,
    },
    /// Ask for the published host port of a container port (legacy).
    Port {
        /// Container handle.
        container: u32,
        /// Container port to resolve.
        port: u16,
    },
    /// Report a judgement outcome.
    Verdict {
        /// Verdict code.
        verdict: Verdict,
        /// Subtask id, if this verdict covers a subtask rather than the task.
        subtask: Option<String>,
        /// Free-form verdict payload.
        data: Vec<u8>,
    },
}

/// Byte-level line cursor.
///
/// `WRITE`-style commands escape the line grammar, so the cursor must be
/// able to hand back the raw remainder mid-iteration.
struct Lines<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Lines<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Next line without its trailing newline, or `None` at end of frame.
    fn next_line(&mut self) -> Option<&'a [u8]> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                self.pos += nl + 1;
                Some(&rest[..nl])
            }
            None => {
                self.pos = self.data.len();
                Some(rest)
            }
        }
    }

    /// Everything after the last consumed newline, verbatim.
    fn remainder(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

fn line_str<'a>(line: &'a [u8]) -> Result<&'a str, CommandError> {
    std::str::from_utf8(line).map_err(|_| CommandError::NotUtf8)
}

fn parse_handle(
    word: Option<&str>,
    command: &'static str,
    reason: &'static str,
) -> Result<u32, CommandError> {
    word.and_then(|w| w.parse().ok())
        .ok_or_else(|| malformed(command, reason))
}

impl OperatorCommand {
    /// Parse one frame payload into a command.
    pub fn parse(frame: &[u8]) -> Result<Self, CommandError> {
        let mut lines = Lines::new(frame);
        let header = line_str(lines.next_line().ok_or(CommandError::Empty)?)?;
        let mut words = header.split_whitespace();
        let keyword = words.next().ok_or(CommandError::Empty)?;

        match keyword {
            "BUILD" => {
                let image = parse_handle(words.next(), "BUILD", "missing image handle")?;
                let context = line_str(
                    lines
                        .next_line()
                        .ok_or_else(|| malformed("BUILD", "missing context path"))?,
                )?
                .to_string();
                let dockerfile = line_str(
                    lines
                        .next_line()
                        .ok_or_else(|| malformed("BUILD", "missing dockerfile path"))?,
                )?
                .to_string();
                Ok(OperatorCommand::Build {
                    image,
                    context,
                    dockerfile,
                })
            }
            "RUN" => {
                let container = parse_handle(words.next(), "RUN", "missing container handle")?;
                let image = parse_handle(words.next(), "RUN", "missing image handle")?;
                let spec = parse_run_body(&mut lines)?;
                Ok(OperatorCommand::Run {
                    container,
                    image,
                    spec,
                })
            }
            "RESTART" => {
                let container = parse_handle(words.next(), "RESTART", "missing container handle")?;
                Ok(OperatorCommand::Restart { container })
            }
            "STOP" => {
                let container = parse_handle(words.next(), "STOP", "missing container handle")?;
                Ok(OperatorCommand::Stop { container })
            }
            "WRITE" => {
                let container = parse_handle(words.next(), "WRITE", "missing container handle")?;
                Ok(OperatorCommand::Write {
                    container,
                    data: lines.remainder().to_vec(),
                })
            }
            "HOST" => {
                let container = parse_handle(words.next(), "HOST", "missing container handle")?;
                Ok(OperatorCommand::Host { container })
            }
            "PORT" => {
                let container = parse_handle(words.next(), "PORT", "missing container handle")?;
                let port = line_str(
                    lines
                        .next_line()
                        .ok_or_else(|| malformed("PORT", "missing port"))?,
                )?
                .trim()
                .parse()
                .map_err(|_| malformed("PORT", "port is not a number"))?;
                Ok(OperatorCommand::Port { container, port })
            }
            "VERDICT" => parse_verdict(&mut words, &lines),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn parse_run_body(lines: &mut Lines<'_>) -> Result<RunSpec, CommandError> {
    let mut spec = RunSpec::default();
    while let Some(line) = lines.next_line() {
        let line = line_str(line)?;
        let mut words = line.split_whitespace();
        let Some(sub) = words.next() else {
            continue;
        };
        match sub {
            "STDOUT" => {
                spec.stdout = words
                    .next()
                    .and_then(|w| w.parse().ok())
                    .ok_or_else(|| malformed("RUN", "bad STDOUT mode"))?;
            }
            "STDERR" => {
                spec.stderr = words
                    .next()
                    .and_then(|w| w.parse().ok())
                    .ok_or_else(|| malformed("RUN", "bad STDERR mode"))?;
            }
            "PORTS" => {
                for word in words {
                    let port = word
                        .parse()
                        .map_err(|_| malformed("RUN", "bad PORTS entry"))?;
                    spec.ports.push(port);
                }
            }
            "VOLUME" => {
                let host = line_str(
                    lines
                        .next_line()
                        .ok_or_else(|| malformed("RUN", "VOLUME missing host path"))?,
                )?
                .to_string();
                let container = line_str(
                    lines
                        .next_line()
                        .ok_or_else(|| malformed("RUN", "VOLUME missing container path"))?,
                )?
                .to_string();
                spec.volumes.push((host, container));
            }
            "ENV" => {
                let key = words
                    .next()
                    .ok_or_else(|| malformed("RUN", "ENV missing key"))?
                    .to_string();
                let value = words.collect::<Vec<_>>().join(" ");
                spec.env.push((key, value));
            }
            "NETWORK" => {
                let name = words
                    .next()
                    .ok_or_else(|| malformed("RUN", "NETWORK missing name"))?
                    .to_string();
                spec.networks.push(name);
            }
            "WRITE" => {
                // Everything after "WRITE\n" is stdin, bytes preserved.
                spec.init_stdin = lines.remainder().to_vec();
                break;
            }
            _ => {
                // Unknown sub-keywords are skipped so old drivers keep working.
            }
        }
    }
    Ok(spec)
}

fn parse_verdict(
    words: &mut std::str::SplitWhitespace<'_>,
    lines: &Lines<'_>,
) -> Result<OperatorCommand, CommandError> {
    let verdict = words
        .next()
        .and_then(|w| w.parse().ok())
        .ok_or_else(|| malformed("VERDICT", "missing or unknown code"))?;
    let mut subtask = None;
    let mut data = Vec::new();
    let mut next = words.next();
    if next == Some("SUB") {
        subtask = Some(
            words
                .next()
                .ok_or_else(|| malformed("VERDICT", "SUB missing subtask id"))?
                .to_string(),
        );
        next = words.next();
    }
    if next == Some("DATA") {
        data = lines.remainder().to_vec();
    }
    Ok(OperatorCommand::Verdict {
        verdict,
        subtask,
        data,
    })
}

/// A message sent from the invoker to an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokerMessage {
    /// A stdout chunk from a container.
    Stdout {
        /// Operator-assigned container handle.
        container: u32,
        /// Chunk bytes.
        data: Vec<u8>,
    },
    /// A stderr chunk from a container.
    Stderr {
        /// Operator-assigned container handle.
        container: u32,
        /// Chunk bytes.
        data: Vec<u8>,
    },
    /// Reply to `HOST`: the engine-assigned container name.
    Host {
        /// Container name.
        name: String,
    },
    /// Reply to `PORT`: the published host port.
    Port {
        /// Host port.
        port: u16,
    },
}

impl InvokerMessage {
    /// Serialize into a frame payload.
    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            InvokerMessage::Stdout { container, data } => {
                let mut out = format!("STDOUT {}\n", container).into_bytes();
                out.extend_from_slice(data);
                out
            }
            InvokerMessage::Stderr { container, data } => {
                let mut out = format!("STDERR {}\n", container).into_bytes();
                out.extend_from_slice(data);
                out
            }
            InvokerMessage::Host { name } => format!("HOST {}", name).into_bytes(),
            InvokerMessage::Port { port } => format!("PORT {}", port).into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build() {
        let cmd = OperatorCommand::parse(b"BUILD 0\n/work\n./Dockerfile").unwrap();
        assert_eq!(
            cmd,
            OperatorCommand::Build {
                image: 0,
                context: "/work".to_string(),
                dockerfile: "./Dockerfile".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_run_full() {
        let frame = b"RUN 7 0\nSTDOUT normal\nSTDERR onEnd\nVOLUME\n/vol\n/v\nENV X 1\nNETWORK net_a";
        let cmd = OperatorCommand::parse(frame).unwrap();
        let OperatorCommand::Run {
            container,
            image,
            spec,
        } = cmd
        else {
            panic!("expected Run, got {:?}", cmd);
        };
        assert_eq!(container, 7);
        assert_eq!(image, 0);
        assert_eq!(spec.stdout, StreamMode::Normal);
        assert_eq!(spec.stderr, StreamMode::OnEnd);
        assert_eq!(spec.volumes, vec![("/vol".to_string(), "/v".to_string())]);
        assert_eq!(spec.env, vec![("X".to_string(), "1".to_string())]);
        assert_eq!(spec.networks, vec!["net_a".to_string()]);
        assert!(spec.init_stdin.is_empty());
    }

    #[test]
    fn test_parse_run_defaults() {
        let cmd = OperatorCommand::parse(b"RUN 1 2").unwrap();
        let OperatorCommand::Run { spec, .. } = cmd else {
            panic!("expected Run");
        };
        assert_eq!(spec.stdout, StreamMode::Normal);
        assert_eq!(spec.stderr, StreamMode::OnEnd);
    }

    #[test]
    fn test_parse_run_write_keeps_raw_bytes() {
        // Everything after WRITE\n belongs to stdin, newlines and all.
        let frame = b"RUN 1 0\nSTDERR none\nWRITE\nline one\nline two\n\x00binary";
        let cmd = OperatorCommand::parse(frame).unwrap();
        let OperatorCommand::Run { spec, .. } = cmd else {
            panic!("expected Run");
        };
        assert_eq!(spec.stderr, StreamMode::None);
        assert_eq!(spec.init_stdin, b"line one\nline two\n\x00binary");
    }

    #[test]
    fn test_parse_run_env_value_with_spaces() {
        let cmd = OperatorCommand::parse(b"RUN 1 0\nENV GREETING hello world").unwrap();
        let OperatorCommand::Run { spec, .. } = cmd else {
            panic!("expected Run");
        };
        assert_eq!(
            spec.env,
            vec![("GREETING".to_string(), "hello world".to_string())]
        );
    }

    #[test]
    fn test_parse_run_ports() {
        let cmd = OperatorCommand::parse(b"RUN 1 0\nPORTS 8080 9090").unwrap();
        let OperatorCommand::Run { spec, .. } = cmd else {
            panic!("expected Run");
        };
        assert_eq!(spec.ports, vec![8080, 9090]);
    }

    #[test]
    fn test_parse_run_skips_unknown_subkeyword() {
        let cmd = OperatorCommand::parse(b"RUN 1 0\nFROBNICATE yes\nNETWORK net_b").unwrap();
        let OperatorCommand::Run { spec, .. } = cmd else {
            panic!("expected Run");
        };
        assert_eq!(spec.networks, vec!["net_b".to_string()]);
    }

    #[test]
    fn test_parse_write_command() {
        let cmd = OperatorCommand::parse(b"WRITE 3\nsome\ninput\n").unwrap();
        assert_eq!(
            cmd,
            OperatorCommand::Write {
                container: 3,
                data: b"some\ninput\n".to_vec(),
            }
        );
    }

    #[test]
    fn test_parse_host_and_port() {
        assert_eq!(
            OperatorCommand::parse(b"HOST 7").unwrap(),
            OperatorCommand::Host { container: 7 }
        );
        assert_eq!(
            OperatorCommand::parse(b"PORT 7\n8080").unwrap(),
            OperatorCommand::Port {
                container: 7,
                port: 8080
            }
        );
    }

    #[test]
    fn test_parse_verdict_forms() {
        assert_eq!(
            OperatorCommand::parse(b"VERDICT OK").unwrap(),
            OperatorCommand::Verdict {
                verdict: Verdict::Ok,
                subtask: None,
                data: Vec::new(),
            }
        );
        assert_eq!(
            OperatorCommand::parse(b"VERDICT WA DATA\nexpected 4, got 5").unwrap(),
            OperatorCommand::Verdict {
                verdict: Verdict::Wa,
                subtask: None,
                data: b"expected 4, got 5".to_vec(),
            }
        );
        assert_eq!(
            OperatorCommand::parse(b"VERDICT OK SUB sub1 DATA\nhello").unwrap(),
            OperatorCommand::Verdict {
                verdict: Verdict::Ok,
                subtask: Some("sub1".to_string()),
                data: b"hello".to_vec(),
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            OperatorCommand::parse(b"FLY 1"),
            Err(CommandError::Unknown(_))
        ));
        assert!(matches!(
            OperatorCommand::parse(b""),
            Err(CommandError::Empty)
        ));
        assert!(matches!(
            OperatorCommand::parse(b"BUILD one\n/ctx\n./Dockerfile"),
            Err(CommandError::Malformed { .. })
        ));
    }

    #[test]
    fn test_invoker_message_payloads() {
        assert_eq!(
            InvokerMessage::Stdout {
                container: 7,
                data: b"hi".to_vec()
            }
            .to_payload(),
            b"STDOUT 7\nhi"
        );
        assert_eq!(
            InvokerMessage::Host {
                name: "task-42-op".to_string()
            }
            .to_payload(),
            b"HOST task-42-op"
        );
        assert_eq!(InvokerMessage::Port { port: 8080 }.to_payload(), b"PORT 8080");
    }

    #[test]
    fn test_verdict_display_roundtrip() {
        for code in ["OK", "WA", "TL", "ML", "ITL", "RTL", "RML", "CE", "ERR"] {
            let verdict: Verdict = code.parse().unwrap();
            assert_eq!(verdict.to_string(), code);
        }
        assert!("NOPE".parse::<Verdict>().is_err());
    }
}
