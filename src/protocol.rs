//! Child→parent messages, carried as lines on the child's stdout.
//!
//! A message line is `#! ` followed by a JSON object, e.g.
//! `#! {"type":"vars","vars":{"Addr":"127.0.0.1:8080"}}`. Everything else is
//! ordinary output.

use crate::error::{Error, Result};
use crate::lock;
use crate::output::{FanOut, Sink};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

pub const PREFIX: &str = "#! ";

const TYPE_READY: &str = "ready";
const TYPE_VARS: &str = "vars";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ready,
    Vars(HashMap<String, String>),
}

#[derive(Serialize, Deserialize)]
struct Wire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vars: Option<HashMap<String, String>>,
}

impl Message {
    /// Full line, prefix and trailing newline included.
    pub fn encode(&self) -> Result<String> {
        let wire = match self {
            Message::Ready => Wire {
                kind: TYPE_READY.to_string(),
                vars: None,
            },
            Message::Vars(vars) => Wire {
                kind: TYPE_VARS.to_string(),
                vars: Some(vars.clone()),
            },
        };
        let json = serde_json::to_string(&wire).map_err(|e| Error::Protocol(e.to_string()))?;
        Ok(format!("{}{}\n", PREFIX, json))
    }

    /// Parses the payload that follows the prefix.
    pub fn decode(payload: &[u8]) -> Result<Message> {
        let wire: Wire = serde_json::from_slice(payload)
            .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))?;
        match wire.kind.as_str() {
            TYPE_READY => Ok(Message::Ready),
            TYPE_VARS => Ok(Message::Vars(wire.vars.unwrap_or_default())),
            other => Err(Error::Protocol(format!("unknown message type: {:?}", other))),
        }
    }
}

fn send(msg: &Message) -> Result<()> {
    let line = msg.encode()?;
    let mut out = io::stdout().lock();
    out.write_all(line.as_bytes())?;
    out.flush()?;
    Ok(())
}

/// Tells the parent this process is ready, e.g. to serve requests.
pub fn send_ready() -> Result<()> {
    send(&Message::Ready)
}

/// Reports variables to the parent. Later values for a key replace earlier ones.
pub fn send_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Result<()>
where
    K: Into<String>,
    V: Into<String>,
{
    let vars = vars
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    send(&Message::Vars(vars))
}

/// Where decoded messages go.
pub trait Receiver: Send + Sync {
    fn on_message(&self, msg: Message);
    fn on_error(&self, err: Error);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    // Fewer than PREFIX.len() bytes of the current line seen.
    Undecided,
    Message,
    Passthrough,
    // A protocol error was reported; everything is forwarded verbatim.
    Failed,
}

struct State {
    mode: Mode,
    buf: Vec<u8>,
    downstream: FanOut,
}

/// Stdout sink that picks protocol lines out of the stream. Non-message bytes
/// are forwarded to the downstream sinks, so those see the output with the
/// messages removed.
pub struct Decoder {
    receiver: Arc<dyn Receiver>,
    state: Mutex<State>,
}

impl Decoder {
    pub fn new(receiver: Arc<dyn Receiver>, downstream: Vec<Arc<dyn Sink>>) -> Self {
        Self {
            receiver,
            state: Mutex::new(State {
                mode: Mode::Undecided,
                buf: Vec::new(),
                downstream: FanOut::new("decoded stdout", downstream),
            }),
        }
    }

    fn feed(&self, state: &mut State, data: &[u8], out: &mut Vec<u8>) {
        let prefix = PREFIX.as_bytes();
        for &b in data {
            match state.mode {
                Mode::Failed => out.push(b),
                Mode::Passthrough => {
                    out.push(b);
                    if b == b'\n' {
                        state.mode = Mode::Undecided;
                    }
                }
                Mode::Undecided => {
                    if b == b'\n' {
                        out.append(&mut state.buf);
                        out.push(b);
                        continue;
                    }
                    state.buf.push(b);
                    if !prefix.starts_with(&state.buf) {
                        out.append(&mut state.buf);
                        state.mode = Mode::Passthrough;
                    } else if state.buf.len() == prefix.len() {
                        state.buf.clear();
                        state.mode = Mode::Message;
                    }
                }
                Mode::Message => {
                    if b != b'\n' {
                        state.buf.push(b);
                        continue;
                    }
                    let decoded = Message::decode(&state.buf);
                    state.buf.clear();
                    match decoded {
                        Ok(msg) => {
                            state.mode = Mode::Undecided;
                            self.receiver.on_message(msg);
                        }
                        Err(e) => {
                            state.mode = Mode::Failed;
                            self.receiver.on_error(e);
                        }
                    }
                }
            }
        }
    }
}

impl Sink for Decoder {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);
        let mut out = Vec::with_capacity(buf.len());
        self.feed(&mut state, buf, &mut out);
        if !out.is_empty() {
            state.downstream.write(&out);
        }
        Ok(())
    }

    fn end_of_stream(&self) {
        let mut state = lock(&self.state);
        match state.mode {
            Mode::Undecided if !state.buf.is_empty() => {
                let rest = std::mem::take(&mut state.buf);
                state.downstream.write(&rest);
            }
            Mode::Message => {
                log::debug!("Discarding unterminated message line ({} bytes)", state.buf.len());
                state.buf.clear();
            }
            _ => {}
        }
        state.downstream.end_of_stream();
    }
}
