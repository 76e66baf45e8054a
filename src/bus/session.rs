//! The session trait and the socket-backed client
//!
//! `BusSession` is the manager's whole view of the control bus. The
//! socket client speaks the framed JSON protocol over a Unix stream
//! socket; tests talk to a recording mock instead.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use serde_json::{json, Value};

use crate::bus::message::{Answer, BusEvent};
use crate::bus::wire::{self, WireError};

#[derive(Debug)]
pub enum BusError {
    Wire(WireError),
    Io(io::Error),
    Disconnected,
    UnexpectedReply(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Wire(e) => write!(f, "wire error: {}", e),
            BusError::Io(e) => write!(f, "IO error: {}", e),
            BusError::Disconnected => write!(f, "bus peer disconnected"),
            BusError::UnexpectedReply(text) => write!(f, "unexpected bus reply: {}", text),
        }
    }
}

impl std::error::Error for BusError {}

impl From<io::Error> for BusError {
    fn from(err: io::Error) -> Self {
        BusError::Io(err)
    }
}

impl From<WireError> for BusError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(ref io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => {
                BusError::Disconnected
            }
            other => BusError::Wire(other),
        }
    }
}

type Result<T> = std::result::Result<T, BusError>;

/// Everything the manager does with the bus.
///
/// All sends are fire-and-forget except `members`, the one startup rpc,
/// which blocks until its reply arrives.
pub trait BusSession {
    /// The descriptor the manager's poll loop watches for readability.
    fn poll_fd(&self) -> RawFd;

    /// Whether events are already buffered, so the next `receive` call
    /// returns without touching the descriptor. Callers must check this
    /// before blocking on `poll_fd`.
    fn has_pending(&self) -> bool {
        false
    }

    /// Drain whatever events are available right now.
    fn receive(&mut self) -> Result<Vec<BusEvent>>;

    fn subscribe(&mut self, group: &str) -> Result<()>;

    /// Send a command to one member of a group.
    fn group_sendmsg(&mut self, group: &str, to: &str, command: &str, args: Value) -> Result<()>;

    fn send_answer(&mut self, reply_to: &str, answer: &Answer) -> Result<()>;

    /// Ask the bus who is subscribed to a group.
    fn members(&mut self, group: &str) -> Result<Vec<String>>;
}

pub struct SocketSession {
    stream: UnixStream,
    /// Events read while waiting for an rpc reply, kept for `receive`.
    pending: VecDeque<BusEvent>,
}

impl SocketSession {
    pub fn connect(path: &Path) -> Result<SocketSession> {
        let stream = UnixStream::connect(path)?;
        Ok(SocketSession {
            stream,
            pending: VecDeque::new(),
        })
    }

    fn event_from_value(value: &Value) -> Option<BusEvent> {
        let reply_to = |v: &Value| v.get("reply").and_then(Value::as_str).map(str::to_string);
        let args = |v: &Value| v.get("args").cloned().unwrap_or_else(|| json!({}));
        match value.get("op").and_then(Value::as_str)? {
            "command" => Some(BusEvent::Command {
                name: value.get("name")?.as_str()?.to_string(),
                args: args(value),
                reply_to: reply_to(value),
            }),
            "notification" => Some(BusEvent::Notification {
                group: value.get("group")?.as_str()?.to_string(),
                event: value.get("event")?.as_str()?.to_string(),
                args: args(value),
            }),
            "config" => {
                let config = value.get("value")?.clone();
                let reply_to = reply_to(value);
                match value.get("module").and_then(Value::as_str) {
                    Some("data_sources") => Some(BusEvent::DatasrcConfig {
                        value: config,
                        reply_to,
                    }),
                    _ => Some(BusEvent::ModuleConfig {
                        value: config,
                        reply_to,
                    }),
                }
            }
            _ => None,
        }
    }
}

impl BusSession for SocketSession {
    fn poll_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn receive(&mut self) -> Result<Vec<BusEvent>> {
        if !self.pending.is_empty() {
            return Ok(self.pending.drain(..).collect());
        }
        let value = wire::read_frame(&mut self.stream)?;
        match Self::event_from_value(&value) {
            Some(event) => Ok(vec![event]),
            None => {
                log::warn!("ignoring unrecognized bus message: {}", value);
                Ok(Vec::new())
            }
        }
    }

    fn subscribe(&mut self, group: &str) -> Result<()> {
        wire::write_frame(&mut self.stream, &json!({"op": "subscribe", "group": group}))?;
        Ok(())
    }

    fn group_sendmsg(&mut self, group: &str, to: &str, command: &str, args: Value) -> Result<()> {
        let message = json!({
            "op": "send",
            "group": group,
            "to": to,
            "command": command,
            "args": args,
        });
        wire::write_frame(&mut self.stream, &message)?;
        Ok(())
    }

    fn send_answer(&mut self, reply_to: &str, answer: &Answer) -> Result<()> {
        let mut message = answer.to_value();
        message["op"] = json!("answer");
        message["reply"] = json!(reply_to);
        wire::write_frame(&mut self.stream, &message)?;
        Ok(())
    }

    fn members(&mut self, group: &str) -> Result<Vec<String>> {
        wire::write_frame(&mut self.stream, &json!({"op": "members", "group": group}))?;
        // Anything but the reply gets queued for the next receive call.
        loop {
            let value = wire::read_frame(&mut self.stream)?;
            if value.get("op").and_then(Value::as_str) == Some("members") {
                let Some(list) = value.get("members").and_then(Value::as_array) else {
                    return Err(BusError::UnexpectedReply(value.to_string()));
                };
                return Ok(list
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect());
            }
            match Self::event_from_value(&value) {
                Some(event) => self.pending.push_back(event),
                None => log::warn!("ignoring unrecognized bus message: {}", value),
            }
        }
    }
}
