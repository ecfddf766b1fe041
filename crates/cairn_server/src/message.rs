//! Line-oriented wire messages: a method line, `Name: value` headers, and an
//! optional body framed by `Content-Length`.
//!
//! The same shape is used for requests (method line = command name) and
//! responses (method line = `<code> <reason>`). Header keys are
//! case-sensitive and the first occurrence of a repeated key wins.

use std::collections::HashMap;
use std::io::BufRead;
use std::io::Read;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const STATUS_OK: &str = "200 OK";
pub const STATUS_BAD_REQUEST: &str = "400 Bad Request";
pub const STATUS_NOT_FOUND: &str = "404 Not Found";
pub const STATUS_UNRECOGNIZED: &str = "404 Unrecognized command";
pub const STATUS_BLACKLISTED: &str = "500 Blacklisted";
pub const STATUS_INTERNAL_ERROR: &str = "500 Internal Error";
pub const STATUS_COMMIT_CONFLICT: &str = "500 Commit Conflict";
pub const STATUS_ESCALATION_FAILED: &str = "500 Escalation Failed";
pub const STATUS_TIMEOUT: &str = "555 Timeout";

const CONTENT_LENGTH: &str = "Content-Length";

/// Largest body we will accept off the wire.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub method_line: String,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(method_line: impl Into<String>) -> Self {
        Self {
            method_line: method_line.into(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Build a response message from a `<code> <reason>` status line.
    pub fn response(status_line: impl Into<String>) -> Self {
        Self::new(status_line)
    }

    pub fn is_empty(&self) -> bool {
        self.method_line.is_empty() && self.headers.is_empty() && self.body.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Header value parsed as `u64`, or 0 when absent or malformed.
    pub fn u64_header(&self, name: &str) -> u64 {
        self.get(name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    /// Numeric status code of a response line, or 0 when there is none.
    pub fn code(&self) -> u16 {
        self.method_line
            .split_whitespace()
            .next()
            .and_then(|w| w.parse::<u16>().ok())
            .unwrap_or(0)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code())
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        self
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Serialize for the wire. Headers are emitted in sorted order so output
    /// is deterministic; `Content-Length` is added whenever a body exists.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.method_line.as_bytes());
        out.extend_from_slice(b"\r\n");
        let mut names: Vec<&String> = self.headers.keys().collect();
        names.sort();
        for name in names {
            if name == CONTENT_LENGTH {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(self.headers[name].as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("{CONTENT_LENGTH}: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Read one message from a blocking reader.
    ///
    /// Returns `Ok(None)` on a clean EOF before any bytes of a message; a
    /// connection that closes mid-message is an error. This is the signature
    /// clients use to distinguish "empty response" (peer died) from garbage.
    pub fn read_from<R: BufRead>(reader: &mut R) -> anyhow::Result<Option<Message>> {
        let method_line = loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).context("read method line")?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = trim_line(&line);
            if !trimmed.is_empty() {
                break trimmed.to_string();
            }
        };

        let mut msg = Message::new(method_line);
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).context("read header line")?;
            anyhow::ensure!(n != 0, "connection closed mid-message");
            let trimmed = trim_line(&line);
            if trimmed.is_empty() {
                break;
            }
            insert_header_line(&mut msg, trimmed)?;
        }

        let body_len = body_len(&msg)?;
        if body_len > 0 {
            let mut body = vec![0u8; body_len];
            reader.read_exact(&mut body).context("read body")?;
            msg.body = body;
        }
        Ok(Some(msg))
    }

    /// Async twin of [`Message::read_from`] for the connection tasks.
    pub async fn read_from_async<R>(reader: &mut R) -> anyhow::Result<Option<Message>>
    where
        R: AsyncBufRead + Unpin,
    {
        let method_line = loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.context("read method line")?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = trim_line(&line);
            if !trimmed.is_empty() {
                break trimmed.to_string();
            }
        };

        let mut msg = Message::new(method_line);
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.context("read header line")?;
            anyhow::ensure!(n != 0, "connection closed mid-message");
            let trimmed = trim_line(&line);
            if trimmed.is_empty() {
                break;
            }
            insert_header_line(&mut msg, trimmed)?;
        }

        let body_len = body_len(&msg)?;
        if body_len > 0 {
            let mut body = vec![0u8; body_len];
            reader.read_exact(&mut body).await.context("read body")?;
            msg.body = body;
        }
        Ok(Some(msg))
    }
}

fn trim_line(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

fn insert_header_line(msg: &mut Message, line: &str) -> anyhow::Result<()> {
    let (name, value) = line
        .split_once(':')
        .with_context(|| format!("malformed header line {line:?}"))?;
    let name = name.trim();
    anyhow::ensure!(!name.is_empty(), "empty header name");
    // First occurrence wins.
    if msg.get(name).is_none() {
        msg.set(name, value.trim());
    }
    Ok(())
}

fn body_len(msg: &Message) -> anyhow::Result<usize> {
    let len = msg.u64_header(CONTENT_LENGTH) as usize;
    anyhow::ensure!(len <= MAX_BODY_BYTES, "body of {len} bytes exceeds limit");
    Ok(len)
}
