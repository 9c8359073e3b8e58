//! Trigger/reply wire protocol.
//!
//! Client → relay: any bytes; only the first byte of a message counts, and
//! `Z` asks for a capture. Relay → client: one newline-terminated line per
//! answered trigger.
//!
//! How inbound bytes are split into messages is explicit (`Framing`) rather
//! than whatever a single socket read happens to return.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::str::FromStr;

/// Byte that starts a capture cycle.
pub const TAKE_PICTURE_SIGNAL: u8 = b'Z';

/// Upper bound on one inbound message.
pub const MAX_MESSAGE_BYTES: usize = 1024;

/// Sentinel reply when no plate could be read.
pub const NO_LEGIBLE: &str = "NO_LEGIBLE";

/// Sentinel reply when the camera produced no frame.
pub const CAPTURE_FAILED: &str = "CAPTURE_FAILED";

/// Inbound command, decided by the first byte of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    TakePicture,
    Ignored,
}

impl Command {
    pub fn parse(message: &[u8]) -> Self {
        match message.first() {
            Some(&TAKE_PICTURE_SIGNAL) => Self::TakePicture,
            _ => Self::Ignored,
        }
    }
}

/// Outbound reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Plate(String),
    NoLegible,
    Json(String),
    CaptureFailed,
}

impl Reply {
    /// Reply text without the line terminator.
    pub fn text(&self) -> String {
        match self {
            // A plate split over several text lines is reported dash-joined.
            Self::Plate(plate) => plate.replace(['\r', '\n'], "-"),
            Self::NoLegible => NO_LEGIBLE.to_string(),
            Self::Json(json) => json.replace(['\r', '\n'], " "),
            Self::CaptureFailed => CAPTURE_FAILED.to_string(),
        }
    }

    /// Bytes on the wire: the text plus exactly one `\n`.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.text().into_bytes();
        bytes.push(b'\n');
        bytes
    }
}

/// How inbound bytes are grouped into messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Each socket read (at most `MAX_MESSAGE_BYTES`) is one message.
    #[default]
    Chunk,
    /// Newline-terminated messages of at most `MAX_MESSAGE_BYTES`.
    Line,
}

impl FromStr for Framing {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "chunk" => Ok(Self::Chunk),
            "line" => Ok(Self::Line),
            other => Err(anyhow!(
                "unknown framing '{}' (expected 'chunk' or 'line')",
                other
            )),
        }
    }
}

/// Splits a byte stream into messages according to a `Framing`.
#[derive(Debug)]
pub struct MessageFramer {
    framing: Framing,
    pending: Vec<u8>,
    /// Inside an overlong line; drop bytes until the next newline.
    discarding: bool,
}

impl MessageFramer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending: Vec::new(),
            discarding: false,
        }
    }

    /// Feed bytes read from the connection; returns the messages they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        match self.framing {
            Framing::Chunk => bytes
                .chunks(MAX_MESSAGE_BYTES)
                .map(|chunk| chunk.to_vec())
                .collect(),
            Framing::Line => self.push_lines(bytes),
        }
    }

    /// Forget any partial message (the connection it came from is gone).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.discarding = false;
    }

    fn push_lines(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else {
                    let mut line = std::mem::take(&mut self.pending);
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    messages.push(line);
                }
                continue;
            }
            if self.discarding {
                continue;
            }
            if self.pending.len() == MAX_MESSAGE_BYTES {
                log::warn!(
                    "discarding inbound line longer than {} bytes",
                    MAX_MESSAGE_BYTES
                );
                self.pending.clear();
                self.discarding = true;
                continue;
            }
            self.pending.push(byte);
        }
        messages
    }
}

/// Printable, bounded rendering of a message for logs.
pub fn preview(message: &[u8]) -> String {
    const LIMIT: usize = 64;
    let text = String::from_utf8_lossy(&message[..message.len().min(LIMIT)]);
    let text = text.escape_debug().to_string();
    if message.len() > LIMIT {
        format!("{}… ({} bytes)", text, message.len())
    } else {
        text
    }
}
