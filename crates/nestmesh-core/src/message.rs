//! The routable [`Message`] and the handful of payload shapes the system
//! protocol itself needs (spec.md §3, §6, SPEC_FULL.md §3).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved handles, pre-allocated on every [`crate::context::Context`].
/// User allocations start at 1000 and never collide with these.
pub const GET_MODULE: u32 = 100;
pub const CALL_FUNCTION: u32 = 101;
pub const FORWARD_LOG: u32 = 102;
pub const ADD_ROUTE: u32 = 103;

/// First handle value handed out by [`crate::context::Context::add_handler`].
pub const FIRST_USER_HANDLE: u32 = 1000;

/// Byte marker carried as `Message::data` to signal channel closure.
/// Not run through the object-serialization format: it is a protocol-level
/// sentinel the receiver recognizes by exact byte comparison, the same way
/// a zero-length payload or a fixed tag would be recognized in any other
/// framed protocol (spec.md §3, "`_DEAD`").
pub const DEAD_MARKER: &[u8] = b"\0nestmesh:dead\0";

/// A routable unit addressed by integer context ids (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub dst_id: u32,
    pub src_id: u32,
    pub handle: u32,
    pub reply_to: u32,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(dst_id: u32, src_id: u32, handle: u32, reply_to: u32, data: Vec<u8>) -> Self {
        Self { dst_id, src_id, handle, reply_to, data }
    }

    /// Builds a `_DEAD` delivery addressed at `handle` on `dst_id`.
    pub fn dead(dst_id: u32, src_id: u32, handle: u32) -> Self {
        Self::new(dst_id, src_id, handle, 0, DEAD_MARKER.to_vec())
    }

    pub fn is_dead(&self) -> bool {
        self.data == DEAD_MARKER
    }

    /// Total wire size of this message's frame, header included (§6).
    pub fn wire_len(&self) -> usize {
        crate::stream::HEADER_LEN + self.data.len()
    }
}

/// Encodes an arbitrary user value into an opaque `Message::data` payload.
///
/// Rust's static typing replaces the dynamic class-binding the original
/// object-serialization format relied on: sender and receiver agree on a
/// concrete type per handle, so a plain length-prefixed `bincode` encoding
/// is the idiomatic stand-in for "a self-describing object graph" here.
pub fn encode<T: Serialize>(value: &T) -> crate::error::Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> crate::error::Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Deserialized shape of a `CALL_FUNCTION` (101) request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMessage {
    pub with_context: bool,
    pub module: String,
    pub class: Option<String>,
    pub func: String,
    pub args: Vec<Vec<u8>>,
    pub kwargs: BTreeMap<String, Vec<u8>>,
}

/// Carries a remote exception's formatted traceback back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallError {
    pub traceback: String,
}

/// Reply body for a `CALL_FUNCTION` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallResult {
    Ok(Vec<u8>),
    Err(CallError),
}

/// Deserialized shape of a `FORWARD_LOG` (102) payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub logger_name: String,
    pub level: u8,
    pub message: String,
}

impl LogRecord {
    /// `FORWARD_LOG`'s payload is plain ASCII, not run through
    /// `encode`/`decode` like other system messages: `name\0levelno\0message`
    /// (spec.md §6).
    pub fn to_wire(&self) -> Vec<u8> {
        format!("{}\0{}\0{}", self.logger_name, self.level, self.message).into_bytes()
    }

    pub fn from_wire(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let mut parts = text.splitn(3, '\0');
        let logger_name = parts.next()?.to_string();
        let level: u8 = parts.next()?.parse().ok()?;
        let message = parts.next()?.to_string();
        Some(Self { logger_name, level, message })
    }
}

/// Reply body for a `GET_MODULE` (100) request: `None` means the parent
/// does not have the module at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleReply {
    /// `Some(children)` marks this as a package with the given submodules.
    pub children: Option<Vec<String>>,
    pub source_path: String,
    pub compressed_source: Vec<u8>,
}
