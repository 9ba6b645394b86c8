//! Crate-wide error domain.
//!
//! Every fallible public operation returns [`NestmeshError`]. Module-local
//! detail (a malformed frame header, a poisoned lock) is folded into one
//! of these variants at the boundary rather than leaking its own type,
//! mirroring how the teacher crate confines transport-specific error
//! detail behind one stable top-level error enum.

use std::io;

/// The stable error domain for `nestmesh-core` (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum NestmeshError {
    /// Framing, MAC, or low-level I/O corruption on a [`crate::stream::Stream`].
    /// Fatal to the stream; the caller must treat the stream as disconnected.
    #[error("stream error on context {context_id}: {reason}")]
    Stream { context_id: u32, reason: String },

    /// A channel received the `_DEAD` sentinel; the peer closed its end.
    #[error("channel on handle {handle} closed by peer")]
    ChannelClosed { handle: u32 },

    /// A deadline expired on `send_await` or `Channel::get`.
    #[error("timed out waiting for a reply")]
    Timeout,

    /// The remote side raised an exception while servicing a call.
    #[error("remote call failed: {traceback}")]
    Call { traceback: String },

    /// The parent declined or does not know a requested module.
    #[error("import of `{module}` failed: {reason}")]
    Import { module: String, reason: String },

    /// Calling `send_await` from the broker thread, which would self-deadlock.
    #[error("send_await cannot be called from the broker thread")]
    BrokerThreadSelfAwait,

    /// Serialization/deserialization of a message payload failed.
    #[error("failed to (de)serialize payload: {0}")]
    Codec(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NestmeshError {
    pub fn stream(context_id: u32, reason: impl Into<String>) -> Self {
        NestmeshError::Stream { context_id, reason: reason.into() }
    }

    pub fn import(module: impl Into<String>, reason: impl Into<String>) -> Self {
        NestmeshError::Import { module: module.into(), reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, NestmeshError>;
