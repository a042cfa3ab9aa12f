//! Errors surfaced by the peer layer.
//!
//! Connection-level failures are logged where they are observed and end the task that saw them. They never travel to
//! another task as a value: a writer learns about a dead read side through [crate::outbox::Outgoing::Closed], and a
//! reader learns about a dead writer through the connection's cancellation token.
//!
//! An envelope that cannot be framed only costs that envelope. See [Error::is_envelope_error].
use thiserror::Error;

use crate::api::Command;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The underlying transport failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A body could not be serialized.
    #[error("failed to encode {command:?} body: {source}")]
    Encode {
        command: Command,
        #[source]
        source: postcard::Error,
    },

    /// A frame carried a known command whose body did not deserialize.
    #[error("failed to decode {command:?} body: {source}")]
    Decode {
        command: Command,
        #[source]
        source: postcard::Error,
    },

    /// An encoded envelope larger than [crate::codec::MAX_FRAME_SIZE].
    #[error("frame of {len} bytes exceeds the frame size limit")]
    FrameTooLarge { len: usize },

    /// A frame too short to hold the command and sequence header.
    #[error("truncated frame of {len} bytes")]
    Truncated { len: usize },

    /// A peer address that is not `host:port`.
    #[error("invalid peer address: {0}")]
    InvalidPeerAddr(String),
}

impl Error {
    /// Whether the failure belongs to a single outgoing envelope rather than the connection. Writers drop such an
    /// envelope and carry on.
    pub fn is_envelope_error(&self) -> bool {
        matches!(self, Error::Encode { .. } | Error::FrameTooLarge { .. })
    }
}
