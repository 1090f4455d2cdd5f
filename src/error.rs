use thiserror::Error;

use crate::message::{ContentType, MessageType};

/// Errors produced while executing a workflow.
///
/// Only [`Error::Configuration`], [`Error::AlreadyExecuted`] and [`Error::Io`]
/// are hard failures. The rest either drive a documented recovery path
/// (flight retransmission, trace patching) or terminate the run cleanly with
/// the reason attached to the final state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A record header declared more payload bytes than the datagram holds,
    /// or the header itself was truncated or carried an unknown content type.
    #[error("Malformed record at datagram offset {0}")]
    MalformedRecord(usize),

    /// A fragment disagreed with earlier fragments of the same message
    /// sequence number about the total message length or message type.
    #[error("Conflicting fragment for message_seq {0}")]
    ReassemblyConflict(u16),

    /// No satisfying traffic arrived within the receive wait window.
    #[error("Timed out waiting for peer traffic")]
    Timeout,

    /// The wire tag of a received message does not match the trace entry.
    #[error("Expected {expected} but peer sent {actual}")]
    UnexpectedMessage {
        expected: ContentType,
        actual: ContentType,
    },

    /// The peer sent a fatal-level alert.
    #[error("Peer sent fatal alert (description {0})")]
    FatalAlertReceived(u8),

    /// A flight was retransmitted the configured maximum number of times
    /// without the peer responding.
    #[error("Flight retransmitted {0} times with no response")]
    MaxRetriesExceeded(usize),

    /// The executor was wired up incorrectly. Fatal at construction.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A trace is single-use. Re-executing a finished run is a programming
    /// error.
    #[error("The workflow has already been executed, create a new one")]
    AlreadyExecuted,

    /// No handler registered for a wire tag we needed to prepare or parse.
    #[error("No message handler for content type {0} (first byte {1})")]
    NoHandler(ContentType, u8),

    /// A handler failed to prepare or parse a message body.
    #[error("Message handler failed for {0:?}: {1}")]
    Handler(Option<MessageType>, String),

    /// Transport level failure other than a receive timeout.
    #[error("Transport error: {0}")]
    Io(String),
}

impl Error {
    /// Hard failures roll the trace cursor back one step for diagnostics
    /// before the run aborts. Clean terminations do not.
    pub(crate) fn rolls_back_cursor(&self) -> bool {
        !matches!(
            self,
            Error::FatalAlertReceived(_) | Error::MaxRetriesExceeded(_)
        )
    }
}
