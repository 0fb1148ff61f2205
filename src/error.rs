//! Error types for owlmon.
//!
//! Decoding never fails from the caller's point of view: the lenient
//! decoders fold every [`DecodeError`] into an empty record. The `try_`
//! variants expose the error so callers can tell "no fragment" apart from
//! "fragment without the requested data" and "fragment with bad numbers".

use std::time::Duration;

/// Why a fragment produced no record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The fragment was missing or empty.
    #[error("no fragment to decode")]
    Absent,

    /// The fragment does not follow the message grammar far enough to
    /// capture every field. `expected` names the first element not found.
    #[error("fragment does not match: expected {expected}")]
    NoMatch {
        /// Grammar element that was missing (e.g. `"rssi='-N'"`).
        expected: &'static str,
    },

    /// The fragment could not be used as text at all, or a captured numeral
    /// does not fit the field it belongs to.
    #[error("malformed fragment: {reason}")]
    Malformed {
        /// Human-readable cause.
        reason: String,
    },
}

impl DecodeError {
    pub(crate) fn no_match(expected: &'static str) -> Self {
        Self::NoMatch { expected }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Errors raised by the multicast listener.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// `recv_datagram` was called before `initialise_socket` (or after
    /// `destroy_socket`).
    #[error("socket not initialised")]
    NotInitialised,

    /// No datagram arrived within the receive timeout.
    #[error("no datagram within {0:?}")]
    Timeout(Duration),

    /// An underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias for listener operations.
pub type Result<T> = std::result::Result<T, ClientError>;
