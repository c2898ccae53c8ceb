//! Crate-wide error type.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can end a transfer early.
///
/// Every block attempt is a recovery boundary: the engine counts and retries
/// recoverable kinds until its budget is exhausted, then returns one of these.
#[derive(Debug, Error)]
pub enum Error {
    /// Propagated I/O failure from the underlying stream or local file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No byte arrived before the configured deadline. Recoverable; counted
    /// against the engine's retry budget.
    #[error("timed out waiting for a byte")]
    Timeout,

    /// The wrapped stream reported end-of-stream mid-transfer. Always fatal.
    #[error("unexpected end of stream")]
    EndOfStream,

    /// 8-bit sum or CRC-16 mismatch on a received block.
    #[error("checksum/CRC mismatch on block {seq}")]
    IntegrityFailure {
        /// Sequence number of the offending block.
        seq: u8,
    },

    /// A block's sequence number was neither the expected one nor a
    /// retransmit of the previous block.
    #[error("block out of order: expected {expected}, got {got}")]
    SequenceOutOfOrder {
        /// Sequence number the engine was expecting.
        expected: u8,
        /// Sequence number actually received.
        got: u8,
    },

    /// A framing byte (or block-0 field) didn't match any legal value for
    /// the negotiated flavor.
    #[error("unexpected byte 0x{byte:02x} in frame")]
    UnexpectedFrame {
        /// The offending byte.
        byte: u8,
    },

    /// `max_errors` (or `max_initial_errors`) consecutive recoverable errors
    /// occurred for the same operation.
    #[error("exhausted retry budget ({0} consecutive errors)")]
    RetryBudgetExhausted(u32),

    /// Two consecutive CAN bytes arrived from the peer.
    #[error("transfer cancelled by peer (CAN CAN)")]
    CancelledByPeer,

    /// `cancel_transfer` was invoked locally.
    #[error("transfer cancelled locally")]
    CancelledLocally,

    /// The local target file could not be opened.
    #[error("failed to open local file: {0}")]
    FileOpenFailure(String),

    /// A write to the local target file failed.
    #[error("failed to write local file: {0}")]
    FileWriteFailure(String),

    /// Receiver refused to clobber an existing file (`overwrite == false`).
    #[error("{0} already exists, will not overwrite")]
    OverwriteRefused(String),

    /// A YMODEM block-0 payload didn't parse as `name NUL size (SP mtime)? NUL...`.
    #[error("block 0 parse failure: {0}")]
    Block0ParseFailure(String),

    /// Block-0's size field was absent, empty, or not a valid decimal number.
    #[error("invalid file size")]
    MissingFileSize,
}

impl Error {
    /// Whether this error should be retried at the current boundary rather
    /// than promoted straight to an abort. `_G` flavors bypass this and
    /// treat every one of these as fatal on first occurrence (spec 4.5/7).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout
                | Error::IntegrityFailure { .. }
                | Error::SequenceOutOfOrder { .. }
                | Error::UnexpectedFrame { .. }
        )
    }
}
