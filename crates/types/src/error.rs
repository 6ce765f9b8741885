//! Typed errors at this crate's public boundary.
use thiserror::Error;

/// Failure while decoding a wire message or persisted record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of buffer, needed {needed} more byte(s)")]
    Eof { needed: usize },
    #[error("var_int value {0} does not fit a usize on this platform")]
    VarIntOverflow(u64),
    #[error("string of length {0} exceeds the maximum allowed")]
    StringTooLong(usize),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("trailing {0} byte(s) after decoding a complete message")]
    TrailingBytes(usize),
    #[error("declared message length {0} exceeds the maximum allowed")]
    MessageTooLarge(u32),
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
}
