//! Wire protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding log records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Destination buffer cannot hold the header plus the mandatory terminators
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Minimum number of bytes required
        needed: usize,
        /// Effective capacity that was offered
        available: usize,
    },

    /// Emitter name exceeds its byte budget
    #[error("emitter name too long: {0} bytes")]
    NameTooLong(usize),

    /// Record shorter than the fixed header
    #[error("incomplete record")]
    Incomplete,

    /// Magic bytes do not identify a loge record
    #[error("bad magic: {0:#04x} {1:#04x}")]
    Magic(u8, u8),

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// A header offset points outside the record
    #[error("offset out of bounds: {0}")]
    Offset(usize),

    /// A field has no NUL terminator inside the record
    #[error("unterminated field at offset {0}")]
    Unterminated(usize),

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// A text field is not valid UTF-8
    #[error("field is not valid utf-8")]
    Utf8,
}
