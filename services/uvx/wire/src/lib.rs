//! Loge record encoding and decoding for uvx.
//!
//! A loge record is a small binary log message meant to travel in a single
//! UDP datagram. It is a fixed header followed by an extra block of
//! NUL-terminated fields.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | base header (24B)    | version, magic, level,     |
//! |                      | time, pid, tid, line,      |
//! |                      | four field offsets         |
//! +----------------------+----------------------------+
//! | extended (4B)        | msg_len, extra_offset,     |
//! |                      | reserved flags             |
//! +----------------------+----------------------------+
//! | extra block          | name\0 tags\0 file\0 msg\0 |
//! +----------------------+----------------------------+
//! ```
//!
//! Field offsets are relative to the extra block. The name, tags and file
//! (with terminators) always fit in the first 255 bytes of the block.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod header;
pub mod record;

// Re-export main types
pub use codec::{
    current_thread_id, encode_record, min_record_size, shorten_path, Emitter, Payload,
    DEFAULT_EMITTER_NAME, MAX_NAME_LEN,
};
pub use error::WireError;
pub use header::{
    Level, RecordHeader, BASE_HEADER_SIZE, HEADER_SIZE, LOGE_MAGIC1, LOGE_MAGIC2, LOGE_VERSION,
    MAX_RECORD_SIZE, PREFIX_LIMIT, SAFE_RECORD_SIZE,
};
pub use record::{LogItem, LogRecord};
