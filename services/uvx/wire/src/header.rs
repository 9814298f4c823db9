//! Fixed record header for the loge wire format.
//!
//! The header is 24 bytes in its base form and 28 bytes with the extended
//! fields (`msg_len`, `extra_offset`, `flags`). Multi-byte fields are
//! little-endian. Readers locate the extra block through `extra_offset`, so
//! later versions can grow the header without breaking older readers.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Loge protocol version written by this crate
pub const LOGE_VERSION: u8 = 1;

/// First magic byte
pub const LOGE_MAGIC1: u8 = 0x4c;

/// Second magic byte
pub const LOGE_MAGIC2: u8 = 0xaf;

/// Size of the base header in bytes
pub const BASE_HEADER_SIZE: usize = 24;

/// Size of the header including the extended fields
pub const HEADER_SIZE: usize = 28;

/// Default ceiling for a whole encoded record
pub const MAX_RECORD_SIZE: usize = 1024;

/// Ceiling that keeps a record inside one unfragmented datagram on typical networks
pub const SAFE_RECORD_SIZE: usize = 528;

/// Name, tags and file (with their terminators) must fit below this offset
pub const PREFIX_LIMIT: usize = 255;

/// Signed logging level carried in every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Level(pub i8);

impl Level {
    /// Lowest possible level
    pub const ALL: Level = Level(-128);
    /// Trace level
    pub const TRACE: Level = Level(-60);
    /// Debug level
    pub const DEBUG: Level = Level(-30);
    /// Info level
    pub const INFO: Level = Level(0);
    /// Warning level
    pub const WARN: Level = Level(30);
    /// Error level
    pub const ERROR: Level = Level(60);
    /// Fatal level
    pub const FATAL: Level = Level(90);
    /// Highest possible level
    pub const NONE: Level = Level(127);

    /// Name of the nearest predefined level at or below this one
    pub fn label(self) -> &'static str {
        match self.0 {
            i8::MIN..=-61 => "ALL",
            -60..=-31 => "TRACE",
            -30..=-1 => "DEBUG",
            0..=29 => "INFO",
            30..=59 => "WARN",
            60..=89 => "ERROR",
            90..=126 => "FATAL",
            127 => "NONE",
        }
    }
}

impl From<i8> for Level {
    fn from(value: i8) -> Self {
        Level(value)
    }
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Level::TRACE,
            tracing::Level::DEBUG => Level::DEBUG,
            tracing::Level::INFO => Level::INFO,
            tracing::Level::WARN => Level::WARN,
            tracing::Level::ERROR => Level::ERROR,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.label(), self.0)
    }
}

/// Decoded or to-be-encoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Protocol version
    pub version: u8,
    /// Logging level
    pub level: Level,
    /// Unix timestamp in seconds
    pub time: i32,
    /// Process id of the emitter
    pub pid: i32,
    /// Thread id of the caller
    pub tid: i32,
    /// Source line number
    pub line: i32,
    /// Offset of the emitter name inside the extra block
    pub name_offset: u8,
    /// Offset of the tags inside the extra block
    pub tags_offset: u8,
    /// Offset of the shortened file path inside the extra block
    pub file_offset: u8,
    /// Offset of the message inside the extra block
    pub msg_offset: u8,
    /// Message length excluding its terminator (extended header only)
    pub msg_len: Option<u16>,
    /// Offset of the extra block from the start of the record
    pub extra_offset: u8,
    /// Reserved flags (must be zero)
    pub flags: u8,
}

impl RecordHeader {
    /// Create a header for the current protocol version with zeroed offsets
    pub fn new(level: Level, time: i32, pid: i32, tid: i32, line: i32) -> Self {
        Self {
            version: LOGE_VERSION,
            level,
            time,
            pid,
            tid,
            line,
            name_offset: 0,
            tags_offset: 0,
            file_offset: 0,
            msg_offset: 0,
            msg_len: Some(0),
            extra_offset: HEADER_SIZE as u8,
            flags: 0,
        }
    }

    /// Encode the extended header into the first `HEADER_SIZE` bytes of `buf`
    pub fn encode(&self, mut buf: &mut [u8]) -> Result<(), crate::WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(crate::WireError::BufferTooSmall {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }

        buf.put_u8(self.version);
        buf.put_u8(LOGE_MAGIC1);
        buf.put_u8(LOGE_MAGIC2);
        buf.put_i8(self.level.0);
        buf.put_i32_le(self.time);
        buf.put_i32_le(self.pid);
        buf.put_i32_le(self.tid);
        buf.put_i32_le(self.line);
        buf.put_u8(self.name_offset);
        buf.put_u8(self.tags_offset);
        buf.put_u8(self.file_offset);
        buf.put_u8(self.msg_offset);
        buf.put_u16_le(self.msg_len.unwrap_or(0));
        buf.put_u8(self.extra_offset);
        buf.put_u8(self.flags);
        Ok(())
    }

    /// Decode the header of the record in `record`.
    ///
    /// The extended fields are used only when they describe the record
    /// consistently: the extra block starts at or after the base header and
    /// inside the record, reserved flags are clear for known versions, and
    /// `msg_len` lands on the message terminator. Otherwise the record is read
    /// as base-header only: `msg_len == None` and the extra block starts right
    /// after the 24 base bytes.
    pub fn decode(record: &[u8]) -> Result<Self, crate::WireError> {
        if record.len() < BASE_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }
        let mut buf = record;

        let version = buf.get_u8();
        let magic1 = buf.get_u8();
        let magic2 = buf.get_u8();
        if magic1 != LOGE_MAGIC1 || magic2 != LOGE_MAGIC2 {
            return Err(crate::WireError::Magic(magic1, magic2));
        }
        if version == 0 {
            return Err(crate::WireError::Version(version));
        }

        let level = Level(buf.get_i8());
        let time = buf.get_i32_le();
        let pid = buf.get_i32_le();
        let tid = buf.get_i32_le();
        let line = buf.get_i32_le();
        let name_offset = buf.get_u8();
        let tags_offset = buf.get_u8();
        let file_offset = buf.get_u8();
        let msg_offset = buf.get_u8();

        let extended = if buf.remaining() >= HEADER_SIZE - BASE_HEADER_SIZE {
            let fields = (buf.get_u16_le(), buf.get_u8(), buf.get_u8());
            Some(fields).filter(|&(msg_len, extra_offset, flags)| {
                extended_layout_fits(record, version, msg_offset, msg_len, extra_offset, flags)
            })
        } else {
            None
        };
        let (msg_len, extra_offset, flags) = match extended {
            Some((msg_len, extra_offset, flags)) => (Some(msg_len), extra_offset, flags),
            None => (None, BASE_HEADER_SIZE as u8, 0),
        };

        Ok(Self {
            version,
            level,
            time,
            pid,
            tid,
            line,
            name_offset,
            tags_offset,
            file_offset,
            msg_offset,
            msg_len,
            extra_offset,
            flags,
        })
    }

    /// Validate fields that do not depend on the extra block
    pub fn validate(&self) -> Result<(), crate::WireError> {
        if self.version == 0 {
            return Err(crate::WireError::Version(self.version));
        }

        if (self.extra_offset as usize) < BASE_HEADER_SIZE {
            return Err(crate::WireError::Offset(self.extra_offset as usize));
        }

        // Newer versions may assign meaning to these bits.
        if self.version <= LOGE_VERSION && self.flags != 0 {
            return Err(crate::WireError::Reserved);
        }

        Ok(())
    }
}

/// Whether the extended header fields describe `record` consistently
fn extended_layout_fits(
    record: &[u8],
    version: u8,
    msg_offset: u8,
    msg_len: u16,
    extra_offset: u8,
    flags: u8,
) -> bool {
    let extra_offset = extra_offset as usize;
    if extra_offset < BASE_HEADER_SIZE || extra_offset > record.len() {
        return false;
    }
    if version <= LOGE_VERSION && flags != 0 {
        return false;
    }
    let terminator = extra_offset + msg_offset as usize + msg_len as usize;
    record.get(terminator) == Some(&0)
}
