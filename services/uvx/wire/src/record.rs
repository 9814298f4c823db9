//! Record decoding.
//!
//! [`LogRecord`] is a bounds-checked view over received bytes. Every offset
//! is validated against the record length before a field is read.

use crate::header::{Level, RecordHeader, LOGE_VERSION};
use crate::WireError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Borrowed view over an encoded record
#[derive(Debug, Clone, Copy)]
pub struct LogRecord<'a> {
    header: RecordHeader,
    extra: &'a [u8],
}

impl<'a> LogRecord<'a> {
    /// Parse and validate a record.
    ///
    /// Records from a newer protocol version are read by offset and
    /// accepted with a warning.
    pub fn parse(buf: &'a [u8]) -> Result<Self, WireError> {
        let header = RecordHeader::decode(buf)?;
        header.validate()?;

        if header.version > LOGE_VERSION {
            warn!(
                "loge record version {} is newer than {}, reading by offset",
                header.version, LOGE_VERSION
            );
        }

        let extra_offset = header.extra_offset as usize;
        if extra_offset > buf.len() {
            return Err(WireError::Offset(extra_offset));
        }
        let record = Self {
            header,
            extra: &buf[extra_offset..],
        };

        record.field(header.name_offset)?;
        record.field(header.tags_offset)?;
        record.field(header.file_offset)?;
        record.message_bytes()?;
        Ok(record)
    }

    /// Decoded header
    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    /// Logging level
    pub fn level(&self) -> Level {
        self.header.level
    }

    /// Emitter name
    pub fn name(&self) -> Result<&'a str, WireError> {
        as_str(self.field(self.header.name_offset)?)
    }

    /// Comma separated tags
    pub fn tags(&self) -> Result<&'a str, WireError> {
        as_str(self.field(self.header.tags_offset)?)
    }

    /// Shortened source file path
    pub fn file(&self) -> Result<&'a str, WireError> {
        as_str(self.field(self.header.file_offset)?)
    }

    /// Message as text
    pub fn message(&self) -> Result<&'a str, WireError> {
        as_str(self.message_bytes()?)
    }

    /// Message bytes without the terminator.
    ///
    /// Uses `msg_len` when the header carries it, so binary messages with
    /// embedded NULs come back whole.
    pub fn message_bytes(&self) -> Result<&'a [u8], WireError> {
        let offset = self.header.msg_offset as usize;
        match self.header.msg_len {
            Some(len) => {
                let len = len as usize;
                // message plus its terminator must lie inside the record
                if offset + len >= self.extra.len() {
                    return Err(WireError::Offset(offset + len));
                }
                if self.extra[offset + len] != 0 {
                    return Err(WireError::Unterminated(offset));
                }
                Ok(&self.extra[offset..offset + len])
            }
            None => {
                // base-header records end with the message terminator
                let message = self.field(self.header.msg_offset)?;
                if offset + message.len() + 1 != self.extra.len() {
                    return Err(WireError::Unterminated(offset));
                }
                Ok(message)
            }
        }
    }

    /// Copy the record into an owned [`LogItem`]
    pub fn to_item(&self) -> Result<LogItem, WireError> {
        Ok(LogItem {
            version: self.header.version,
            level: self.header.level,
            time: self.header.time,
            pid: self.header.pid,
            tid: self.header.tid,
            line: self.header.line,
            name: self.name()?.to_string(),
            tags: self.tags()?.to_string(),
            file: self.file()?.to_string(),
            message: String::from_utf8_lossy(self.message_bytes()?).into_owned(),
        })
    }

    fn field(&self, offset: u8) -> Result<&'a [u8], WireError> {
        let offset = offset as usize;
        if offset >= self.extra.len() {
            return Err(WireError::Offset(offset));
        }
        let tail = &self.extra[offset..];
        let nul = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::Unterminated(offset))?;
        Ok(&tail[..nul])
    }
}

fn as_str(bytes: &[u8]) -> Result<&str, WireError> {
    std::str::from_utf8(bytes).map_err(|_| WireError::Utf8)
}

/// Owned copy of a decoded record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogItem {
    /// Protocol version
    pub version: u8,
    /// Logging level
    pub level: Level,
    /// Unix timestamp in seconds
    pub time: i32,
    /// Emitter process id
    pub pid: i32,
    /// Emitter thread id
    pub tid: i32,
    /// Source line
    pub line: i32,
    /// Emitter name
    pub name: String,
    /// Comma separated tags
    pub tags: String,
    /// Shortened source file
    pub file: String,
    /// Message (binary messages are converted lossily)
    pub message: String,
}
