//! Record encoding.
//!
//! This module provides the emitter identity and the encoder that writes a
//! header plus its extra block into a caller-supplied buffer. The encoder
//! never allocates.

use crate::header::{Level, RecordHeader, HEADER_SIZE, MAX_RECORD_SIZE, PREFIX_LIMIT};
use crate::WireError;
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Maximum emitter name length in bytes (its terminator excluded)
pub const MAX_NAME_LEN: usize = 15;

/// Default emitter name
pub const DEFAULT_EMITTER_NAME: &str = "loge";

/// Message body of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    /// UTF-8 text; truncated at a code-point boundary when it does not fit
    Text(&'a str),
    /// Raw bytes; the record is rejected when they do not fit
    Binary(&'a [u8]),
}

/// Named, enable-able identity that originates records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emitter {
    name: String,
    enabled: bool,
    pid: i32,
}

impl Emitter {
    /// Create an enabled emitter for the current process
    pub fn new(name: &str) -> Result<Self, WireError> {
        check_name(name)?;
        Ok(Self {
            name: name.to_string(),
            enabled: true,
            pid: std::process::id() as i32,
        })
    }

    /// Emitter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the emitter
    pub fn set_name(&mut self, name: &str) -> Result<(), WireError> {
        check_name(name)?;
        self.name = name.to_string();
        Ok(())
    }

    /// Whether records are produced
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Turn record production on or off
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Process id stamped into every record
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Encode a text record. See [`Emitter::encode`].
    pub fn encode_text(
        &self,
        buf: &mut [u8],
        level: Level,
        tags: &str,
        msg: &str,
        file: &str,
        line: u32,
    ) -> Result<usize, WireError> {
        self.encode(buf, level, tags, Payload::Text(msg), file, line)
    }

    /// Encode a binary record. See [`Emitter::encode`].
    pub fn encode_binary(
        &self,
        buf: &mut [u8],
        level: Level,
        tags: &str,
        msg: &[u8],
        file: &str,
        line: u32,
    ) -> Result<usize, WireError> {
        self.encode(buf, level, tags, Payload::Binary(msg), file, line)
    }

    /// Encode a record stamped with the current time and calling thread.
    ///
    /// Returns the number of bytes written. `Ok(0)` means no record was
    /// produced: the emitter is disabled, or a binary payload did not fit.
    pub fn encode(
        &self,
        buf: &mut [u8],
        level: Level,
        tags: &str,
        msg: Payload<'_>,
        file: &str,
        line: u32,
    ) -> Result<usize, WireError> {
        if !self.enabled {
            return Ok(0);
        }
        let header = RecordHeader::new(
            level,
            chrono::Utc::now().timestamp() as i32,
            self.pid,
            current_thread_id(),
            line as i32,
        );
        encode_record(buf, header, &self.name, tags, msg, file)
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self {
            name: DEFAULT_EMITTER_NAME.to_string(),
            enabled: true,
            pid: std::process::id() as i32,
        }
    }
}

fn check_name(name: &str) -> Result<(), WireError> {
    if name.len() > MAX_NAME_LEN || name.as_bytes().contains(&0) {
        return Err(WireError::NameTooLong(name.len()));
    }
    Ok(())
}

/// Smallest capacity that can hold a record for an emitter name of `name_len` bytes
pub fn min_record_size(name_len: usize) -> usize {
    // name + NUL, then a NUL each for tags, file and message
    HEADER_SIZE + name_len + 1 + 3
}

/// Write a complete record into `buf` using the given header fields.
///
/// Offsets, `msg_len` and `extra_offset` are filled in here; the rest of
/// `header` is written as given.
pub fn encode_record(
    buf: &mut [u8],
    mut header: RecordHeader,
    name: &str,
    tags: &str,
    msg: Payload<'_>,
    file: &str,
) -> Result<usize, WireError> {
    let capacity = buf.len().min(MAX_RECORD_SIZE);
    let needed = min_record_size(name.len());
    if capacity < needed {
        return Err(WireError::BufferTooSmall {
            needed,
            available: capacity,
        });
    }

    let mut extra = ExtraWriter::new(&mut buf[HEADER_SIZE..capacity]);
    let end = extra.len();

    // The first three fields share PREFIX_LIMIT bytes so that msg_offset
    // still fits in a u8. Each field leaves room for the terminators of
    // the fields after it.
    header.name_offset = extra.write_str(name, (PREFIX_LIMIT - 3).min(end - 4)) as u8;
    header.tags_offset = extra.write_str(tags, (PREFIX_LIMIT - 2).min(end - 3)) as u8;
    header.file_offset =
        extra.write_str(shorten_path(file), (PREFIX_LIMIT - 1).min(end - 2)) as u8;

    let msg_offset = extra.position();
    header.msg_offset = msg_offset as u8;
    match msg {
        Payload::Text(text) => {
            extra.write_str(text, end - 1);
        }
        Payload::Binary(data) => {
            if extra.write_bin(data, end).is_none() {
                debug!(
                    "binary payload of {} bytes does not fit in {} bytes, record dropped",
                    data.len(),
                    end - msg_offset
                );
                return Ok(0);
            }
        }
    }

    let written = extra.position();
    header.msg_len = Some((written - msg_offset - 1) as u16);
    header.extra_offset = HEADER_SIZE as u8;
    header.flags = 0;
    header.encode(buf)?;

    Ok(HEADER_SIZE + written)
}

/// Cursor over the extra block that tracks remaining capacity
struct ExtraWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ExtraWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    /// Write `text` plus a NUL so that the terminator lands no later than
    /// index `last`. Returns the field offset.
    ///
    /// Callers reserve space so that `last >= position()`: the terminator
    /// always fits.
    fn write_str(&mut self, text: &str, last: usize) -> usize {
        let start = self.pos;
        debug_assert!(start <= last && last < self.buf.len());
        let bytes = c_str_prefix(text.as_bytes());
        let room = last + 1 - start;

        let n = if bytes.len() < room {
            bytes.len()
        } else {
            utf8_floor(bytes, room - 1)
        };

        self.buf[start..start + n].copy_from_slice(&bytes[..n]);
        self.buf[start + n] = 0;
        self.pos = start + n + 1;
        start
    }

    /// Write `data` plus a NUL ending before `end`. Returns `None` and
    /// writes nothing when the data would have to be truncated.
    fn write_bin(&mut self, data: &[u8], end: usize) -> Option<usize> {
        let start = self.pos;
        let end = end.min(self.buf.len());
        if data.len() + 1 > end - start {
            return None;
        }

        self.buf[start..start + data.len()].copy_from_slice(data);
        self.buf[start + data.len()] = 0;
        self.pos = start + data.len() + 1;
        Some(start)
    }
}

/// Bytes up to (not including) the first NUL
fn c_str_prefix(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(nul) => &bytes[..nul],
        None => bytes,
    }
}

/// Largest prefix length `<= max` that ends on a UTF-8 character boundary.
///
/// Walks back from `max` to the nearest leading byte (`0xxxxxxx`,
/// `110xxxxx`, `1110xxxx` or `11110xxx`); the character starting there is
/// cut off whole.
fn utf8_floor(bytes: &[u8], max: usize) -> usize {
    if max >= bytes.len() {
        return bytes.len();
    }
    let mut i = max;
    while i > 0 && !is_utf8_leading(bytes[i]) {
        i -= 1;
    }
    i
}

fn is_utf8_leading(b: u8) -> bool {
    b >> 7 == 0 || b >> 5 == 0b110 || b >> 4 == 0b1110 || b >> 3 == 0b11110
}

/// Keep at most the last two directories and the file name of a path.
///
/// Both `/` and `\` separate components. `"/a/b/c/d/file.c"` becomes
/// `"c/d/file.c"`; shorter paths lose only their leading separators.
pub fn shorten_path(path: &str) -> &str {
    let bytes = path.as_bytes();
    let mut seen = 0;
    for (i, &b) in bytes.iter().enumerate().rev() {
        if b == b'/' || b == b'\\' {
            seen += 1;
            if seen == 3 {
                return &path[i + 1..];
            }
        }
    }
    path.trim_start_matches(['/', '\\'])
}

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_ID: Cell<i32> = const { Cell::new(0) };
}

/// Numeric id of the calling OS thread, stable for the thread's lifetime
pub fn current_thread_id() -> i32 {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed) as i32);
        }
        id.get()
    })
}
