//! Large-object stream codec
//!
//! A commit may carry binary (blob) and character (clob) large objects as one
//! stream appended after the revisions:
//!
//! ```text
//! count: i32
//! count × {
//!     id_len: i32, id: [u8; id_len],
//!     size:   i64,
//!     payload: size bytes           if size > 0
//!              -size UTF-16 units   if size < 0 (2 bytes each)
//! }
//! ```
//!
//! All integers are big-endian. A size of 0, a negative count or id length
//! and a payload shorter than announced are protocol violations.

use crate::error::{Result, RevStoreError};
use std::fmt;
use std::io::{self, Read, Write};
use tracing::trace;

/// Identifier of a large object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct LobId(pub Vec<u8>);

impl LobId {
    /// Raw id bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for LobId {
    fn from(bytes: &[u8]) -> Self {
        LobId(bytes.to_vec())
    }
}

impl fmt::Display for LobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Reader that yields exactly `remaining` bytes of the underlying stream
///
/// Running out of input before that is recorded as truncation.
pub struct LimitedReader<'a> {
    inner: &'a mut dyn Read,
    remaining: u64,
    truncated: bool,
}

impl<'a> LimitedReader<'a> {
    /// Limit `inner` to `limit` bytes
    pub fn new(inner: &'a mut dyn Read, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
            truncated: false,
        }
    }

    /// Bytes not consumed yet
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Whether the underlying stream ended early
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Skip whatever the consumer left unread
    pub fn drain(&mut self) -> Result<()> {
        io::copy(self, &mut io::sink()).map_err(|err| self.protocol_or_io(err))?;
        Ok(())
    }

    fn protocol_or_io(&self, err: io::Error) -> RevStoreError {
        if self.truncated {
            RevStoreError::protocol(format!("large object truncated, {} bytes missing", self.remaining))
        } else {
            RevStoreError::Io(err)
        }
    }
}

impl Read for LimitedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            self.truncated = true;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Character payload of a clob entry as UTF-16 code units
pub struct ClobReader<'a> {
    bytes: LimitedReader<'a>,
}

impl<'a> ClobReader<'a> {
    fn new(bytes: LimitedReader<'a>) -> Self {
        Self { bytes }
    }

    /// Characters not consumed yet
    pub fn remaining(&self) -> u64 {
        self.bytes.remaining() / 2
    }

    /// Whether the underlying stream ended early
    pub fn is_truncated(&self) -> bool {
        self.bytes.is_truncated()
    }

    /// Next UTF-16 code unit, `None` at the end of the payload
    pub fn read_unit(&mut self) -> Result<Option<u16>> {
        if self.bytes.remaining() == 0 {
            return Ok(None);
        }
        let mut pair = [0u8; 2];
        self.bytes
            .read_exact(&mut pair)
            .map_err(|err| self.bytes.protocol_or_io(err))?;
        Ok(Some(u16::from_be_bytes(pair)))
    }

    /// Fill `units` from the payload, returning how many were read
    pub fn read_units(&mut self, units: &mut [u16]) -> Result<usize> {
        let mut read = 0;
        while read < units.len() {
            match self.read_unit()? {
                Some(unit) => {
                    units[read] = unit;
                    read += 1;
                }
                None => break,
            }
        }
        Ok(read)
    }

    /// Read the rest of the payload as a string
    pub fn read_to_string(&mut self) -> Result<String> {
        let mut units = Vec::with_capacity(usize::try_from(self.remaining()).unwrap_or(0).min(1 << 20));
        while let Some(unit) = self.read_unit()? {
            units.push(unit);
        }
        String::from_utf16(&units).map_err(|err| RevStoreError::protocol(format!("invalid character data: {}", err)))
    }

    fn drain(&mut self) -> Result<()> {
        self.bytes.drain()
    }
}

/// Payload reader of one entry
pub enum LobPayload<'a> {
    /// Binary payload of `size` bytes
    Blob(LimitedReader<'a>),
    /// Character payload of `-size` characters
    Clob(ClobReader<'a>),
}

/// One large-object entry being read
pub struct LobEntry<'a> {
    /// Object id
    pub id: LobId,
    /// Signed size as found on the wire
    pub size: i64,
    /// Payload reader
    pub payload: LobPayload<'a>,
}

impl LobEntry<'_> {
    /// Whether the entry is a binary blob
    pub fn is_blob(&self) -> bool {
        matches!(self.payload, LobPayload::Blob(_))
    }

    /// Byte count of a blob or character count of a clob
    pub fn length(&self) -> u64 {
        self.size.unsigned_abs()
    }

    /// Whether the payload ended before its announced size
    pub fn is_truncated(&self) -> bool {
        match &self.payload {
            LobPayload::Blob(reader) => reader.is_truncated(),
            LobPayload::Clob(reader) => reader.is_truncated(),
        }
    }

    /// Consume what the reader of the payload left unread
    ///
    /// Must be called before the next entry is requested.
    pub fn finish(mut self) -> Result<()> {
        match &mut self.payload {
            LobPayload::Blob(reader) => reader.drain(),
            LobPayload::Clob(reader) => reader.drain(),
        }
    }
}

/// Reads a large-object stream entry by entry
pub struct LobStreamReader<'a> {
    inner: &'a mut dyn Read,
    count: u32,
    read: u32,
}

impl<'a> LobStreamReader<'a> {
    /// Read the entry count
    pub fn new(inner: &'a mut dyn Read) -> Result<Self> {
        let count = read_i32(inner, "entry count")?;
        let count = u32::try_from(count).map_err(|_| RevStoreError::protocol(format!("negative entry count {}", count)))?;
        Ok(Self { inner, count, read: 0 })
    }

    /// Number of entries announced by the stream
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Entries not read yet
    pub fn remaining(&self) -> u32 {
        self.count - self.read
    }

    /// Read the next entry header; the payload follows through the entry
    pub fn next_entry(&mut self) -> Result<Option<LobEntry<'_>>> {
        if self.read == self.count {
            return Ok(None);
        }
        self.read += 1;

        let id_len = read_i32(self.inner, "id length")?;
        let id_len = u64::try_from(id_len).map_err(|_| RevStoreError::protocol(format!("negative id length {}", id_len)))?;
        let mut id = Vec::new();
        let got = Read::take(&mut *self.inner, id_len).read_to_end(&mut id)?;
        if (got as u64) < id_len {
            return Err(RevStoreError::protocol(format!("id truncated, {} of {} bytes", got, id_len)));
        }
        let id = LobId(id);

        let size = read_i64(self.inner, "size")?;
        let payload = match size {
            0 => return Err(RevStoreError::protocol(format!("large object {} has size 0", id))),
            size if size > 0 => LobPayload::Blob(LimitedReader::new(self.inner, size as u64)),
            size => {
                let bytes = size
                    .unsigned_abs()
                    .checked_mul(2)
                    .ok_or_else(|| RevStoreError::protocol(format!("character size {} out of range", size)))?;
                LobPayload::Clob(ClobReader::new(LimitedReader::new(self.inner, bytes)))
            }
        };

        trace!("Large object {} size {}", id, size);
        Ok(Some(LobEntry { id, size, payload }))
    }
}

fn read_exact_or_protocol(inner: &mut dyn Read, buf: &mut [u8], what: &str) -> Result<()> {
    inner.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => RevStoreError::protocol(format!("stream ended while reading {}", what)),
        _ => RevStoreError::Io(err),
    })
}

fn read_i32(inner: &mut dyn Read, what: &str) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact_or_protocol(inner, &mut buf, what)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_i64(inner: &mut dyn Read, what: &str) -> Result<i64> {
    let mut buf = [0u8; 8];
    read_exact_or_protocol(inner, &mut buf, what)?;
    Ok(i64::from_be_bytes(buf))
}

/// Writes a large-object stream
pub struct LobStreamWriter<W: Write> {
    inner: W,
    count: u32,
    written: u32,
}

impl<W: Write> LobStreamWriter<W> {
    /// Start a stream announcing `count` entries
    pub fn new(mut inner: W, count: u32) -> Result<Self> {
        let announced = i32::try_from(count).map_err(|_| RevStoreError::protocol("too many large objects"))?;
        inner.write_all(&announced.to_be_bytes())?;
        Ok(Self { inner, count, written: 0 })
    }

    fn header(&mut self, id: &LobId, size: i64) -> Result<()> {
        if self.written == self.count {
            return Err(RevStoreError::protocol(format!("more than {} entries written", self.count)));
        }
        let id_len = i32::try_from(id.0.len()).map_err(|_| RevStoreError::protocol("id too long"))?;
        self.inner.write_all(&id_len.to_be_bytes())?;
        self.inner.write_all(&id.0)?;
        self.inner.write_all(&size.to_be_bytes())?;
        self.written += 1;
        Ok(())
    }

    /// Append a binary entry; `data` must not be empty
    pub fn write_blob(&mut self, id: &LobId, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(RevStoreError::protocol(format!("blob {} is empty", id)));
        }
        let size = i64::try_from(data.len()).map_err(|_| RevStoreError::protocol("blob too large"))?;
        self.header(id, size)?;
        self.inner.write_all(data)?;
        Ok(())
    }

    /// Append a character entry; `text` must not be empty
    pub fn write_clob(&mut self, id: &LobId, text: &str) -> Result<()> {
        let units: Vec<u16> = text.encode_utf16().collect();
        if units.is_empty() {
            return Err(RevStoreError::protocol(format!("clob {} is empty", id)));
        }
        let size = i64::try_from(units.len()).map_err(|_| RevStoreError::protocol("clob too large"))?;
        self.header(id, -size)?;
        for unit in units {
            self.inner.write_all(&unit.to_be_bytes())?;
        }
        Ok(())
    }

    /// Check that every announced entry was written and return the sink
    pub fn finish(mut self) -> Result<W> {
        if self.written != self.count {
            return Err(RevStoreError::protocol(format!(
                "{} entries announced, {} written",
                self.count, self.written
            )));
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}
