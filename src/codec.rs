//! Binary request encoding and bounds-checked response decoding.
//!
//! ADS system service calls exchange flat little-endian byte buffers. This
//! module provides the two halves used by every higher-level operation:
//!
//! - [`RequestWriter`] appends typed fields to a request buffer in order.
//! - [`ReadCursor`] extracts typed fields from a response buffer, advancing by
//!   the decoded width and failing with [`AdsError::Decode`] instead of reading
//!   past the end.
//!
//! # String conventions
//!
//! | Operation | Encoding |
//! |-----------|----------|
//! | [`RequestWriter::string`] | UTF-8 bytes followed by one `0x00` |
//! | [`RequestWriter::ascii_string`] | ASCII bytes (non-ASCII as `?`) followed by one `0x00` |
//! | [`RequestWriter::prefixed_string`] | `len + 1` as one byte, UTF-8 bytes, `0x00` |
//!
//! # Example
//!
//! ```
//! use ads_utilities::{ReadCursor, RequestWriter};
//!
//! let mut writer = RequestWriter::new();
//! writer.u32(7).prefixed_string("PLC1")?;
//! let bytes = writer.into_bytes();
//! assert_eq!(bytes, [7, 0, 0, 0, 5, b'P', b'L', b'C', b'1', 0]);
//!
//! let mut cursor = ReadCursor::new(&bytes);
//! assert_eq!(cursor.u32()?, 7);
//! assert_eq!(cursor.prefixed_string()?, "PLC1");
//! assert!(cursor.is_empty());
//! # Ok::<(), ads_utilities::AdsError>(())
//! ```

use std::net::Ipv4Addr;

use crate::address::{AmsNetId, NET_ID_SIZE};
use crate::error::{AdsError, Result};

/// Returns the length prefix byte for `s`: content length plus terminator.
///
/// # Errors
///
/// Returns `AdsError::InvalidParameter` if the string does not fit a one-byte
/// prefix.
///
/// # Example
///
/// ```
/// use ads_utilities::codec::string_prefix;
///
/// assert_eq!(string_prefix("abc").unwrap(), 4);
/// assert!(string_prefix(&"x".repeat(255)).is_err());
/// ```
pub fn string_prefix(s: &str) -> Result<u8> {
    u8::try_from(s.len() + 1).map_err(|_| {
        AdsError::invalid_parameter(
            "string",
            format!("{} bytes do not fit a one-byte length prefix", s.len()),
        )
    })
}

/// Converts a device-announced record count into a buffer length.
///
/// # Errors
///
/// Returns `AdsError::Decode` if `count * record_size` overflows or exceeds
/// `max_len`.
///
/// # Example
///
/// ```
/// use ads_utilities::codec::announced_length;
///
/// assert_eq!(announced_length(3, 48, 1024).unwrap(), 144);
/// assert!(announced_length(u32::MAX, 48, 1024).is_err());
/// ```
pub fn announced_length(count: u32, record_size: usize, max_len: usize) -> Result<usize> {
    usize::try_from(count)
        .ok()
        .and_then(|count| count.checked_mul(record_size))
        .filter(|len| *len <= max_len)
        .ok_or_else(|| {
            AdsError::decode(format!(
                "device announced {} records of {} bytes, limit is {} bytes",
                count, record_size, max_len
            ))
        })
}

/// Decodes bytes up to the first `0x00` as UTF-8, replacing invalid sequences.
pub(crate) fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decodes a fixed-width field with every `0x00` removed.
///
/// Device tables pad text fields with zeros on both sides of the content.
pub(crate) fn strip_nuls(bytes: &[u8]) -> String {
    let filtered: Vec<u8> = bytes.iter().copied().filter(|b| *b != 0).collect();
    String::from_utf8_lossy(&filtered).into_owned()
}

/// Builds a request buffer from ordered typed fields.
#[derive(Debug, Clone, Default)]
pub struct RequestWriter {
    buf: Vec<u8>,
}

impl RequestWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty writer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Appends raw bytes.
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Appends `count` zero bytes.
    pub fn zeros(&mut self, count: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + count, 0);
        self
    }

    /// Appends one byte.
    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Appends a little-endian `u16`.
    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    /// Appends a little-endian `u32`.
    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    /// Appends a little-endian `i32`.
    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    /// Appends the 6 octets of a Net ID.
    pub fn net_id(&mut self, net_id: &AmsNetId) -> &mut Self {
        self.bytes(&net_id.octets())
    }

    /// Appends the 4 octets of an IPv4 address in network order.
    pub fn ipv4(&mut self, ip: Ipv4Addr) -> &mut Self {
        self.bytes(&ip.octets())
    }

    /// Appends a UTF-8 string and its zero terminator.
    pub fn string(&mut self, s: &str) -> &mut Self {
        self.bytes(s.as_bytes()).u8(0)
    }

    /// Appends an ASCII string and its zero terminator.
    ///
    /// Characters outside ASCII are written as `?`.
    pub fn ascii_string(&mut self, s: &str) -> &mut Self {
        self.buf
            .extend(s.chars().map(|c| if c.is_ascii() { c as u8 } else { b'?' }));
        self.u8(0)
    }

    /// Appends a one-byte length prefix (`len + 1`), the UTF-8 string and its
    /// zero terminator.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::InvalidParameter` for strings of 255 bytes or more.
    pub fn prefixed_string(&mut self, s: &str) -> Result<&mut Self> {
        let prefix = string_prefix(s)?;
        Ok(self.u8(prefix).string(s))
    }

    /// Returns the number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer and returns the finished buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked cursor over a response buffer.
#[derive(Debug, Clone)]
pub struct ReadCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ReadCursor<'a> {
    /// Creates a cursor at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns the current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns `true` if every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Takes the next `count` bytes.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Decode` if fewer than `count` bytes remain.
    pub fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.remaining() {
            return Err(AdsError::decode(format!(
                "need {} bytes at offset {}, only {} remaining",
                count,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    /// Takes exactly `N` bytes as an array.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Skips `count` bytes.
    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.take(count).map(|_| ())
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian `u16`.
    pub fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_le_bytes)
    }

    /// Reads a little-endian `i16`.
    pub fn i16(&mut self) -> Result<i16> {
        self.array().map(i16::from_le_bytes)
    }

    /// Reads a little-endian `u32`.
    pub fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }

    /// Reads a little-endian `u64`.
    pub fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_le_bytes)
    }

    /// Reads a 6-byte Net ID.
    pub fn net_id(&mut self) -> Result<AmsNetId> {
        self.array::<NET_ID_SIZE>().map(AmsNetId::from)
    }

    /// Reads a 4-byte IPv4 address.
    pub fn ipv4(&mut self) -> Result<Ipv4Addr> {
        self.array::<4>().map(Ipv4Addr::from)
    }

    /// Reads a fixed-width text field, keeping the content before the first
    /// `0x00`.
    pub fn fixed_string(&mut self, width: usize) -> Result<String> {
        self.take(width).map(nul_terminated)
    }

    /// Reads a zero-terminated string and consumes its terminator.
    ///
    /// A string running to the end of the buffer without a terminator is
    /// returned as-is.
    pub fn string_until_nul(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let (content, consumed) = match rest.iter().position(|b| *b == 0) {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        self.pos += consumed;
        Ok(String::from_utf8_lossy(content).into_owned())
    }

    /// Reads a one-byte length prefix followed by that many bytes of text.
    ///
    /// The prefix counts the terminator, which is dropped from the result.
    pub fn prefixed_string(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        self.fixed_string(len)
    }
}
