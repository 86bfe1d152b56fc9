// Serialization utilities for Bitcoin data structures
//
// Decoding works on a byte buffer plus an offset so that a container can
// locate its children without copying. Encoding appends to a Vec<u8>, which
// cannot fail.

use crate::core::Hash256;
use crate::error::{Error, Result};

/// Types that can be written in wire format
pub trait Encodable {
    /// Append the wire form to `out`
    fn encode(&self, out: &mut Vec<u8>);

    /// Exact number of bytes `encode` will append
    fn message_size(&self) -> usize;

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.message_size());
        self.encode(&mut out);
        out
    }
}

/// Types that can be read from wire format
pub trait Decodable: Sized {
    /// Decode from `buf` starting at `offset`.
    ///
    /// `known_length` is the span the caller already knows (e.g. from a
    /// message header), or `None` when the value is embedded in a larger
    /// structure. Returns the value and the number of bytes it occupies.
    fn decode(buf: &[u8], offset: usize, known_length: Option<usize>) -> Result<(Self, usize)>;

    fn deserialize(data: &[u8]) -> Result<Self> {
        let (value, _) = Self::decode(data, 0, Some(data.len()))?;
        Ok(value)
    }
}

/// Number of bytes the canonical varint encoding of `value` takes
pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffffffff => 5,
        _ => 9,
    }
}

/// Write a variable-length integer (VarInt)
/// Bitcoin uses a compact format for integers
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => {
            out.push(value as u8);
        }
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffffffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(varint_size(value));
    write_varint(&mut out, value);
    out
}

/// Read a variable-length integer (VarInt). Returns (value, bytes consumed).
pub fn decode_varint(buf: &[u8], offset: usize) -> Result<(u64, usize)> {
    let first = *buf
        .get(offset)
        .ok_or_else(|| Error::malformed(format!("varint at {} past end of {} byte buffer", offset, buf.len())))?;

    match first {
        0..=0xfc => Ok((first as u64, 1)),
        0xfd => Ok((read_u16_le(buf, offset + 1)? as u64, 3)),
        0xfe => Ok((read_u32_le(buf, offset + 1)? as u64, 5)),
        0xff => Ok((read_u64_le(buf, offset + 1)?, 9)),
    }
}

/// Write bytes with length prefix (VarInt length + data)
pub fn write_var_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_varint(out, data.len() as u64);
    out.extend_from_slice(data);
}

pub fn var_bytes_size(data: &[u8]) -> usize {
    varint_size(data.len() as u64) + data.len()
}

/// Skip a VarInt-prefixed byte string at `offset`, returning its total span
/// (prefix + payload) without copying it.
pub fn skip_var_bytes(buf: &[u8], offset: usize) -> Result<usize> {
    let (len, prefix) = decode_varint(buf, offset)?;
    let span = usize::try_from(len)
        .ok()
        .and_then(|len| len.checked_add(prefix))
        .ok_or_else(|| Error::malformed(format!("byte string length {} overflows", len)))?;
    match offset.checked_add(span) {
        Some(end) if end <= buf.len() => Ok(span),
        _ => Err(Error::malformed(format!(
            "byte string of {} bytes at {} past end of {} byte buffer",
            len, offset, buf.len()
        ))),
    }
}

pub fn read_bytes(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| Error::malformed(format!(
            "need {} bytes at {} but buffer holds {}",
            len, offset, buf.len()
        )))
}

fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(read_bytes(buf, offset, N)?);
    Ok(bytes)
}

pub fn read_u16_le(buf: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(read_array(buf, offset)?))
}

pub fn read_u32_le(buf: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(buf, offset)?))
}

pub fn read_u64_le(buf: &[u8], offset: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(buf, offset)?))
}

pub fn read_hash(buf: &[u8], offset: usize) -> Result<Hash256> {
    Ok(Hash256::new(read_array(buf, offset)?))
}

pub fn write_u16_le(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn write_u32_le(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn write_u64_le(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Cursor over a byte buffer. Tracks how far decoding has advanced so a
/// decoder can report exactly how many bytes it consumed.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8], offset: usize) -> Self {
        Self { buf, pos: offset }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.buf.get(self.pos).ok_or_else(|| {
            Error::malformed(format!("byte at {} past end of {} byte buffer", self.pos, self.buf.len()))
        })?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let value = read_u16_le(self.buf, self.pos)?;
        self.pos += 2;
        Ok(value)
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        let value = read_u16_le(self.buf, self.pos)?.swap_bytes();
        self.pos += 2;
        Ok(value)
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let value = read_u32_le(self.buf, self.pos)?;
        self.pos += 4;
        Ok(value)
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        let value = read_u64_le(self.buf, self.pos)?;
        self.pos += 8;
        Ok(value)
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let (value, size) = decode_varint(self.buf, self.pos)?;
        self.pos += size;
        Ok(value)
    }

    pub fn read_hash(&mut self) -> Result<Hash256> {
        let hash = read_hash(self.buf, self.pos)?;
        self.pos += 32;
        Ok(hash)
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let bytes = read_bytes(self.buf, self.pos, len)?;
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_varint()?;
        let len = usize::try_from(len)
            .map_err(|_| Error::malformed(format!("byte string length {} overflows", len)))?;
        Ok(self.read_slice(len)?.to_vec())
    }

    /// Read a list count and make sure the buffer can possibly hold that
    /// many entries of at least `min_entry_size` bytes, so callers can
    /// allocate for it without trusting the peer.
    pub fn read_count(&mut self, min_entry_size: usize) -> Result<usize> {
        let count = self.read_varint()?;
        let fits = usize::try_from(count)
            .ok()
            .and_then(|n| n.checked_mul(min_entry_size))
            .is_some_and(|bytes| bytes <= self.remaining());
        if !fits {
            return Err(Error::malformed(format!(
                "list of {} entries cannot fit in {} remaining bytes",
                count,
                self.remaining()
            )));
        }
        Ok(count as usize)
    }
}
