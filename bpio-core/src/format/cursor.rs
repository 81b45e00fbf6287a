//! Little-endian byte cursors used by every record encoder
//!
//! All multi-byte integers on disk are little endian regardless of the
//! host; element payloads are stored in host order and guarded by the
//! endianness byte of the file headers.

use alloc::vec::Vec;

use crate::error::{FormatError, Result};

/// Append-only encoder over a borrowed `Vec<u8>`
pub struct ByteWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    /// Current length of the underlying buffer
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a u16 length prefix followed by the string bytes
    pub fn put_name(&mut self, name: &str) -> Result<()> {
        let len = u16::try_from(name.len()).map_err(|_| FormatError::ArraySizeOverflow)?;
        self.put_u16(len);
        self.put_bytes(name.as_bytes());
        Ok(())
    }

    /// Write a u32 length prefix followed by the bytes
    pub fn put_blob(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| FormatError::ArraySizeOverflow)?;
        self.put_u32(len);
        self.put_bytes(bytes);
        Ok(())
    }

    pub fn put_dims(&mut self, dims: &[u64]) {
        for &d in dims {
            self.put_u64(d);
        }
    }

    /// Reserve a u32 slot to be filled later with [`ByteWriter::patch_u32`]
    pub fn reserve_u32(&mut self) -> usize {
        let pos = self.buf.len();
        self.put_u32(0);
        pos
    }

    pub fn patch_u32(&mut self, pos: usize, value: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Bounds-checked decoder over a byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Peek the next byte without consuming it
    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(FormatError::CorruptedData)?;
        if end > self.data.len() {
            return Err(FormatError::InsufficientBuffer);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_le_bytes)
    }

    /// Read a u16-length-prefixed UTF-8 string
    pub fn name(&mut self) -> Result<&'a str> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        core::str::from_utf8(bytes).map_err(|_| FormatError::CorruptedData)
    }

    /// Read a u32-length-prefixed byte blob
    pub fn blob(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn dims(&mut self, ndims: usize) -> Result<Vec<u64>> {
        (0..ndims).map(|_| self.u64()).collect()
    }
}
