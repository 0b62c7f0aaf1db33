//! Byte buffers for message encoding and decoding.
//!
//! All multi-byte integers are big-endian. Two length-prefixed layouts exist:
//! - *chunks* (`u32` length + bytes) for message-level strings and blobs
//! - *column values* (one length byte, `0xFF` = NULL, `0xFE` = `u32` length
//!   follows, otherwise the inline length) for bind and row data

use crate::error::{Error, Result};

/// Length byte marking a NULL column value.
pub const NULL_INDICATOR: u8 = 0xFF;

/// Length byte announcing a `u32` length after it.
pub const LONG_INDICATOR: u8 = 0xFE;

/// Largest length stored inline in the length byte.
pub const MAX_INLINE_LENGTH: usize = 0xFD;

/// Growable output buffer, cleared and reused between requests.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    data: Vec<u8>,
}

impl WriteBuffer {
    /// Create a buffer with preallocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Drop the contents but keep the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Encoded bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of encoded bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i16(&mut self, value: i16) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Write a `u32`-length-prefixed chunk.
    pub fn put_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| Error::interface(format!("chunk of {} bytes is too large", bytes.len())))?;
        self.put_u32(len);
        self.put_bytes(bytes);
        Ok(())
    }

    /// Write a UTF-8 string as a chunk.
    pub fn put_str(&mut self, value: &str) -> Result<()> {
        self.put_chunk(value.as_bytes())
    }

    /// Write a column value with the column-value length prefix.
    pub fn put_value(&mut self, value: Option<&[u8]>) -> Result<()> {
        match value {
            None => self.put_u8(NULL_INDICATOR),
            Some(bytes) if bytes.len() <= MAX_INLINE_LENGTH => {
                self.put_u8(bytes.len() as u8);
                self.put_bytes(bytes);
            }
            Some(bytes) => {
                self.put_u8(LONG_INDICATOR);
                self.put_chunk(bytes)?;
            }
        }
        Ok(())
    }
}

/// Cursor over a received message.
#[derive(Debug, Clone)]
pub struct ReadBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ReadBuffer<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::protocol(format!(
                "truncated message: needed {len} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get_bytes(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_array::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.get_array().map(u16::from_be_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.get_array().map(u32::from_be_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.get_array().map(u64::from_be_bytes)
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        self.get_array().map(i16::from_be_bytes)
    }

    pub fn get_chunk(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.get_bytes(len)
    }

    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_chunk()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::protocol(format!("invalid UTF-8 in message string: {e}")))
    }

    /// Read a column value; `None` is NULL.
    pub fn get_value(&mut self) -> Result<Option<&'a [u8]>> {
        match self.get_u8()? {
            NULL_INDICATOR => Ok(None),
            LONG_INDICATOR => self.get_chunk().map(Some),
            len => self.get_bytes(usize::from(len)).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_big_endian() {
        let mut buf = WriteBuffer::default();
        buf.put_u16(0x0102);
        buf.put_u32(0x0304_0506);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5, 6]);

        let mut reader = ReadBuffer::new(buf.as_slice());
        assert_eq!(reader.get_u16().unwrap(), 0x0102);
        assert_eq!(reader.get_u32().unwrap(), 0x0304_0506);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_value_framing() {
        let long = vec![7u8; 300];
        let mut buf = WriteBuffer::default();
        buf.put_value(None).unwrap();
        buf.put_value(Some(b"")).unwrap();
        buf.put_value(Some(&[9u8; MAX_INLINE_LENGTH])).unwrap();
        buf.put_value(Some(&long)).unwrap();

        assert_eq!(buf.as_slice()[0], NULL_INDICATOR);
        assert_eq!(buf.as_slice()[1], 0);
        assert_eq!(buf.as_slice()[2], 0xFD);

        let mut reader = ReadBuffer::new(buf.as_slice());
        assert_eq!(reader.get_value().unwrap(), None);
        assert_eq!(reader.get_value().unwrap(), Some(&b""[..]));
        assert_eq!(reader.get_value().unwrap().unwrap().len(), MAX_INLINE_LENGTH);
        assert_eq!(reader.get_value().unwrap().unwrap(), long.as_slice());
        assert!(reader.is_empty());
    }

    #[test]
    fn test_truncated_read_is_protocol_error() {
        let mut reader = ReadBuffer::new(&[0, 0, 0, 9, 1, 2]);
        let err = reader.get_chunk().unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = WriteBuffer::with_capacity(64);
        buf.put_bytes(&[1; 32]);
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.data.capacity() >= 64);
    }
}
