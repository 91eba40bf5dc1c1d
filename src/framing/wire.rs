//! Primitive AMQP field encoding.
//!
//! Writers append to a caller-owned `BytesMut`; the reader borrows the
//! inbound slice. Nothing here keeps a buffer between calls.

use bytes::{BufMut, BytesMut};

use crate::error::{AmqError, Result};

/// Longest value a short string (`shortstr`) can carry.
pub const SHORT_STR_MAX: usize = u8::MAX as usize;

pub fn put_short_str(buf: &mut BytesMut, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > SHORT_STR_MAX {
        return Err(AmqError::Encoding(format!(
            "short string of {} bytes exceeds {} byte limit",
            bytes.len(),
            SHORT_STR_MAX
        )));
    }
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);
    Ok(())
}

pub fn put_long_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        AmqError::Encoding(format!("long string of {} bytes is too large", bytes.len()))
    })?;
    buf.put_u32(len);
    buf.put_slice(bytes);
    Ok(())
}

/// Pack consecutive bit arguments into one octet, first bit lowest.
pub fn pack_bits(bits: &[bool]) -> u8 {
    bits.iter()
        .enumerate()
        .fold(0u8, |acc, (i, &bit)| if bit { acc | (1 << i) } else { acc })
}

/// Cursor over an inbound payload.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(AmqError::MalformedFrame(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "octet")?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2, "short")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4, "long")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8, "longlong")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn short_str(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        let raw = self.take(len, "short string")?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| AmqError::MalformedFrame(format!("short string is not UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_str_limit() {
        let mut buf = BytesMut::new();
        assert!(put_short_str(&mut buf, &"x".repeat(255)).is_ok());
        assert_eq!(buf.len(), 256);

        let mut buf = BytesMut::new();
        assert!(matches!(
            put_short_str(&mut buf, &"x".repeat(256)),
            Err(AmqError::Encoding(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pack_bits() {
        assert_eq!(pack_bits(&[false]), 0);
        assert_eq!(pack_bits(&[true]), 1);
        assert_eq!(pack_bits(&[false, true]), 2);
        assert_eq!(pack_bits(&[true, true]), 3);
    }

    #[test]
    fn test_reader_truncation() {
        let mut reader = Reader::new(&[0x00, 0x05, 0x41]);
        assert_eq!(reader.u16().unwrap(), 5);
        assert!(matches!(reader.u16(), Err(AmqError::MalformedFrame(_))));

        let mut reader = Reader::new(&[0x03, b'a', b'b']);
        assert!(reader.short_str().is_err());
    }
}
