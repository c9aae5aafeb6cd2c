// ── Fallible little-endian reader ──
//
// `bytes::Buf` panics on underflow; every device payload goes through
// this cursor instead so a short packet surfaces as `Error::Truncated`.

use bytes::{Buf, Bytes};

use crate::error::Error;

/// Cursor over a received payload.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    context: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self { buf, context }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, needed: usize) -> Result<(), Error> {
        if self.buf.len() < needed {
            return Err(Error::truncated(self.context, needed, self.buf.len()));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, Error> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn bool(&mut self) -> Result<bool, Error> {
        Ok(self.u8()? != 0)
    }

    pub fn u16_le(&mut self) -> Result<u16, Error> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u16_be(&mut self) -> Result<u16, Error> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn i16_le(&mut self) -> Result<i16, Error> {
        self.ensure(2)?;
        Ok(self.buf.get_i16_le())
    }

    pub fn u32_le(&mut self) -> Result<u32, Error> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64_le(&mut self) -> Result<u64, Error> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn f32_le(&mut self) -> Result<f32, Error> {
        self.ensure(4)?;
        Ok(self.buf.get_f32_le())
    }

    /// Borrow the next `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Borrow everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

/// Decode a whole payload as UTF-8.
pub fn utf8(payload: &[u8], context: &'static str) -> Result<String, Error> {
    std::str::from_utf8(payload)
        .map(str::to_owned)
        .map_err(|source| Error::Utf8 { context, source })
}

/// Read a u8-length-prefixed UTF-8 string, as used by the bridge envelopes.
pub fn read_short_string(reader: &mut ByteReader<'_>, context: &'static str) -> Result<String, Error> {
    let len = usize::from(reader.u8()?);
    let raw = reader.take(len)?;
    utf8(raw, context)
}

/// Append a u8-length-prefixed UTF-8 string.
pub fn write_short_string(out: &mut Vec<u8>, value: &str) -> Result<(), Error> {
    let len = u8::try_from(value.len()).map_err(|_| Error::PayloadTooLarge {
        len: value.len(),
        max: usize::from(u8::MAX),
    })?;
    out.push(len);
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Cheap owned copy of a sub-slice when the caller holds `Bytes`.
pub fn slice_of(source: &Bytes, sub: &[u8]) -> Bytes {
    source.slice_ref(sub)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields() {
        let data = [0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12];
        let mut r = ByteReader::new(&data, "test");
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.u16_le().unwrap(), 0x1234);
        assert_eq!(r.u32_le().unwrap(), 0x1234_5678);
        assert!(r.is_empty());
    }

    #[test]
    fn short_read_is_truncated_error() {
        let data = [0x01];
        let mut r = ByteReader::new(&data, "battery current");
        let err = r.f32_le().unwrap_err();
        assert!(matches!(
            err,
            Error::Truncated {
                context: "battery current",
                needed: 4,
                available: 1
            }
        ));
    }

    #[test]
    fn short_string_round_trip() {
        let mut out = Vec::new();
        write_short_string(&mut out, "left-insole").unwrap();
        assert_eq!(out[0], 11);
        let mut r = ByteReader::new(&out, "id");
        assert_eq!(read_short_string(&mut r, "id").unwrap(), "left-insole");
    }

    #[test]
    fn short_string_rejects_long_values() {
        let long = "x".repeat(300);
        let mut out = Vec::new();
        assert!(matches!(
            write_short_string(&mut out, &long),
            Err(Error::PayloadTooLarge { len: 300, max: 255 })
        ));
    }
}
