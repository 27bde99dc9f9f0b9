//! Hand-rolled little-endian binary codec: fixed-width primitives, length-prefixed strings and
//! byte arrays, with truncation and trailing-byte detection. This is core spec subject matter
//! (the on-disk frame/container layout), not something delegated to `bincode`.

use crate::errors::WaxError;

/// Cursor-style encoder writing into a growable byte buffer.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap) }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_f64(&mut self, v: f64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    /// Writes a `u32` length prefix followed by the raw bytes.
    pub fn put_bytes_lp(&mut self, b: &[u8]) -> &mut Self {
        self.put_u32(crate::utils::num::u128_to_u64_saturating(b.len() as u128) as u32);
        self.put_bytes(b);
        self
    }

    /// Writes a `u32` length prefix followed by UTF-8 bytes.
    pub fn put_str_lp(&mut self, s: &str) -> &mut Self {
        self.put_bytes_lp(s.as_bytes());
        self
    }

    /// Writes a `u32` count prefix followed by each element's length-prefixed bytes.
    pub fn put_str_array(&mut self, items: &[String]) -> &mut Self {
        self.put_u32(crate::utils::num::u128_to_u64_saturating(items.len() as u128) as u32);
        for item in items {
            self.put_str_lp(item);
        }
        self
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Cursor-style decoder reading from a borrowed byte slice, detecting truncation.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WaxError> {
        if self.remaining() < n {
            return Err(WaxError::decoding(format!(
                "truncated: need {n} bytes, have {} at offset {}",
                self.remaining(),
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, WaxError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, WaxError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, WaxError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, WaxError> {
        let b = self.take(8)?;
        let arr: [u8; 8] = b.try_into().map_err(|_| WaxError::decoding("u64 slice"))?;
        Ok(u64::from_le_bytes(arr))
    }

    pub fn get_i64(&mut self) -> Result<i64, WaxError> {
        let b = self.take(8)?;
        let arr: [u8; 8] = b.try_into().map_err(|_| WaxError::decoding("i64 slice"))?;
        Ok(i64::from_le_bytes(arr))
    }

    pub fn get_f64(&mut self) -> Result<f64, WaxError> {
        let b = self.take(8)?;
        let arr: [u8; 8] = b.try_into().map_err(|_| WaxError::decoding("f64 slice"))?;
        Ok(f64::from_le_bytes(arr))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], WaxError> {
        self.take(n)
    }

    /// Reads a `u32` length prefix followed by that many raw bytes.
    pub fn get_bytes_lp(&mut self) -> Result<&'a [u8], WaxError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    /// Reads a `u32` length prefix followed by UTF-8 bytes.
    pub fn get_str_lp(&mut self) -> Result<String, WaxError> {
        let bytes = self.get_bytes_lp()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| WaxError::decoding(format!("invalid utf8: {e}")))
    }

    /// Reads a `u32` count prefix followed by that many length-prefixed strings.
    pub fn get_str_array(&mut self) -> Result<Vec<String>, WaxError> {
        let count = self.get_u32()? as usize;
        let mut out = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            out.push(self.get_str_lp()?);
        }
        Ok(out)
    }

    /// Returns an error if any bytes remain unconsumed — used to detect trailing garbage
    /// after decoding a fixed-shape record.
    pub fn expect_exhausted(&self) -> Result<(), WaxError> {
        if self.remaining() != 0 {
            return Err(WaxError::decoding(format!("{} trailing bytes after decode", self.remaining())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives_and_lp_strings() {
        let mut enc = Encoder::new();
        enc.put_u8(7).put_u16(300).put_u32(70_000).put_u64(9_000_000_000).put_i64(-42).put_f64(1.5);
        enc.put_str_lp("hello");
        enc.put_str_array(&["a".into(), "bb".into()]);
        let bytes = enc.into_bytes();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.get_u8().unwrap(), 7);
        assert_eq!(dec.get_u16().unwrap(), 300);
        assert_eq!(dec.get_u32().unwrap(), 70_000);
        assert_eq!(dec.get_u64().unwrap(), 9_000_000_000);
        assert_eq!(dec.get_i64().unwrap(), -42);
        assert_eq!(dec.get_f64().unwrap(), 1.5);
        assert_eq!(dec.get_str_lp().unwrap(), "hello");
        assert_eq!(dec.get_str_array().unwrap(), vec!["a".to_string(), "bb".to_string()]);
        dec.expect_exhausted().unwrap();
    }

    #[test]
    fn detects_truncation() {
        let mut enc = Encoder::new();
        enc.put_u32(100); // claims 100 bytes follow but none are written
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert!(dec.get_bytes_lp().is_err());
    }

    #[test]
    fn detects_trailing_bytes() {
        let mut enc = Encoder::new();
        enc.put_u8(1).put_u8(2);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        let _ = dec.get_u8().unwrap();
        assert!(dec.expect_exhausted().is_err());
    }
}
