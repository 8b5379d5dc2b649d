//! Canonical binary encoding primitives shared by the object format
//! (`objects::format`) and the pack format (`pack::format`).
//!
//! The reference implementation (`ostree-repo.c`) leans on GVariant for its
//! canonical, byte-exact tuple encoding. This crate has no GVariant binding
//! to draw on, so the same property -- a fixed, deterministic byte layout
//! that round-trips exactly -- is reproduced here with a small hand-rolled
//! length-prefixed format: every variable-length field is preceded by its
//! length as a big-endian `u32` or `u64`, mirroring the fixed-width
//! begin/size fields `ostree-repo.c` reads out of its variants.

use std::convert::TryFrom;

use crate::error::Error;

/// A growable byte buffer with helpers for writing the primitives our
/// canonical formats need, in a fixed field order.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Start an empty encoder.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Consume the encoder, yielding the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Write a single byte (used for type tags).
    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    /// Write a big-endian u32.
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Write a big-endian u64.
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Write a length-prefixed byte string.
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn str(&mut self, v: &str) -> &mut Self {
        self.bytes(v.as_bytes())
    }

    /// Write a fixed-size 32-byte checksum's raw bytes (no length prefix,
    /// since the length is always 32).
    pub fn checksum(&mut self, v: &crate::checksum::Checksum) -> &mut Self {
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    /// Write an optional checksum as a one-byte presence tag followed by the
    /// checksum bytes if present.
    pub fn opt_checksum(&mut self, v: Option<&crate::checksum::Checksum>) -> &mut Self {
        match v {
            Some(c) => {
                self.u8(1);
                self.checksum(c);
            }
            None => {
                self.u8(0);
            }
        }
        self
    }
}

/// A cursor over an encoded byte slice, with helpers mirroring [`Encoder`].
/// Every read method returns an [`Error::InvalidFormat`] on truncation so
/// that corrupt or foreshortened objects are rejected rather than panicking.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    context: String,
}

impl<'a> Decoder<'a> {
    /// Begin decoding `buf`; `context` is used to annotate any error raised.
    pub fn new(buf: &'a [u8], context: impl Into<String>) -> Self {
        Self {
            buf,
            pos: 0,
            context: context.into(),
        }
    }

    fn err(&self, detail: impl Into<String>) -> Error {
        Error::InvalidFormat {
            context: self.context.clone(),
            detail: detail.into(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.buf.len() {
            return Err(self.err(format!(
                "truncated: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a single byte.
    pub fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian u32.
    pub fn u32(&mut self) -> Result<u32, Error> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(<[u8; 4]>::try_from(bytes).unwrap()))
    }

    /// Read a big-endian u64.
    pub fn u64(&mut self) -> Result<u64, Error> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(<[u8; 8]>::try_from(bytes).unwrap()))
    }

    /// Read a length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn str(&mut self) -> Result<String, Error> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|_| self.err("invalid utf-8"))
    }

    /// Read a fixed 32-byte checksum.
    pub fn checksum(&mut self) -> Result<crate::checksum::Checksum, Error> {
        let bytes = self.take(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(crate::checksum::Checksum::from_bytes(arr))
    }

    /// Read an optional checksum written by [`Encoder::opt_checksum`].
    pub fn opt_checksum(&mut self) -> Result<Option<crate::checksum::Checksum>, Error> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.checksum()?)),
            other => Err(self.err(format!("invalid presence tag {}", other))),
        }
    }

    /// True once every byte of the buffer has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Fail unless the decoder has consumed the entire buffer -- guards
    /// against trailing garbage after a structurally valid prefix.
    pub fn expect_exhausted(&self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self.err(format!(
                "{} trailing bytes after expected content",
                self.buf.len() - self.pos
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;

    #[test]
    fn test_round_trip_primitives() {
        let mut enc = Encoder::new();
        enc.u8(7).u32(1234).u64(9_000_000_000).str("hello").bytes(b"\x00\x01");
        let csum = Checksum::of_bytes(b"x");
        enc.opt_checksum(Some(&csum)).opt_checksum(None);
        let bytes = enc.into_bytes();

        let mut dec = Decoder::new(&bytes, "test");
        assert_eq!(dec.u8().unwrap(), 7);
        assert_eq!(dec.u32().unwrap(), 1234);
        assert_eq!(dec.u64().unwrap(), 9_000_000_000);
        assert_eq!(dec.str().unwrap(), "hello");
        assert_eq!(dec.bytes().unwrap(), b"\x00\x01".to_vec());
        assert_eq!(dec.opt_checksum().unwrap(), Some(csum));
        assert_eq!(dec.opt_checksum().unwrap(), None);
        dec.expect_exhausted().unwrap();
    }

    #[test]
    fn test_truncated_input_is_invalid_format() {
        let mut dec = Decoder::new(&[0, 0, 0, 5, b'h', b'i'], "test");
        assert!(dec.str().is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut enc = Encoder::new();
        enc.u8(1);
        enc.u8(2);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes, "test");
        dec.u8().unwrap();
        assert!(dec.expect_exhausted().is_err());
    }
}
