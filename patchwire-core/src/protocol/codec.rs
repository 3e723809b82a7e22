//! Primitive wire encoding.
//!
//! Multi-byte integers are big-endian. Strings are UTF-8 with a length
//! prefix whose width is picked per field (`str8`, `str16`, `str32`). Hids
//! are written with the width chosen by the enclosing frame.

use crate::error::ProtocolError;
use crate::render::Hid;

/// Width of hid fields in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidWidth {
    U32,
    U64,
}

impl HidWidth {
    /// Smallest width that fits `max`.
    pub fn fitting(max: u64) -> Self {
        if max <= u64::from(u32::MAX) {
            HidWidth::U32
        } else {
            HidWidth::U64
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            HidWidth::U32 => 4,
            HidWidth::U64 => 8,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            4 => Ok(HidWidth::U32),
            8 => Ok(HidWidth::U64),
            other => Err(ProtocolError::InvalidHid(format!("width {other}"))),
        }
    }
}

#[derive(Debug)]
pub struct WireWriter {
    buf: Vec<u8>,
    hid_width: HidWidth,
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl WireWriter {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            hid_width: HidWidth::U64,
        }
    }

    pub fn set_hid_width(&mut self, width: HidWidth) {
        self.hid_width = width;
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Length prefix that must fit in `max`.
    fn len_prefix(&mut self, field: &'static str, len: usize, width: u8) -> Result<(), ProtocolError> {
        let max = match width {
            1 => u8::MAX as usize,
            2 => u16::MAX as usize,
            _ => u32::MAX as usize,
        };
        if len > max {
            return Err(ProtocolError::FieldTooLong { field, len, max });
        }
        match width {
            1 => self.u8(len as u8),
            2 => self.u16(len as u16),
            _ => self.u32(len as u32),
        }
        Ok(())
    }

    pub fn str8(&mut self, field: &'static str, s: &str) -> Result<(), ProtocolError> {
        self.len_prefix(field, s.len(), 1)?;
        self.raw(s.as_bytes());
        Ok(())
    }

    pub fn str16(&mut self, field: &'static str, s: &str) -> Result<(), ProtocolError> {
        self.len_prefix(field, s.len(), 2)?;
        self.raw(s.as_bytes());
        Ok(())
    }

    pub fn str32(&mut self, field: &'static str, s: &str) -> Result<(), ProtocolError> {
        self.len_prefix(field, s.len(), 4)?;
        self.raw(s.as_bytes());
        Ok(())
    }

    pub fn bytes32(&mut self, field: &'static str, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.len_prefix(field, bytes.len(), 4)?;
        self.raw(bytes);
        Ok(())
    }

    pub fn count32(&mut self, field: &'static str, count: usize) -> Result<(), ProtocolError> {
        self.len_prefix(field, count, 4)
    }

    pub fn hid(&mut self, hid: Hid) {
        match self.hid_width {
            HidWidth::U32 => self.u32(hid.raw() as u32),
            HidWidth::U64 => self.u64(hid.raw()),
        }
    }

    pub fn opt_hid(&mut self, hid: Option<Hid>) {
        match hid {
            Some(hid) => {
                self.u8(1);
                self.hid(hid);
            }
            None => self.u8(0),
        }
    }

    pub fn opt_u64(&mut self, v: Option<u64>) {
        match v {
            Some(v) => {
                self.u8(1);
                self.u64(v);
            }
            None => self.u8(0),
        }
    }

    pub fn opt_str8(&mut self, field: &'static str, s: Option<&str>) -> Result<(), ProtocolError> {
        match s {
            Some(s) => {
                self.u8(1);
                self.str8(field, s)
            }
            None => {
                self.u8(0);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    hid_width: HidWidth,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            hid_width: HidWidth::U64,
        }
    }

    pub fn set_hid_width(&mut self, width: HidWidth) {
        self.hid_width = width;
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn utf8(bytes: &[u8]) -> Result<String, ProtocolError> {
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn str8(&mut self) -> Result<String, ProtocolError> {
        let len = self.u8()? as usize;
        Self::utf8(self.take(len)?)
    }

    pub fn str16(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        Self::utf8(self.take(len)?)
    }

    pub fn str32(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        Self::utf8(self.take(len)?)
    }

    pub fn bytes32(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn hid(&mut self) -> Result<Hid, ProtocolError> {
        let raw = match self.hid_width {
            HidWidth::U32 => u64::from(self.u32()?),
            HidWidth::U64 => self.u64()?,
        };
        Ok(Hid::new(raw))
    }

    pub fn opt_hid(&mut self) -> Result<Option<Hid>, ProtocolError> {
        if self.bool()? {
            self.hid().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn opt_u64(&mut self) -> Result<Option<u64>, ProtocolError> {
        if self.bool()? {
            self.u64().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn opt_str8(&mut self) -> Result<Option<String>, ProtocolError> {
        if self.bool()? {
            self.str8().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Fail if anything is left unread.
    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut w = WireWriter::new();
        w.u16(0x0102);
        w.u32(0x0304_0506);
        assert_eq!(w.finish(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn strings_carry_length_prefix() {
        let mut w = WireWriter::new();
        w.str8("name", "ab").unwrap();
        w.str16("reason", "c").unwrap();
        let bytes = w.finish();
        assert_eq!(bytes, vec![2, b'a', b'b', 0, 1, b'c']);

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.str8().unwrap(), "ab");
        assert_eq!(r.str16().unwrap(), "c");
        r.finish().unwrap();
    }

    #[test]
    fn oversized_str8_is_refused() {
        let mut w = WireWriter::new();
        let long = "x".repeat(300);
        assert_eq!(
            w.str8("name", &long),
            Err(ProtocolError::FieldTooLong {
                field: "name",
                len: 300,
                max: 255
            })
        );
    }

    #[test]
    fn truncated_input_is_reported() {
        let mut r = WireReader::new(&[0, 1]);
        assert_eq!(
            r.u32(),
            Err(ProtocolError::Truncated {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn hid_width_follows_setting() {
        let mut w = WireWriter::new();
        w.set_hid_width(HidWidth::U32);
        w.hid(Hid::new(7));
        let bytes = w.finish();
        assert_eq!(bytes.len(), 4);

        let mut r = WireReader::new(&bytes);
        r.set_hid_width(HidWidth::U32);
        assert_eq!(r.hid().unwrap(), Hid::new(7));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut r = WireReader::new(&[2, 0xff, 0xfe]);
        assert_eq!(r.str8(), Err(ProtocolError::InvalidUtf8));
    }

    #[test]
    fn trailing_bytes_fail_finish() {
        let mut r = WireReader::new(&[1, 2]);
        r.u8().unwrap();
        assert_eq!(r.finish(), Err(ProtocolError::TrailingBytes(1)));
    }
}
