//! Dual-mode binary codec core.
//!
//! A [`SerState`] either writes into or reads from a caller-supplied
//! buffer; message layouts are expressed once as a sequence of field visits
//! that work in both directions, so encode and decode cannot drift. Every
//! visit is bounds-checked and fails closed with the source line and the
//! violated expression, which is all a server can usefully log about a
//! hostile or torn packet.

use thiserror::Error;

use crate::arena::EntityId;
use crate::math::V2;

/// Where and why a codec pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("codec failure at {file}:{line}: {expression}")]
pub struct SerError {
    pub file: &'static str,
    pub line: u32,
    pub expression: &'static str,
}

pub type SerResult = Result<(), SerError>;

/// Fail the current codec pass unless `cond` holds.
#[macro_export]
macro_rules! ser_check {
    ($cond:expr) => {
        if !$cond {
            return Err($crate::ser::SerError {
                file: file!(),
                line: line!(),
                expression: stringify!($cond),
            });
        }
    };
}

enum Mode<'a> {
    Write(&'a mut [u8]),
    Read(&'a [u8]),
}

/// One serialization or deserialization pass over a bounded buffer.
pub struct SerState<'a> {
    mode: Mode<'a>,
    cursor: usize,
}

impl<'a> SerState<'a> {
    pub fn writing(buf: &'a mut [u8]) -> Self {
        Self {
            mode: Mode::Write(buf),
            cursor: 0,
        }
    }

    pub fn reading(buf: &'a [u8]) -> Self {
        Self {
            mode: Mode::Read(buf),
            cursor: 0,
        }
    }

    pub fn is_writing(&self) -> bool {
        matches!(self.mode, Mode::Write(_))
    }

    /// Bytes written or consumed so far.
    pub fn size(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        let len = match &self.mode {
            Mode::Write(buf) => buf.len(),
            Mode::Read(buf) => buf.len(),
        };
        len - self.cursor
    }

    /// Copy `scratch.len()` raw bytes through the buffer, in either
    /// direction. Every primitive visit bottoms out here.
    fn raw(&mut self, scratch: &mut [u8]) -> SerResult {
        let len = scratch.len();
        ser_check!(self.remaining() >= len);
        match &mut self.mode {
            Mode::Write(buf) => {
                buf[self.cursor..self.cursor + len].copy_from_slice(scratch);
            }
            Mode::Read(buf) => {
                scratch.copy_from_slice(&buf[self.cursor..self.cursor + len]);
            }
        }
        self.cursor += len;
        Ok(())
    }

    pub fn u8(&mut self, v: &mut u8) -> SerResult {
        let mut scratch = [*v];
        self.raw(&mut scratch)?;
        *v = scratch[0];
        Ok(())
    }

    pub fn u16(&mut self, v: &mut u16) -> SerResult {
        let mut scratch = v.to_le_bytes();
        self.raw(&mut scratch)?;
        *v = u16::from_le_bytes(scratch);
        Ok(())
    }

    pub fn u32(&mut self, v: &mut u32) -> SerResult {
        let mut scratch = v.to_le_bytes();
        self.raw(&mut scratch)?;
        *v = u32::from_le_bytes(scratch);
        Ok(())
    }

    pub fn u64(&mut self, v: &mut u64) -> SerResult {
        let mut scratch = v.to_le_bytes();
        self.raw(&mut scratch)?;
        *v = u64::from_le_bytes(scratch);
        Ok(())
    }

    pub fn i8(&mut self, v: &mut i8) -> SerResult {
        let mut scratch = v.to_le_bytes();
        self.raw(&mut scratch)?;
        *v = i8::from_le_bytes(scratch);
        Ok(())
    }

    pub fn i32(&mut self, v: &mut i32) -> SerResult {
        let mut scratch = v.to_le_bytes();
        self.raw(&mut scratch)?;
        *v = i32::from_le_bytes(scratch);
        Ok(())
    }

    pub fn i64(&mut self, v: &mut i64) -> SerResult {
        let mut scratch = v.to_le_bytes();
        self.raw(&mut scratch)?;
        *v = i64::from_le_bytes(scratch);
        Ok(())
    }

    pub fn f32(&mut self, v: &mut f32) -> SerResult {
        let mut scratch = v.to_le_bytes();
        self.raw(&mut scratch)?;
        *v = f32::from_le_bytes(scratch);
        Ok(())
    }

    pub fn f64(&mut self, v: &mut f64) -> SerResult {
        let mut scratch = v.to_le_bytes();
        self.raw(&mut scratch)?;
        *v = f64::from_le_bytes(scratch);
        Ok(())
    }

    pub fn bool(&mut self, v: &mut bool) -> SerResult {
        let mut byte = u8::from(*v);
        self.u8(&mut byte)?;
        ser_check!(byte <= 1);
        *v = byte == 1;
        Ok(())
    }

    pub fn v2(&mut self, v: &mut V2) -> SerResult {
        self.f64(&mut v.x)?;
        self.f64(&mut v.y)
    }

    /// Length-prefixed UTF-8 string, refused when longer than `max_len`.
    pub fn str(&mut self, v: &mut String, max_len: usize) -> SerResult {
        let mut len = v.len() as u32;
        self.u32(&mut len)?;
        ser_check!(len as usize <= max_len);
        if self.is_writing() {
            let mut bytes = v.clone().into_bytes();
            self.raw(&mut bytes)?;
        } else {
            let mut bytes = vec![0u8; len as usize];
            self.raw(&mut bytes)?;
            match String::from_utf8(bytes) {
                Ok(s) => *v = s,
                Err(_) => {
                    ser_check!(false);
                }
            }
        }
        Ok(())
    }

    /// Length-prefixed raw bytes, refused when longer than `max_len`.
    pub fn bytes(&mut self, v: &mut Vec<u8>, max_len: usize) -> SerResult {
        let mut len = v.len() as u32;
        self.u32(&mut len)?;
        ser_check!(len as usize <= max_len);
        if !self.is_writing() {
            v.resize(len as usize, 0);
        }
        self.raw(v)
    }

    pub fn entity_id(&mut self, v: &mut EntityId) -> SerResult {
        self.u32(&mut v.index)?;
        self.u32(&mut v.generation)
    }

    /// Presence byte followed by an always-written id, so records that
    /// carry optional references stay fixed-size.
    pub fn opt_entity_id(&mut self, v: &mut Option<EntityId>) -> SerResult {
        let mut present = v.is_some();
        self.bool(&mut present)?;
        let mut id = v.unwrap_or_default();
        self.entity_id(&mut id)?;
        *v = present.then_some(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut buf = [0u8; 64];
        let mut ser = SerState::writing(&mut buf);
        let mut a: u64 = 0xdead_beef_cafe_f00d;
        let mut b: f64 = -12.5;
        let mut c = true;
        let mut d: i8 = -1;
        ser.u64(&mut a).unwrap();
        ser.f64(&mut b).unwrap();
        ser.bool(&mut c).unwrap();
        ser.i8(&mut d).unwrap();
        let written = ser.size();

        let mut des = SerState::reading(&buf[..written]);
        let (mut a2, mut b2, mut c2, mut d2) = (0u64, 0f64, false, 0i8);
        des.u64(&mut a2).unwrap();
        des.f64(&mut b2).unwrap();
        des.bool(&mut c2).unwrap();
        des.i8(&mut d2).unwrap();
        assert_eq!((a, b, c, d), (a2, b2, c2, d2));
        assert_eq!(des.size(), written);
    }

    #[test]
    fn write_past_end_fails_closed() {
        let mut buf = [0u8; 4];
        let mut ser = SerState::writing(&mut buf);
        let mut v: u64 = 1;
        let err = ser.u64(&mut v).unwrap_err();
        assert!(err.line > 0);
    }

    #[test]
    fn truncated_read_fails_closed() {
        let buf = [0u8; 3];
        let mut des = SerState::reading(&buf);
        let mut v: u32 = 0;
        assert!(des.u32(&mut v).is_err());
    }

    #[test]
    fn bool_rejects_garbage() {
        let buf = [7u8];
        let mut des = SerState::reading(&buf);
        let mut v = false;
        assert!(des.bool(&mut v).is_err());
    }

    #[test]
    fn opt_entity_id_is_fixed_size() {
        let mut buf_some = [0u8; 16];
        let mut buf_none = [0u8; 16];
        let mut some = Some(EntityId {
            index: 3,
            generation: 9,
        });
        let mut none: Option<EntityId> = None;

        let mut ser = SerState::writing(&mut buf_some);
        ser.opt_entity_id(&mut some).unwrap();
        let some_len = ser.size();
        let mut ser = SerState::writing(&mut buf_none);
        ser.opt_entity_id(&mut none).unwrap();
        assert_eq!(some_len, ser.size());

        let mut des = SerState::reading(&buf_some[..some_len]);
        let mut out = None;
        des.opt_entity_id(&mut out).unwrap();
        assert_eq!(out, some);
    }

    #[test]
    fn str_round_trips_and_respects_bound() {
        let mut buf = [0u8; 64];
        let mut ser = SerState::writing(&mut buf);
        let mut name = String::from("pilot-3");
        ser.str(&mut name, 16).unwrap();
        let written = ser.size();

        let mut des = SerState::reading(&buf[..written]);
        let mut out = String::new();
        des.str(&mut out, 16).unwrap();
        assert_eq!(out, "pilot-3");

        // Longer than the caller's bound fails closed.
        let mut ser = SerState::writing(&mut buf);
        let mut long = "x".repeat(20);
        assert!(ser.str(&mut long, 16).is_err());
    }

    #[test]
    fn str_rejects_invalid_utf8() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0xfe]);
        let mut des = SerState::reading(&bytes);
        let mut out = String::new();
        assert!(des.str(&mut out, 16).is_err());
    }

    #[test]
    fn bytes_respects_bound() {
        let mut buf = [0u8; 64];
        let mut ser = SerState::writing(&mut buf);
        let mut payload = vec![1u8, 2, 3, 4, 5];
        assert!(ser.bytes(&mut payload, 4).is_err());
        let mut ser = SerState::writing(&mut buf);
        assert!(ser.bytes(&mut payload, 8).is_ok());
    }
}
