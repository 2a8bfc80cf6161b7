//! Fixed, versioned, little-endian wire encodings for the signal and
//! parameter channels.
//!
//! Fixed-size records are `#[repr(C)]` `bytemuck::Pod` structs; anything of
//! variable length (level vectors, parameter blocks, task payloads) goes
//! through [`WireWriter`]/[`WireReader`], which keep the byte order explicit
//! and fail loudly on truncation.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

use crate::combi_error::CombiError;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Signal frame sent from the manager to a group master.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct SignalFrame {
    pub version_le: u16,
    pub code_le: u16,
}

impl SignalFrame {
    pub fn new(code: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            code_le: code.to_le(),
        }
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn code(&self) -> u16 {
        u16::from_le(self.code_le)
    }
}

/// Third-level sub-protocol opcode, broadcast over the third-level
/// communicator while a combine step is in flight.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct TlOpFrame {
    pub code_le: u32,
}

impl TlOpFrame {
    pub fn new(code: u32) -> Self {
        Self {
            code_le: code.to_le(),
        }
    }
    pub fn code(&self) -> u32 {
        u32::from_le(self.code_le)
    }
}

const _: () = {
    assert!(size_of::<SignalFrame>() == 4);
    assert!(size_of::<TlOpFrame>() == 4);
};

/// Append-only little-endian encoder.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, x: u8) {
        self.buf.push(x);
    }

    pub fn put_u16(&mut self, x: u16) {
        self.buf.extend_from_slice(&x.to_le_bytes());
    }

    pub fn put_u32(&mut self, x: u32) {
        self.buf.extend_from_slice(&x.to_le_bytes());
    }

    pub fn put_u64(&mut self, x: u64) {
        self.buf.extend_from_slice(&x.to_le_bytes());
    }

    pub fn put_f64(&mut self, x: f64) {
        self.buf.extend_from_slice(&x.to_le_bytes());
    }

    pub fn put_bool(&mut self, x: bool) {
        self.put_u8(x as u8);
    }

    /// Length-prefixed byte block.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed u32 sequence (level vectors, parallelisation).
    pub fn put_u32_seq(&mut self, xs: &[u32]) {
        self.put_u64(xs.len() as u64);
        for &x in xs {
            self.put_u32(x);
        }
    }

    /// Length-prefixed u64 sequence (task ids, sizes, decompositions).
    pub fn put_u64_seq(&mut self, xs: &[u64]) {
        self.put_u64(xs.len() as u64);
        for &x in xs {
            self.put_u64(x);
        }
    }

    /// Length-prefixed f64 sequence (coefficients, coordinates).
    pub fn put_f64_seq(&mut self, xs: &[f64]) {
        self.put_u64(xs.len() as u64);
        for &x in xs {
            self.put_f64(x);
        }
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based little-endian decoder; truncation surfaces as
/// [`CombiError::Wire`].
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], CombiError> {
        if self.pos + n > self.buf.len() {
            return Err(CombiError::Wire(format!(
                "truncated while reading {} ({} of {} bytes left)",
                what,
                self.buf.len() - self.pos,
                n
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self, what: &str) -> Result<u8, CombiError> {
        Ok(self.take(1, what)?[0])
    }

    pub fn get_u16(&mut self, what: &str) -> Result<u16, CombiError> {
        Ok(u16::from_le_bytes(self.take(2, what)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self, what: &str) -> Result<u32, CombiError> {
        Ok(u32::from_le_bytes(self.take(4, what)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self, what: &str) -> Result<u64, CombiError> {
        Ok(u64::from_le_bytes(self.take(8, what)?.try_into().unwrap()))
    }

    pub fn get_f64(&mut self, what: &str) -> Result<f64, CombiError> {
        Ok(f64::from_le_bytes(self.take(8, what)?.try_into().unwrap()))
    }

    pub fn get_bool(&mut self, what: &str) -> Result<bool, CombiError> {
        Ok(self.get_u8(what)? != 0)
    }

    pub fn get_bytes(&mut self, what: &str) -> Result<&'a [u8], CombiError> {
        let n = self.get_u64(what)? as usize;
        self.take(n, what)
    }

    pub fn get_u32_seq(&mut self, what: &str) -> Result<Vec<u32>, CombiError> {
        let n = self.get_u64(what)? as usize;
        (0..n).map(|_| self.get_u32(what)).collect()
    }

    pub fn get_u64_seq(&mut self, what: &str) -> Result<Vec<u64>, CombiError> {
        let n = self.get_u64(what)? as usize;
        (0..n).map(|_| self.get_u64(what)).collect()
    }

    pub fn get_f64_seq(&mut self, what: &str) -> Result<Vec<f64>, CombiError> {
        let n = self.get_u64(what)? as usize;
        (0..n).map(|_| self.get_f64(what)).collect()
    }

    pub fn get_str(&mut self, what: &str) -> Result<String, CombiError> {
        let bytes = self.get_bytes(what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CombiError::Wire(format!("{} is not valid UTF-8", what)))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
