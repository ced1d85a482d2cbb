//! Low-level aligned, padded, byte-order-directed byte emitter.
//!
//! Grows a plain `Vec<u8>` rather than writing through a generic
//! `io::Write`: the codec buffers a whole message in memory before
//! handing it to the transport, so there's no destination to stream
//! into incrementally.

use byteorder::{ByteOrder, WriteBytesExt};

pub struct ByteWriter {
    pub buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        ByteWriter { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        ByteWriter { buf: Vec::with_capacity(cap) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Pad with zero bytes until `self.len()` is a multiple of `align_to`.
    pub fn align(&mut self, align_to: usize) {
        let padding = (align_to - (self.buf.len() % align_to)) % align_to;
        self.buf.resize(self.buf.len() + padding, 0);
    }

    pub fn write_u8(&mut self, n: u8) {
        self.buf.push(n);
    }

    pub fn write_bool<T: ByteOrder>(&mut self, b: bool) {
        self.write_u32::<T>(b as u32);
    }

    pub fn write_i16<T: ByteOrder>(&mut self, v: i16) {
        self.align(2);
        self.buf.write_i16::<T>(v).expect("vec write never fails");
    }

    pub fn write_u16<T: ByteOrder>(&mut self, v: u16) {
        self.align(2);
        self.buf.write_u16::<T>(v).expect("vec write never fails");
    }

    pub fn write_i32<T: ByteOrder>(&mut self, v: i32) {
        self.align(4);
        self.buf.write_i32::<T>(v).expect("vec write never fails");
    }

    pub fn write_u32<T: ByteOrder>(&mut self, v: u32) {
        self.align(4);
        self.buf.write_u32::<T>(v).expect("vec write never fails");
    }

    pub fn write_i64<T: ByteOrder>(&mut self, v: i64) {
        self.align(8);
        self.buf.write_i64::<T>(v).expect("vec write never fails");
    }

    pub fn write_u64<T: ByteOrder>(&mut self, v: u64) {
        self.align(8);
        self.buf.write_u64::<T>(v).expect("vec write never fails");
    }

    pub fn write_f64<T: ByteOrder>(&mut self, v: f64) {
        self.align(8);
        self.buf.write_f64::<T>(v).expect("vec write never fails");
    }

    /// UINT32 length prefix + bytes + terminating NUL (not counted in the
    /// length), used for `s` and `o`.
    pub fn write_string32<T: ByteOrder>(&mut self, s: &str) {
        self.write_u32::<T>(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// One-byte length prefix + bytes + terminating NUL, used for `g`.
    pub fn write_string8(&mut self, s: &str) {
        self.buf.push(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Reserve a 4-byte length placeholder, returning its position so the
    /// caller can `backpatch_u32` once the body is known.
    pub fn reserve_u32_placeholder(&mut self) -> usize {
        let pos = self.buf.len();
        self.buf.extend_from_slice(&[0, 0, 0, 0]);
        pos
    }

    pub fn backpatch_u32<T: ByteOrder>(&mut self, pos: usize, value: u32) {
        T::write_u32(&mut self.buf[pos..pos + 4], value);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}
