//! Low-level aligned, padded byte reader: the mirror image of
//! `dbus_writer.rs`. Every read checks bounds and reports
//! `Error::MalformedMessageData` rather than panicking, since the bytes
//! being decoded always originate from an untrusted peer.

use byteorder::ByteOrder;

use crate::error::{Error, Result};

pub struct ByteReader<'a> {
    pub buf: &'a [u8],
    pub pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn align(&mut self, align_to: usize) -> Result<()> {
        let padding = (align_to - (self.pos % align_to)) % align_to;
        if self.remaining() < padding {
            return Err(Error::MalformedMessageData);
        }
        self.pos += padding;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::MalformedMessageData);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool<T: ByteOrder>(&mut self) -> Result<bool> {
        let v = self.read_u32::<T>()?;
        Ok(v != 0)
    }

    pub fn read_i16<T: ByteOrder>(&mut self) -> Result<i16> {
        self.align(2)?;
        Ok(T::read_i16(self.take(2)?))
    }

    pub fn read_u16<T: ByteOrder>(&mut self) -> Result<u16> {
        self.align(2)?;
        Ok(T::read_u16(self.take(2)?))
    }

    pub fn read_i32<T: ByteOrder>(&mut self) -> Result<i32> {
        self.align(4)?;
        Ok(T::read_i32(self.take(4)?))
    }

    pub fn read_u32<T: ByteOrder>(&mut self) -> Result<u32> {
        self.align(4)?;
        Ok(T::read_u32(self.take(4)?))
    }

    pub fn read_i64<T: ByteOrder>(&mut self) -> Result<i64> {
        self.align(8)?;
        Ok(T::read_i64(self.take(8)?))
    }

    pub fn read_u64<T: ByteOrder>(&mut self) -> Result<u64> {
        self.align(8)?;
        Ok(T::read_u64(self.take(8)?))
    }

    pub fn read_f64<T: ByteOrder>(&mut self) -> Result<f64> {
        self.align(8)?;
        Ok(T::read_f64(self.take(8)?))
    }

    /// UINT32-length-prefixed string with a terminating NUL that is
    /// consumed but not included in the returned string. Rejects embedded
    /// NULs and invalid UTF-8.
    pub fn read_string32<T: ByteOrder>(&mut self) -> Result<String> {
        let len = self.read_u32::<T>()? as usize;
        let bytes = self.take(len)?.to_vec();
        if self.read_u8()? != 0 {
            return Err(Error::MalformedMessageData);
        }
        if bytes.contains(&0) {
            return Err(Error::InvalidString);
        }
        String::from_utf8(bytes).map_err(|_| Error::InvalidString)
    }

    /// One-byte-length-prefixed string (signatures), NUL-terminated.
    pub fn read_string8(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?.to_vec();
        if self.read_u8()? != 0 {
            return Err(Error::MalformedMessageData);
        }
        String::from_utf8(bytes).map_err(|_| Error::InvalidString)
    }
}
