//! User memory as seen by `read()`/`write()`.
//!
//! Copies can fault, so every transfer goes through [`Uio`] and a fault ends the call with
//! whatever was moved before it.

use crate::error::{Result, UsbDevError};

pub trait Uio {
    /// Bytes still to be transferred.
    fn resid(&self) -> usize;

    /// Copies `src` to user memory and advances.
    fn copy_out(&mut self, src: &[u8]) -> Result<()>;

    /// Fills `dst` from user memory and advances.
    fn copy_in(&mut self, dst: &mut [u8]) -> Result<()>;
}

/// Destination of a `read()`.
#[derive(Debug)]
pub struct ReadUio<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ReadUio<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn transferred(&self) -> usize {
        self.pos
    }
}

impl Uio for ReadUio<'_> {
    fn resid(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn copy_out(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.resid() {
            return Err(UsbDevError::Fault);
        }
        self.buf[self.pos..self.pos + src.len()].copy_from_slice(src);
        self.pos += src.len();
        Ok(())
    }

    fn copy_in(&mut self, _dst: &mut [u8]) -> Result<()> {
        Err(UsbDevError::Fault)
    }
}

/// Source of a `write()`.
#[derive(Debug)]
pub struct WriteUio<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WriteUio<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn transferred(&self) -> usize {
        self.pos
    }
}

impl Uio for WriteUio<'_> {
    fn resid(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn copy_out(&mut self, _src: &[u8]) -> Result<()> {
        Err(UsbDevError::Fault)
    }

    fn copy_in(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.resid() {
            return Err(UsbDevError::Fault);
        }
        dst.copy_from_slice(&self.buf[self.pos..self.pos + dst.len()]);
        self.pos += dst.len();
        Ok(())
    }
}
