//! Bounded big-endian reader over an immutable byte slice.

use thiserror::Error;

/// A read ran past the end of the slice.
///
/// `needed` is the total number of bytes the read required from the start of
/// the slice, `available` the slice length.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("read needs {needed} bytes, only {available} available")]
pub struct CursorError {
   pub needed: usize,
   pub available: usize,
}

#[derive(Debug, Clone)]
pub struct Cursor<'a> {
   buf: &'a [u8],
   pos: usize,
}

impl<'a> Cursor<'a> {
   pub const fn new(buf: &'a [u8]) -> Self {
      Self { buf, pos: 0 }
   }

   pub const fn position(&self) -> usize {
      self.pos
   }

   pub const fn remaining(&self) -> usize {
      self.buf.len() - self.pos
   }

   pub const fn is_empty(&self) -> bool {
      self.remaining() == 0
   }

   /// Fails unless `n` more bytes are available, without consuming them.
   pub const fn require(&self, n: usize) -> Result<(), CursorError> {
      if self.remaining() < n {
         Err(CursorError {
            needed: self.pos + n,
            available: self.buf.len(),
         })
      } else {
         Ok(())
      }
   }

   pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], CursorError> {
      self.require(n)?;
      let out = &self.buf[self.pos..self.pos + n];
      self.pos += n;
      Ok(out)
   }

   pub fn skip(&mut self, n: usize) -> Result<(), CursorError> {
      self.bytes(n).map(|_| ())
   }

   pub fn array<const N: usize>(&mut self) -> Result<[u8; N], CursorError> {
      let mut out = [0u8; N];
      out.copy_from_slice(self.bytes(N)?);
      Ok(out)
   }

   pub fn read_u8(&mut self) -> Result<u8, CursorError> {
      Ok(self.bytes(1)?[0])
   }

   pub fn read_u16(&mut self) -> Result<u16, CursorError> {
      self.array().map(u16::from_be_bytes)
   }

   pub fn read_u24(&mut self) -> Result<u32, CursorError> {
      let [a, b, c] = self.array()?;
      Ok(u32::from_be_bytes([0, a, b, c]))
   }

   pub fn read_u32(&mut self) -> Result<u32, CursorError> {
      self.array().map(u32::from_be_bytes)
   }

   /// Everything not yet consumed.
   pub fn rest(&mut self) -> &'a [u8] {
      let out = &self.buf[self.pos..];
      self.pos = self.buf.len();
      out
   }
}
