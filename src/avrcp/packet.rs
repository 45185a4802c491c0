//! Immutable byte buffer with a `[start, end)` payload window.
//!
//! Packets are what the message adapter hands to the parser and to the
//! transport. Cloning and narrowing share the backing storage.

use std::{fmt, ops::Range, slice, sync::Arc};

use smallvec::SmallVec;

/// Inline capacity of the backing storage; control frames rarely exceed it.
pub const INLINE_CAPACITY: usize = 64;

pub type PacketBytes = SmallVec<[u8; INLINE_CAPACITY]>;

#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
   bytes: Arc<PacketBytes>,
   start: usize,
   end: usize,
}

impl Packet {
   /// Wraps `bytes` with a window covering all of it.
   pub fn make(bytes: impl Into<PacketBytes>) -> Self {
      let bytes = bytes.into();
      let end = bytes.len();
      Self {
         bytes: Arc::new(bytes),
         start: 0,
         end,
      }
   }

   /// Wraps `bytes` with an explicit window.
   ///
   /// The window is not validated here; [`Packet::is_valid`] reports whether it
   /// fits, and [`Packet::data`] yields an empty slice when it does not.
   pub fn with_window(bytes: impl Into<PacketBytes>, start: usize, end: usize) -> Self {
      Self {
         bytes: Arc::new(bytes.into()),
         start,
         end,
      }
   }

   pub fn empty() -> Self {
      Self::make(PacketBytes::new())
   }

   pub fn from_slice(data: &[u8]) -> Self {
      Self::make(PacketBytes::from_slice(data))
   }

   pub fn is_valid(&self) -> bool {
      self.start <= self.end && self.end <= self.bytes.len()
   }

   pub fn data(&self) -> &[u8] {
      if self.is_valid() {
         &self.bytes[self.start..self.end]
      } else {
         &[]
      }
   }

   pub fn len(&self) -> usize {
      self.data().len()
   }

   pub fn is_empty(&self) -> bool {
      self.data().is_empty()
   }

   pub fn window(&self) -> Range<usize> {
      self.start..self.end
   }

   pub fn iter(&self) -> slice::Iter<'_, u8> {
      self.data().iter()
   }

   /// Returns a view of `[start, end)` relative to the current window.
   ///
   /// Out-of-range bounds produce an invalid (and therefore empty) packet
   /// rather than a panic.
   pub fn specialize(&self, start: usize, end: usize) -> Self {
      let (start, end) = match (self.start.checked_add(start), self.start.checked_add(end)) {
         (Some(s), Some(e)) if end <= self.len() && start <= end => (s, e),
         _ => (usize::MAX, 0),
      };
      Self {
         bytes: Arc::clone(&self.bytes),
         start,
         end,
      }
   }
}

impl Default for Packet {
   fn default() -> Self {
      Self::empty()
   }
}

impl fmt::Debug for Packet {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Packet")
         .field("window", &self.window())
         .field("data", &hex::encode(self.data()))
         .finish()
   }
}

impl AsRef<[u8]> for Packet {
   fn as_ref(&self) -> &[u8] {
      self.data()
   }
}

impl<'a> IntoIterator for &'a Packet {
   type Item = &'a u8;
   type IntoIter = slice::Iter<'a, u8>;

   fn into_iter(self) -> Self::IntoIter {
      self.iter()
   }
}

impl From<&[u8]> for Packet {
   fn from(data: &[u8]) -> Self {
      Self::from_slice(data)
   }
}

impl From<Vec<u8>> for Packet {
   fn from(data: Vec<u8>) -> Self {
      Self::make(data)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_make_covers_everything() {
      let pkt = Packet::from_slice(&[1, 2, 3, 4]);
      assert!(pkt.is_valid());
      assert_eq!(pkt.len(), 4);
      assert_eq!(pkt.data(), &[1, 2, 3, 4]);
      assert_eq!(pkt.iter().copied().sum::<u8>(), 10);
   }

   #[test]
   fn test_window_and_specialize_share_bytes() {
      let pkt = Packet::with_window(vec![0xAA, 1, 2, 3, 4, 0xBB], 1, 5);
      assert_eq!(pkt.data(), &[1, 2, 3, 4]);

      let inner = pkt.specialize(1, 3);
      assert_eq!(inner.data(), &[2, 3]);
      assert_eq!(inner.window(), 2..4);
      // narrowing leaves the original untouched
      assert_eq!(pkt.data(), &[1, 2, 3, 4]);

      let collected: Vec<u8> = (&inner).into_iter().copied().collect();
      assert_eq!(collected, vec![2, 3]);
   }

   #[test]
   fn test_invalid_windows_are_empty() {
      let pkt = Packet::with_window(vec![1, 2, 3], 2, 5);
      assert!(!pkt.is_valid());
      assert!(pkt.is_empty());

      let reversed = Packet::with_window(vec![1, 2, 3], 2, 1);
      assert!(!reversed.is_valid());

      let ok = Packet::from_slice(&[1, 2, 3]);
      assert!(!ok.specialize(1, 9).is_valid());
      assert!(!ok.specialize(2, 1).is_valid());
      assert!(ok.specialize(3, 3).is_valid());
   }
}
