//! Bluetooth device address.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

/// A 48-bit Bluetooth device address (`BD_ADDR`), most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 6]);

/// Error returned when an address string is not `XX:XX:XX:XX:XX:XX`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed Bluetooth address {0:?}")]
pub struct AddressParseError(pub String);

impl Address {
   /// Wildcard address used when listening for any peer.
   pub const ANY: Self = Self([0; 6]);

   pub const fn new(addr: [u8; 6]) -> Self {
      Self(addr)
   }

   pub const fn any() -> Self {
      Self::ANY
   }

   pub const fn as_bytes(&self) -> &[u8; 6] {
      &self.0
   }

   pub fn is_any(&self) -> bool {
      *self == Self::ANY
   }
}

impl From<[u8; 6]> for Address {
   fn from(addr: [u8; 6]) -> Self {
      Self(addr)
   }
}

impl From<Address> for [u8; 6] {
   fn from(addr: Address) -> Self {
      addr.0
   }
}

impl fmt::Display for Address {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for Address {
   type Err = AddressParseError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let err = || AddressParseError(s.to_string());
      if s.len() != 17 {
         return Err(err());
      }

      let mut bytes = [0u8; 6];
      let mut parts = s.split(':');
      for byte in &mut bytes {
         let part = parts.next().ok_or_else(err)?;
         if part.len() != 2 {
            return Err(err());
         }
         *byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
      }
      if parts.next().is_some() {
         return Err(err());
      }
      Ok(Self(bytes))
   }
}

impl Serialize for Address {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for Address {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = String::deserialize(deserializer)?;
      s.parse().map_err(de::Error::custom)
   }
}
