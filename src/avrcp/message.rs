//! AV/C message model and conversion to and from [`Packet`]s.
//!
//! Frames arrive from the transport as an [`AvrcMessage`], one variant per
//! opcode. [`AvrcMessage::to_packet`] re-serializes the AV/C header and the
//! opcode-specific fields so the parser and the transport only ever deal with
//! byte windows.

use log::error;
use thiserror::Error;

use crate::avrcp::{
   cursor::{Cursor, CursorError},
   packet::{Packet, PacketBytes},
   protocol::{
      COMPANY_ID_BT_SIG, CType, EventId, Opcode, PduId, SUBUNIT_PANEL, VENDOR_PDU_HEADER_LEN,
   },
};

/// Error raised when a byte window cannot be read back as an AV/C frame.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
   #[error("truncated AV/C frame: {0}")]
   Truncated(#[from] CursorError),

   #[error("frame opcode 0x{found:02x} does not match expected 0x{expected:02x}")]
   OpcodeMismatch { expected: u8, found: u8 },
}

/// The three bytes common to every AV/C frame besides the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvcHeader {
   pub ctype: u8,
   pub subunit_type: u8,
   pub subunit_id: u8,
}

impl AvcHeader {
   pub const fn new(ctype: CType) -> Self {
      Self {
         ctype: ctype as u8,
         subunit_type: SUBUNIT_PANEL,
         subunit_id: 0,
      }
   }

   pub fn kind(&self) -> Option<CType> {
      CType::from_repr(self.ctype)
   }

   pub const fn subunit_byte(&self) -> u8 {
      (self.subunit_type << 3) | (self.subunit_id & 0x07)
   }

   fn read(cur: &mut Cursor<'_>) -> Result<(Self, u8), CursorError> {
      let ctype = cur.read_u8()? & 0x0F;
      let subunit = cur.read_u8()?;
      let opcode = cur.read_u8()?;
      let header = Self {
         ctype,
         subunit_type: subunit >> 3,
         subunit_id: subunit & 0x07,
      };
      Ok((header, opcode))
   }
}

/// Pass-through button state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum KeyState {
   Pressed = 0,
   Released = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorMessage {
   pub header: AvcHeader,
   pub company_id: u32,
   pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassThroughMessage {
   pub header: AvcHeader,
   pub op_id: u8,
   pub state: KeyState,
   pub data: Vec<u8>,
}

/// Browse frames carry no AV/C header; `data` starts at the PDU id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseMessage {
   pub ctype: u8,
   pub data: Vec<u8>,
}

/// A legacy AV/C message, discriminated by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvrcMessage {
   Vendor(VendorMessage),
   PassThrough(PassThroughMessage),
   Browse(BrowseMessage),
   /// Any opcode this layer does not convert (unit info, subunit info, ...).
   Other { header: AvcHeader, opcode: u8 },
}

impl AvrcMessage {
   pub fn opcode(&self) -> u8 {
      match self {
         Self::Vendor(_) => Opcode::Vendor as u8,
         Self::PassThrough(_) => Opcode::PassThrough as u8,
         Self::Browse(_) => Opcode::Browse as u8,
         Self::Other { opcode, .. } => *opcode,
      }
   }

   pub const fn is_browse(&self) -> bool {
      matches!(self, Self::Browse(_))
   }

   pub fn ctype(&self) -> u8 {
      match self {
         Self::Vendor(msg) => msg.header.ctype,
         Self::PassThrough(msg) => msg.header.ctype,
         Self::Browse(msg) => msg.ctype,
         Self::Other { header, .. } => header.ctype,
      }
   }

   /// Serializes the message into a packet.
   ///
   /// Opcodes without a conversion yield an empty packet.
   pub fn to_packet(&self) -> Packet {
      match self {
         Self::Vendor(msg) => {
            let mut out = PacketBytes::with_capacity(6 + msg.data.len());
            out.push(msg.header.ctype);
            out.push(msg.header.subunit_byte());
            out.push(Opcode::Vendor as u8);
            out.extend_from_slice(&msg.company_id.to_be_bytes()[1..]);
            out.extend_from_slice(&msg.data);
            Packet::make(out)
         },
         Self::PassThrough(msg) => {
            let mut out = PacketBytes::with_capacity(5 + msg.data.len());
            out.push(msg.header.ctype);
            out.push(msg.header.subunit_byte());
            out.push(Opcode::PassThrough as u8);
            out.push(((msg.state as u8) << 7) | (msg.op_id & 0x7F));
            out.push(u8::try_from(msg.data.len()).unwrap_or(u8::MAX));
            out.extend_from_slice(&msg.data[..msg.data.len().min(u8::MAX as usize)]);
            Packet::make(out)
         },
         Self::Browse(msg) => Packet::from_slice(&msg.data),
         Self::Other { opcode, .. } => {
            error!("Cannot convert message with opcode 0x{opcode:02x} to a packet");
            Packet::empty()
         },
      }
   }

   /// Reads a packet produced by [`AvrcMessage::to_packet`] back into a message.
   ///
   /// `opcode` tells the browse channel apart from the control channel, since
   /// browse frames carry no AV/C header.
   pub fn from_packet(opcode: Opcode, pkt: &Packet) -> Result<Self, FrameError> {
      if opcode == Opcode::Browse {
         return Ok(Self::Browse(BrowseMessage {
            ctype: CType::Stable as u8,
            data: pkt.data().to_vec(),
         }));
      }

      let mut cur = Cursor::new(pkt.data());
      let (header, found) = AvcHeader::read(&mut cur)?;
      if found != opcode as u8 {
         return Err(FrameError::OpcodeMismatch {
            expected: opcode as u8,
            found,
         });
      }

      Ok(match opcode {
         Opcode::Vendor => {
            let company_id = cur.read_u24()?;
            Self::Vendor(VendorMessage {
               header,
               company_id,
               data: cur.rest().to_vec(),
            })
         },
         Opcode::PassThrough => {
            let op = cur.read_u8()?;
            let len = cur.read_u8()? as usize;
            let data = cur.bytes(len)?.to_vec();
            Self::PassThrough(PassThroughMessage {
               header,
               op_id: op & 0x7F,
               state: if op & 0x80 != 0 {
                  KeyState::Released
               } else {
                  KeyState::Pressed
               },
               data,
            })
         },
         _ => Self::Other {
            header,
            opcode: found,
         },
      })
   }

   /// Builds the controller command registering for `event` notifications.
   pub fn register_notification(event: EventId, interval: u32) -> Self {
      let mut data = Vec::with_capacity(VENDOR_PDU_HEADER_LEN + 5);
      data.push(PduId::RegisterNotification as u8);
      data.push(0x00);
      data.extend_from_slice(&5u16.to_be_bytes());
      data.push(event as u8);
      data.extend_from_slice(&interval.to_be_bytes());
      Self::Vendor(VendorMessage {
         header: AvcHeader::new(CType::Notify),
         company_id: COMPANY_ID_BT_SIG,
         data,
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn vendor(ctype: CType, data: &[u8]) -> AvrcMessage {
      AvrcMessage::Vendor(VendorMessage {
         header: AvcHeader::new(ctype),
         company_id: COMPANY_ID_BT_SIG,
         data: data.to_vec(),
      })
   }

   #[test]
   fn test_vendor_header_is_reserialized() {
      let pkt = vendor(CType::Stable, &[0x30, 0x00, 0x00, 0x00]).to_packet();
      assert_eq!(
         pkt.data(),
         &[0x0C, 0x48, 0x00, 0x00, 0x19, 0x58, 0x30, 0x00, 0x00, 0x00]
      );
   }

   #[test]
   fn test_pass_through_layout() {
      let msg = AvrcMessage::PassThrough(PassThroughMessage {
         header: AvcHeader::new(CType::Accepted),
         op_id: 0x44,
         state: KeyState::Released,
         data: vec![],
      });
      assert_eq!(msg.to_packet().data(), &[0x09, 0x48, 0x7C, 0xC4, 0x00]);
   }

   #[test]
   fn test_browse_is_raw() {
      let msg = AvrcMessage::Browse(BrowseMessage {
         ctype: CType::Stable as u8,
         data: vec![0x72, 0x00, 0x05, 0x04, 0, 0, 0, 9],
      });
      assert_eq!(msg.to_packet().data(), &[0x72, 0x00, 0x05, 0x04, 0, 0, 0, 9]);
      assert!(msg.is_browse());
   }

   #[test]
   fn test_unknown_opcode_yields_empty_packet() {
      let msg = AvrcMessage::Other {
         header: AvcHeader::new(CType::Status),
         opcode: Opcode::UnitInfo as u8,
      };
      assert!(msg.to_packet().is_empty());
      assert_eq!(msg.opcode(), 0x30);
   }

   #[test]
   fn test_from_packet_inverts_vendor_and_pass_through() {
      let msg = vendor(CType::Interim, &[0x31, 0x00, 0x00, 0x02, 0x0D, 0x40]);
      let back = AvrcMessage::from_packet(Opcode::Vendor, &msg.to_packet()).unwrap();
      assert_eq!(back, msg);

      let pass = AvrcMessage::PassThrough(PassThroughMessage {
         header: AvcHeader::new(CType::Accepted),
         op_id: 0x46,
         state: KeyState::Pressed,
         data: vec![1, 2],
      });
      let back = AvrcMessage::from_packet(Opcode::PassThrough, &pass.to_packet()).unwrap();
      assert_eq!(back, pass);
   }

   #[test]
   fn test_from_packet_rejects_bad_frames() {
      let pkt = Packet::from_slice(&[0x0C, 0x48]);
      assert!(matches!(
         AvrcMessage::from_packet(Opcode::Vendor, &pkt),
         Err(FrameError::Truncated(_))
      ));

      let pkt = Packet::from_slice(&[0x0C, 0x48, 0x7C, 0x44, 0x00]);
      assert_eq!(
         AvrcMessage::from_packet(Opcode::Vendor, &pkt),
         Err(FrameError::OpcodeMismatch {
            expected: 0x00,
            found: 0x7C
         })
      );
   }

   #[test]
   fn test_register_notification_command() {
      let msg = AvrcMessage::register_notification(EventId::VolumeChanged, 0);
      assert_eq!(
         msg.to_packet().data(),
         &[0x03, 0x48, 0x00, 0x00, 0x19, 0x58, 0x31, 0x00, 0x00, 0x05, 0x0D, 0, 0, 0, 0]
      );
   }
}
