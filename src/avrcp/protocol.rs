//! AVRCP protocol definitions.
//!
//! Opcodes, command/response types, PDU and event identifiers and the status
//! codes exchanged with the remote target, plus the fixed limits the parser
//! clips variable-length arrays to.

use std::fmt;

/// AV/C opcodes carried in the third header byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
pub enum Opcode {
   Vendor = 0x00,
   UnitInfo = 0x30,
   SubunitInfo = 0x31,
   PassThrough = 0x7C,
   Browse = 0xFF,
}

/// AV/C command and response types (`ctype`).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum CType {
   Control = 0x00,
   Status = 0x01,
   SpecificInquiry = 0x02,
   Notify = 0x03,
   GeneralInquiry = 0x04,
   NotImplemented = 0x08,
   Accepted = 0x09,
   Rejected = 0x0A,
   InTransition = 0x0B,
   Stable = 0x0C,
   Changed = 0x0D,
   Interim = 0x0F,
}

impl CType {
   pub const fn is_response(self) -> bool {
      self as u8 >= Self::NotImplemented as u8
   }
}

/// Metadata and browsing PDU identifiers handled by the controller.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
pub enum PduId {
   GetCapabilities = 0x10,
   ListPlayerAppAttr = 0x11,
   ListPlayerAppValues = 0x12,
   GetCurPlayerAppValue = 0x13,
   SetPlayerAppValue = 0x14,
   GetPlayerAppAttrText = 0x15,
   GetPlayerAppValueText = 0x16,
   GetElementAttr = 0x20,
   GetPlayStatus = 0x30,
   RegisterNotification = 0x31,
   RequestContinuation = 0x40,
   AbortContinuation = 0x41,
   SetAbsoluteVolume = 0x50,
   SetAddressedPlayer = 0x60,
   SetBrowsedPlayer = 0x70,
   GetFolderItems = 0x71,
   ChangePath = 0x72,
}

/// Notification event identifiers (`REGISTER_NOTIFICATION`).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
pub enum EventId {
   PlayStatusChanged = 0x01,
   TrackChanged = 0x02,
   TrackReachedEnd = 0x03,
   TrackReachedStart = 0x04,
   PlayPosChanged = 0x05,
   BatteryStatusChanged = 0x06,
   SystemStatusChanged = 0x07,
   AppSettingChanged = 0x08,
   NowPlayingChanged = 0x09,
   AvailablePlayersChanged = 0x0A,
   AddressedPlayerChanged = 0x0B,
   UidsChanged = 0x0C,
   VolumeChanged = 0x0D,
}

/// Capability identifiers for `GET_CAPABILITIES`.
pub mod capability {
   pub const COMPANY_ID: u8 = 0x02;
   pub const EVENTS_SUPPORTED: u8 = 0x03;
}

/// Browsable item types inside a `GET_FOLDER_ITEMS` response.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum ItemType {
   Player = 0x01,
   Folder = 0x02,
   Media = 0x03,
}

/// Play status reported by `GET_PLAY_STATUS` and play-status notifications.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum PlayState {
   Stopped = 0x00,
   Playing = 0x01,
   Paused = 0x02,
   FwdSeek = 0x03,
   RevSeek = 0x04,
   Error = 0xFF,
}

/// AVRCP status code.
///
/// Remote targets may report values this side does not know about, so this
/// stays an open newtype rather than an enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Status(u8);

impl Status {
   pub const BAD_CMD: Self = Self(0x00);
   pub const BAD_PARAM: Self = Self(0x01);
   pub const NOT_FOUND: Self = Self(0x02);
   pub const INTERNAL_ERROR: Self = Self(0x03);
   pub const NO_ERROR: Self = Self(0x04);
   pub const UID_CHANGED: Self = Self(0x05);
   pub const BAD_DIRECTION: Self = Self(0x07);
   pub const NOT_A_DIRECTORY: Self = Self(0x08);
   pub const DOES_NOT_EXIST: Self = Self(0x09);
   pub const BAD_RANGE: Self = Self(0x0B);
   pub const PLAYER_NOT_BROWSABLE: Self = Self(0x12);
   pub const NO_AVAILABLE_PLAYERS: Self = Self(0x15);
   pub const ADDRESSED_PLAYER_CHANGED: Self = Self(0x16);

   pub const fn from_raw(raw: u8) -> Self {
      Self(raw)
   }

   pub const fn raw(self) -> u8 {
      self.0
   }

   pub const fn is_ok(self) -> bool {
      self.0 == Self::NO_ERROR.0
   }

   pub fn try_to_str(self) -> Option<&'static str> {
      Some(match self {
         Self::BAD_CMD => "bad_cmd",
         Self::BAD_PARAM => "bad_param",
         Self::NOT_FOUND => "not_found",
         Self::INTERNAL_ERROR => "internal_error",
         Self::NO_ERROR => "no_error",
         Self::UID_CHANGED => "uid_changed",
         Self::BAD_DIRECTION => "bad_direction",
         Self::NOT_A_DIRECTORY => "not_a_directory",
         Self::DOES_NOT_EXIST => "does_not_exist",
         Self::BAD_RANGE => "bad_range",
         Self::PLAYER_NOT_BROWSABLE => "player_not_browsable",
         Self::NO_AVAILABLE_PLAYERS => "no_available_players",
         Self::ADDRESSED_PLAYER_CHANGED => "addressed_player_changed",
         _ => return None,
      })
   }
}

impl fmt::Display for Status {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.try_to_str() {
         Some(name) => f.write_str(name),
         None => write!(f, "0x{:02x}", self.0),
      }
   }
}

/// Bluetooth SIG company identifier used in vendor-dependent frames.
pub const COMPANY_ID_BT_SIG: u32 = 0x00_1958;

/// Panel subunit type.
pub const SUBUNIT_PANEL: u8 = 0x09;

/// Size of the vendor PDU header: PDU id, packet type, parameter length.
pub const VENDOR_PDU_HEADER_LEN: usize = 4;

/// Size of the browse PDU header: PDU id, parameter length.
pub const BROWSE_PDU_HEADER_LEN: usize = 3;

/// AVCTP single-packet header size subtracted from negotiated MTUs.
pub const AVCT_HDR_LEN_SINGLE: u16 = 3;

/// Maximum app settings carried by an app-setting-changed notification.
pub const MAX_APP_SETTINGS: usize = 8;
/// Maximum player application attributes or values in a single response.
pub const MAX_APP_ATTR_SIZE: usize = 16;
/// Maximum company ids kept from `GET_CAPABILITIES`.
pub const MAX_COMPANY_IDS: usize = 4;
/// Maximum event ids kept from `GET_CAPABILITIES`.
pub const MAX_EVENT_IDS: usize = 16;

/// Length of a media element or folder UID.
pub const UID_SIZE: usize = 8;
/// Length of the feature bit mask in a media player item.
pub const FEATURE_MASK_SIZE: usize = 16;
