//! Decoded controller-side responses.
//!
//! Every variable-length list carried by a vendor response is a bounded
//! [`heapless::Vec`] sized to the protocol maximum; browse results use owned
//! `Vec`s since their counts are bounded by the packet itself.

use std::borrow::Cow;

use heapless::Vec as BoundedVec;

use crate::avrcp::{
   message::KeyState,
   protocol::{
      FEATURE_MASK_SIZE, MAX_APP_ATTR_SIZE, MAX_APP_SETTINGS, MAX_COMPANY_IDS, MAX_EVENT_IDS,
      PduId, PlayState, Status, UID_SIZE,
   },
};

/// Length-prefixed string as it appears on the wire, with its character set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Name {
   pub charset_id: u16,
   pub bytes: Vec<u8>,
}

impl Name {
   /// IANA MIBenum for UTF-8.
   pub const CHARSET_UTF8: u16 = 0x006A;

   pub fn to_string_lossy(&self) -> Cow<'_, str> {
      String::from_utf8_lossy(&self.bytes)
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppSetting {
   pub attr_id: u8,
   pub value: u8,
}

/// Text for a player application attribute or value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettingText {
   pub id: u8,
   pub charset_id: u16,
   pub text: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeEntry {
   pub attr_id: u32,
   pub name: Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayStatus {
   pub song_length: u32,
   pub song_position: u32,
   pub status: u8,
}

impl PlayStatus {
   pub fn state(&self) -> Option<PlayState> {
      PlayState::from_repr(self.status)
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityList {
   CompanyIds(BoundedVec<u32, MAX_COMPANY_IDS>),
   EventIds(BoundedVec<u8, MAX_EVENT_IDS>),
   /// Capability ids other than company ids and events carry no list.
   Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
   pub capability_id: u8,
   /// Count as declared by the remote, before clipping.
   pub count: u8,
   pub list: CapabilityList,
}

impl Default for Capabilities {
   fn default() -> Self {
      Self {
         capability_id: 0,
         count: 0,
         list: CapabilityList::Unsupported,
      }
   }
}

/// Payload of a `REGISTER_NOTIFICATION` response, by event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
   PlayStatus(u8),
   TrackChanged([u8; UID_SIZE]),
   PlayPosition(u32),
   AppSettings(BoundedVec<AppSetting, MAX_APP_SETTINGS>),
   AddressedPlayer { player_id: u16, uid_counter: u16 },
   Volume(u8),
   /// Events whose response carries nothing beyond the event id.
   Bare(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedResponse {
   /// Vendor frame with no payload at all.
   Empty,
   RegisterNotification(Notification),
   GetCapabilities(Capabilities),
   ListAppAttributes(BoundedVec<u8, MAX_APP_ATTR_SIZE>),
   ListAppValues(BoundedVec<u8, MAX_APP_ATTR_SIZE>),
   GetCurrentAppValues(BoundedVec<AppSetting, MAX_APP_ATTR_SIZE>),
   GetAppAttributeText(BoundedVec<AppSettingText, MAX_APP_ATTR_SIZE>),
   GetAppValueText(BoundedVec<AppSettingText, MAX_APP_ATTR_SIZE>),
   SetAppValue,
   GetElementAttributes(Vec<AttributeEntry>),
   GetPlayStatus(PlayStatus),
   SetAddressedPlayer(Status),
   SetAbsoluteVolume(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerItem {
   pub player_id: u16,
   pub major_type: u8,
   pub sub_type: u32,
   pub play_status: u8,
   pub features: [u8; FEATURE_MASK_SIZE],
   pub name: Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderItem {
   pub uid: [u8; UID_SIZE],
   pub folder_type: u8,
   pub playable: bool,
   pub name: Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaElementItem {
   pub uid: [u8; UID_SIZE],
   pub media_type: u8,
   pub name: Name,
   pub attributes: Vec<AttributeEntry>,
}

/// One entry of a `GET_FOLDER_ITEMS` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaItem {
   Player(PlayerItem),
   Folder(FolderItem),
   Media(MediaElementItem),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrowsedPlayer {
   pub status: Status,
   pub uid_counter: u16,
   pub num_items: u32,
   pub charset_id: u16,
   pub folders: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseResponse {
   GetFolderItems {
      status: Status,
      uid_counter: u16,
      items: Vec<MediaItem>,
   },
   ChangePath {
      status: Status,
      num_items: u32,
   },
   SetBrowsedPlayer(BrowsedPlayer),
}

impl BrowseResponse {
   pub const fn pdu(&self) -> PduId {
      match self {
         Self::GetFolderItems { .. } => PduId::GetFolderItems,
         Self::ChangePath { .. } => PduId::ChangePath,
         Self::SetBrowsedPlayer(_) => PduId::SetBrowsedPlayer,
      }
   }

   pub const fn status(&self) -> Status {
      match self {
         Self::GetFolderItems { status, .. } | Self::ChangePath { status, .. } => *status,
         Self::SetBrowsedPlayer(player) => player.status,
      }
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorResponse {
   pub ctype: u8,
   /// `None` only for [`ParsedResponse::Empty`].
   pub pdu: Option<PduId>,
   pub params: ParsedResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassThroughResponse {
   pub ctype: u8,
   pub op_id: u8,
   pub state: KeyState,
   pub data: Vec<u8>,
}

/// A successfully parsed response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
   Vendor(VendorResponse),
   Browse(BrowseResponse),
   PassThrough(PassThroughResponse),
}

impl Response {
   /// Status reported by the remote inside an otherwise well-formed response.
   pub const fn status(&self) -> Status {
      match self {
         Self::Vendor(VendorResponse {
            params: ParsedResponse::SetAddressedPlayer(status),
            ..
         }) => *status,
         Self::Browse(browse) => browse.status(),
         _ => Status::NO_ERROR,
      }
   }
}
