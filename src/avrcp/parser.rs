//! Controller-side response and browse parser.
//!
//! Pure functions over immutable byte windows. Every field read goes through a
//! [`Cursor`] bounded to the declared parameter length, so a decoder can never
//! consume more than the remote said it sent. Lists are built locally and only
//! attached to the result once the whole PDU decoded.

use log::{debug, warn};
use thiserror::Error;

use crate::avrcp::{
   cursor::{Cursor, CursorError},
   message::{AvrcMessage, BrowseMessage, FrameError, PassThroughMessage, VendorMessage},
   packet::Packet,
   protocol::{
      BROWSE_PDU_HEADER_LEN, CType, EventId, FEATURE_MASK_SIZE, ItemType, Opcode, PduId, Status,
      UID_SIZE, VENDOR_PDU_HEADER_LEN, capability,
   },
   response::{
      AppSetting, AppSettingText, AttributeEntry, BrowseResponse, BrowsedPlayer, Capabilities,
      CapabilityList, FolderItem, MediaElementItem, MediaItem, Name, Notification,
      ParsedResponse, PassThroughResponse, PlayStatus, PlayerItem, Response, VendorResponse,
   },
};

/// Error type for response parsing.
///
/// Every variant maps onto an AVRCP status through [`ParseError::status`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
   /// Vendor payload cannot even hold the PDU header
   #[error("Vendor payload too short: {0} bytes, need at least 4")]
   TooShort(usize),

   /// Frame shorter than the length its own header declares
   #[error("Frame truncated: expected at least {needed} bytes, got {available}")]
   Truncated { available: usize, needed: usize },

   /// A vendor PDU field ran past the declared parameter length
   #[error("Invalid parameter length {len}: must be at least {needed}")]
   ParamLength { len: usize, needed: usize },

   /// A browse PDU field ran past the declared packet length
   #[error("Invalid browse packet length {len}: must be at least {needed}")]
   BrowseLength { len: usize, needed: usize },

   /// Browse frame shorter than its 3-byte header
   #[error("Malformed browse frame of {0} bytes")]
   BadFrame(usize),

   /// PDU with a fixed parameter length carried something else
   #[error("Invalid parameter length {len} for {pdu}")]
   InvalidLength { pdu: PduId, len: usize },

   #[error("Unsupported PDU: 0x{0:02x}")]
   UnsupportedPdu(u8),

   #[error("Unsupported opcode: 0x{0:02x}")]
   UnsupportedOpcode(u8),

   #[error("Unknown folder item type: 0x{0:02x}")]
   UnknownItemType(u8),

   #[error("Malformed frame: {0}")]
   Frame(#[from] FrameError),

   /// Remote answered REJECTED with this status
   #[error("Command rejected by remote: {0}")]
   Rejected(Status),

   /// Remote reported a failure status inside the response body
   #[error("Remote reported {status} for {pdu}")]
   Remote { pdu: PduId, status: Status },
}

impl ParseError {
   /// AVRCP status code reported to the upper layer for this failure.
   pub const fn status(&self) -> Status {
      match self {
         Self::TooShort(_) | Self::Truncated { .. } | Self::ParamLength { .. } => {
            Status::INTERNAL_ERROR
         },
         Self::UnknownItemType(_) => Status::INTERNAL_ERROR,
         Self::InvalidLength {
            pdu: PduId::SetAddressedPlayer,
            ..
         } => Status::BAD_CMD,
         Self::InvalidLength { .. } => Status::INTERNAL_ERROR,
         Self::BrowseLength { .. } | Self::UnsupportedPdu(_) | Self::UnsupportedOpcode(_) => {
            Status::BAD_CMD
         },
         Self::BadFrame(_) | Self::Frame(_) => Status::BAD_PARAM,
         Self::Rejected(status) | Self::Remote { status, .. } => *status,
      }
   }

   const fn param(e: CursorError) -> Self {
      Self::ParamLength {
         len: e.available,
         needed: e.needed,
      }
   }

   const fn browse(e: CursorError) -> Self {
      Self::BrowseLength {
         len: e.available,
         needed: e.needed,
      }
   }
}

/// Parses a response message received by the controller.
pub fn parse_response(msg: &AvrcMessage) -> Result<Response, ParseError> {
   let result = match msg {
      AvrcMessage::Vendor(vendor) => parse_vendor(vendor).map(Response::Vendor),
      AvrcMessage::Browse(browse) => parse_browse(browse).map(Response::Browse),
      AvrcMessage::PassThrough(pass) => Ok(Response::PassThrough(parse_pass_through(pass))),
      AvrcMessage::Other { opcode, .. } => Err(ParseError::UnsupportedOpcode(*opcode)),
   };
   if let Err(e) = &result {
      warn!("Failed to parse response (opcode 0x{:02x}): {e}", msg.opcode());
   }
   result
}

/// Parses a packet produced by the message adapter.
pub fn parse_packet(opcode: Opcode, pkt: &Packet) -> Result<Response, ParseError> {
   let msg = AvrcMessage::from_packet(opcode, pkt).inspect_err(|e| {
      warn!("Dropping malformed {opcode} frame {}: {e}", hex::encode(pkt.data()));
   })?;
   parse_response(&msg)
}

/// Decodes the parameters of a `REGISTER_NOTIFICATION` response.
pub fn decode_notification(params: &[u8]) -> Result<Notification, ParseError> {
   read_notification(&mut Cursor::new(params)).map_err(ParseError::param)
}

fn parse_pass_through(msg: &PassThroughMessage) -> PassThroughResponse {
   PassThroughResponse {
      ctype: msg.header.ctype,
      op_id: msg.op_id,
      state: msg.state,
      data: msg.data.clone(),
   }
}

// === Vendor responses ===

fn parse_vendor(msg: &VendorMessage) -> Result<VendorResponse, ParseError> {
   let ctype = msg.header.ctype;
   let data = msg.data.as_slice();
   if data.is_empty() {
      return Ok(VendorResponse {
         ctype,
         pdu: None,
         params: ParsedResponse::Empty,
      });
   }
   if data.len() < VENDOR_PDU_HEADER_LEN {
      return Err(ParseError::TooShort(data.len()));
   }

   // PDU id, packet type, parameter length
   let pdu_raw = data[0];
   let len = usize::from(u16::from_be_bytes([data[2], data[3]]));
   debug!(
      "Vendor response ctype:0x{ctype:02x} pdu:0x{pdu_raw:02x} len:{len} vendor_len:{}",
      data.len()
   );
   if data.len() < len + VENDOR_PDU_HEADER_LEN {
      return Err(ParseError::Truncated {
         available: data.len(),
         needed: len + VENDOR_PDU_HEADER_LEN,
      });
   }
   let params = &data[VENDOR_PDU_HEADER_LEN..VENDOR_PDU_HEADER_LEN + len];

   if ctype == CType::Rejected as u8 {
      let Some(&status) = params.first() else {
         return Err(ParseError::ParamLength { len, needed: 1 });
      };
      return Err(ParseError::Rejected(Status::from_raw(status)));
   }

   let pdu = PduId::from_repr(pdu_raw).ok_or(ParseError::UnsupportedPdu(pdu_raw))?;
   let params = decode_vendor_params(pdu, params)?;
   Ok(VendorResponse {
      ctype,
      pdu: Some(pdu),
      params,
   })
}

fn decode_vendor_params(pdu: PduId, params: &[u8]) -> Result<ParsedResponse, ParseError> {
   let len = params.len();
   let mut cur = Cursor::new(params);
   let parsed = match pdu {
      PduId::RegisterNotification => {
         read_notification(&mut cur).map(ParsedResponse::RegisterNotification)
      },
      PduId::GetCapabilities => read_capabilities(&mut cur).map(ParsedResponse::GetCapabilities),
      PduId::ListPlayerAppAttr => {
         read_counted(&mut cur, |c| c.read_u8()).map(ParsedResponse::ListAppAttributes)
      },
      PduId::ListPlayerAppValues => {
         read_counted(&mut cur, |c| c.read_u8()).map(ParsedResponse::ListAppValues)
      },
      PduId::GetCurPlayerAppValue => {
         read_counted(&mut cur, read_app_setting).map(ParsedResponse::GetCurrentAppValues)
      },
      PduId::GetPlayerAppAttrText => {
         read_counted(&mut cur, read_setting_text).map(ParsedResponse::GetAppAttributeText)
      },
      PduId::GetPlayerAppValueText => {
         read_counted(&mut cur, read_setting_text).map(ParsedResponse::GetAppValueText)
      },
      PduId::SetPlayerAppValue => Ok(ParsedResponse::SetAppValue),
      PduId::GetElementAttr => read_element_attrs(&mut cur).map(ParsedResponse::GetElementAttributes),
      PduId::GetPlayStatus => read_play_status(&mut cur).map(ParsedResponse::GetPlayStatus),
      PduId::SetAbsoluteVolume => {
         if len != 1 {
            return Err(ParseError::InvalidLength { pdu, len });
         }
         cur.read_u8().map(ParsedResponse::SetAbsoluteVolume)
      },
      PduId::SetAddressedPlayer => {
         if len != 1 {
            return Err(ParseError::InvalidLength { pdu, len });
         }
         cur.read_u8()
            .map(|status| ParsedResponse::SetAddressedPlayer(Status::from_raw(status)))
      },
      _ => return Err(ParseError::UnsupportedPdu(pdu as u8)),
   };
   parsed.map_err(ParseError::param)
}

/// Reads a one-byte count followed by that many entries, keeping at most `N`.
///
/// An empty parameter block yields an empty list.
fn read_counted<T, const N: usize>(
   cur: &mut Cursor<'_>,
   read: impl Fn(&mut Cursor<'_>) -> Result<T, CursorError>,
) -> Result<heapless::Vec<T, N>, CursorError> {
   let mut out = heapless::Vec::new();
   if cur.is_empty() {
      return Ok(out);
   }
   let declared = cur.read_u8()?;
   for _ in 0..usize::from(declared).min(N) {
      if out.push(read(cur)?).is_err() {
         break;
      }
   }
   Ok(out)
}

fn read_app_setting(cur: &mut Cursor<'_>) -> Result<AppSetting, CursorError> {
   Ok(AppSetting {
      attr_id: cur.read_u8()?,
      value: cur.read_u8()?,
   })
}

fn read_setting_text(cur: &mut Cursor<'_>) -> Result<AppSettingText, CursorError> {
   let id = cur.read_u8()?;
   let charset_id = cur.read_u16()?;
   let len = cur.read_u8()?;
   Ok(AppSettingText {
      id,
      charset_id,
      text: cur.bytes(usize::from(len))?.to_vec(),
   })
}

fn read_name(cur: &mut Cursor<'_>) -> Result<Name, CursorError> {
   let charset_id = cur.read_u16()?;
   let len = cur.read_u16()?;
   Ok(Name {
      charset_id,
      bytes: cur.bytes(usize::from(len))?.to_vec(),
   })
}

fn read_attribute(cur: &mut Cursor<'_>) -> Result<AttributeEntry, CursorError> {
   let attr_id = cur.read_u32()?;
   Ok(AttributeEntry {
      attr_id,
      name: read_name(cur)?,
   })
}

fn read_capabilities(cur: &mut Cursor<'_>) -> Result<Capabilities, CursorError> {
   if cur.is_empty() {
      return Ok(Capabilities::default());
   }
   let capability_id = cur.read_u8()?;
   let count = cur.read_u8()?;
   let list = match capability_id {
      capability::COMPANY_ID => {
         let mut ids = heapless::Vec::new();
         for _ in 0..usize::from(count).min(ids.capacity()) {
            if ids.push(cur.read_u24()?).is_err() {
               break;
            }
         }
         CapabilityList::CompanyIds(ids)
      },
      capability::EVENTS_SUPPORTED => {
         let mut ids = heapless::Vec::new();
         for _ in 0..usize::from(count).min(ids.capacity()) {
            if ids.push(cur.read_u8()?).is_err() {
               break;
            }
         }
         CapabilityList::EventIds(ids)
      },
      _ => CapabilityList::Unsupported,
   };
   Ok(Capabilities {
      capability_id,
      count,
      list,
   })
}

fn read_element_attrs(cur: &mut Cursor<'_>) -> Result<Vec<AttributeEntry>, CursorError> {
   if cur.is_empty() {
      return Ok(Vec::new());
   }
   let count = usize::from(cur.read_u8()?);
   // each entry is at least 8 bytes
   let mut attrs = Vec::with_capacity(count.min(cur.remaining() / 8));
   for _ in 0..count {
      attrs.push(read_attribute(cur)?);
   }
   Ok(attrs)
}

fn read_play_status(cur: &mut Cursor<'_>) -> Result<PlayStatus, CursorError> {
   if cur.is_empty() {
      return Ok(PlayStatus::default());
   }
   Ok(PlayStatus {
      song_length: cur.read_u32()?,
      song_position: cur.read_u32()?,
      status: cur.read_u8()?,
   })
}

fn read_notification(cur: &mut Cursor<'_>) -> Result<Notification, CursorError> {
   let event = cur.read_u8()?;
   Ok(match EventId::from_repr(event) {
      Some(EventId::PlayStatusChanged) => Notification::PlayStatus(cur.read_u8()?),
      Some(EventId::TrackChanged) => Notification::TrackChanged(cur.array()?),
      Some(EventId::PlayPosChanged) => Notification::PlayPosition(cur.read_u32()?),
      Some(EventId::AppSettingChanged) => {
         let declared = cur.read_u8()?;
         let mut settings = heapless::Vec::new();
         for _ in 0..usize::from(declared).min(settings.capacity()) {
            if settings.push(read_app_setting(cur)?).is_err() {
               break;
            }
         }
         Notification::AppSettings(settings)
      },
      Some(EventId::AddressedPlayerChanged) => Notification::AddressedPlayer {
         player_id: cur.read_u16()?,
         uid_counter: cur.read_u16()?,
      },
      Some(EventId::VolumeChanged) => Notification::Volume(cur.read_u8()?),
      _ => Notification::Bare(event),
   })
}

// === Browse responses ===

fn parse_browse(msg: &BrowseMessage) -> Result<BrowseResponse, ParseError> {
   let data = msg.data.as_slice();
   if data.len() < BROWSE_PDU_HEADER_LEN {
      return Err(ParseError::BadFrame(data.len()));
   }

   let pdu_raw = data[0];
   let pkt_len = usize::from(u16::from_be_bytes([data[1], data[2]]));
   debug!("Browse response pdu:0x{pdu_raw:02x} pkt_len:{pkt_len}");
   if data.len() < pkt_len + BROWSE_PDU_HEADER_LEN {
      return Err(ParseError::Truncated {
         available: data.len(),
         needed: pkt_len + BROWSE_PDU_HEADER_LEN,
      });
   }

   let mut cur = Cursor::new(&data[BROWSE_PDU_HEADER_LEN..BROWSE_PDU_HEADER_LEN + pkt_len]);
   match PduId::from_repr(pdu_raw) {
      Some(PduId::GetFolderItems) => decode_folder_items(&mut cur),
      Some(PduId::ChangePath) => {
         let status = cur.read_u8().map_err(ParseError::browse)?;
         let num_items = cur.read_u32().map_err(ParseError::browse)?;
         Ok(BrowseResponse::ChangePath {
            status: Status::from_raw(status),
            num_items,
         })
      },
      Some(PduId::SetBrowsedPlayer) => decode_browsed_player(&mut cur),
      _ => Err(ParseError::UnsupportedPdu(pdu_raw)),
   }
}

fn decode_folder_items(cur: &mut Cursor<'_>) -> Result<BrowseResponse, ParseError> {
   let status = Status::from_raw(cur.read_u8().map_err(ParseError::browse)?);
   if !status.is_ok() {
      return Err(ParseError::Remote {
         pdu: PduId::GetFolderItems,
         status,
      });
   }
   let uid_counter = cur.read_u16().map_err(ParseError::browse)?;
   let item_count = usize::from(cur.read_u16().map_err(ParseError::browse)?);
   debug!("Folder items uid_counter:{uid_counter} item_count:{item_count}");

   let mut items = Vec::with_capacity(item_count.min(cur.remaining()));
   for _ in 0..item_count {
      let raw = cur.read_u8().map_err(ParseError::browse)?;
      let item = match ItemType::from_repr(raw) {
         Some(ItemType::Player) => read_player(cur).map(MediaItem::Player),
         Some(ItemType::Folder) => read_folder(cur).map(MediaItem::Folder),
         Some(ItemType::Media) => read_media(cur).map(MediaItem::Media),
         None => return Err(ParseError::UnknownItemType(raw)),
      };
      items.push(item.map_err(ParseError::browse)?);
   }

   Ok(BrowseResponse::GetFolderItems {
      status,
      uid_counter,
      items,
   })
}

fn read_player(cur: &mut Cursor<'_>) -> Result<PlayerItem, CursorError> {
   // item length; the fields below are self-delimiting
   cur.skip(2)?;
   Ok(PlayerItem {
      player_id: cur.read_u16()?,
      major_type: cur.read_u8()?,
      sub_type: cur.read_u32()?,
      play_status: cur.read_u8()?,
      features: cur.array::<FEATURE_MASK_SIZE>()?,
      name: read_name(cur)?,
   })
}

fn read_folder(cur: &mut Cursor<'_>) -> Result<FolderItem, CursorError> {
   cur.skip(2)?;
   Ok(FolderItem {
      uid: cur.array::<UID_SIZE>()?,
      folder_type: cur.read_u8()?,
      playable: cur.read_u8()? != 0,
      name: read_name(cur)?,
   })
}

fn read_media(cur: &mut Cursor<'_>) -> Result<MediaElementItem, CursorError> {
   cur.skip(2)?;
   let uid = cur.array::<UID_SIZE>()?;
   let media_type = cur.read_u8()?;
   let name = read_name(cur)?;
   let attr_count = usize::from(cur.read_u8()?);
   let mut attributes = Vec::with_capacity(attr_count.min(cur.remaining() / 8));
   for _ in 0..attr_count {
      attributes.push(read_attribute(cur)?);
   }
   Ok(MediaElementItem {
      uid,
      media_type,
      name,
      attributes,
   })
}

fn decode_browsed_player(cur: &mut Cursor<'_>) -> Result<BrowseResponse, ParseError> {
   // status, uid counter, item count, charset, depth
   cur.require(10).map_err(ParseError::browse)?;
   let status = Status::from_raw(cur.read_u8().map_err(ParseError::browse)?);
   if !status.is_ok() {
      warn!("Set browsed player failed with {status}, not parsing further");
      return Ok(BrowseResponse::SetBrowsedPlayer(BrowsedPlayer {
         status,
         ..Default::default()
      }));
   }

   read_browsed_player(cur, status)
      .map(BrowseResponse::SetBrowsedPlayer)
      .map_err(ParseError::browse)
}

fn read_browsed_player(cur: &mut Cursor<'_>, status: Status) -> Result<BrowsedPlayer, CursorError> {
   let uid_counter = cur.read_u16()?;
   let num_items = cur.read_u32()?;
   let charset_id = cur.read_u16()?;
   let depth = cur.read_u8()?;
   let mut folders = Vec::with_capacity(usize::from(depth).min(cur.remaining() / 2));
   for _ in 0..depth {
      let len = cur.read_u16()?;
      folders.push(cur.bytes(usize::from(len))?.to_vec());
   }
   Ok(BrowsedPlayer {
      status,
      uid_counter,
      num_items,
      charset_id,
      folders,
   })
}
