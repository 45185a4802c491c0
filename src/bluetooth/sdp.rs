//! Service discovery seam and AVRCP feature decoding.
//!
//! A [`SdpLookup`] owns the discovery database for one query. The SDP
//! collaborator fills it and hands it back through [`SdpLookup::complete`];
//! the connection handler decodes the peer's [`Features`] from it and drops
//! it before acting on the result.

use std::fmt;

use bitflags::bitflags;
use log::{debug, warn};
use uuid::Uuid;

use crate::{
   bluetooth::{
      address::Address,
      handler::{HandlerCommand, HandlerInbox},
      policy::VolumePolicy,
   },
   error::Result,
};

/// 16-bit service class identifiers.
pub mod service_class {
   pub const AV_REM_CTRL_TARGET: u16 = 0x110C;
   pub const AV_REMOTE_CONTROL: u16 = 0x110E;
   pub const AV_REM_CTRL_CONTROL: u16 = 0x110F;
}

/// SDP attribute identifiers read during feature discovery.
pub mod attr {
   pub const SERVICE_CLASS_ID_LIST: u16 = 0x0001;
   pub const BT_PROFILE_DESC_LIST: u16 = 0x0009;
   pub const SUPPORTED_FEATURES: u16 = 0x0311;
}

/// AVRCP profile revisions.
pub const AVRC_REV_1_3: u16 = 0x0103;
pub const AVRC_REV_1_4: u16 = 0x0104;

/// Supported-categories bits in the `SUPPORTED_FEATURES` attribute.
pub const CATEGORY_2: u16 = 0x0002;
pub const CATEGORY_BROWSE: u16 = 0x0040;

/// Default discovery database size in bytes.
pub const DEFAULT_DB_SIZE: usize = 4096 + 16;

const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expands a 16-bit service class id onto the Bluetooth base UUID.
pub const fn service_class_uuid(short: u16) -> Uuid {
   Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Returns the 16-bit alias of `uuid` if it sits on the Bluetooth base UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
   let raw = uuid.as_u128();
   let short = (raw >> 96) as u32;
   if raw & !(0xFFFF_FFFF_u128 << 96) == BASE_UUID && short <= u32::from(u16::MAX) {
      Some(short as u16)
   } else {
      None
   }
}

bitflags! {
   /// Peer feature bits learned from SDP.
   #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
   pub struct Features: u16 {
      const RC_TARGET = 0x0001;
      const RC_CONTROLLER = 0x0002;
      const VENDOR = 0x0008;
      const BROWSE = 0x0010;
      const METADATA = 0x0040;
      /// Advanced control, i.e. absolute volume.
      const ADV_CTRL = 0x0200;
   }
}

impl fmt::Display for Features {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "0x{:04x}", self.bits())?;
      if !self.is_empty() {
         f.write_str(" (")?;
         for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
               f.write_str("|")?;
            }
            f.write_str(name)?;
         }
         f.write_str(")")?;
      }
      Ok(())
   }
}

/// Attribute value stored in a discovery record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
   Uint(u32),
   Uuid(Uuid),
   Text(Vec<u8>),
   Sequence(Vec<AttributeValue>),
}

impl AttributeValue {
   pub const fn as_uint(&self) -> Option<u32> {
      match self {
         Self::Uint(v) => Some(*v),
         _ => None,
      }
   }
}

/// One service record returned by discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpRecord {
   attributes: Vec<(u16, AttributeValue)>,
}

impl SdpRecord {
   /// Creates a record advertising the given service classes.
   pub fn new(service_classes: &[u16]) -> Self {
      let classes = service_classes
         .iter()
         .map(|&class| AttributeValue::Uuid(service_class_uuid(class)))
         .collect();
      Self::default().with_attribute(attr::SERVICE_CLASS_ID_LIST, AttributeValue::Sequence(classes))
   }

   pub fn with_attribute(mut self, id: u16, value: AttributeValue) -> Self {
      self.attributes.retain(|(existing, _)| *existing != id);
      self.attributes.push((id, value));
      self
   }

   /// Appends a `(profile, version)` pair to the profile descriptor list.
   pub fn with_profile(mut self, profile: u16, version: u16) -> Self {
      let entry = AttributeValue::Sequence(vec![
         AttributeValue::Uuid(service_class_uuid(profile)),
         AttributeValue::Uint(u32::from(version)),
      ]);
      if let Some(pos) = self
         .attributes
         .iter()
         .position(|(id, _)| *id == attr::BT_PROFILE_DESC_LIST)
         && let AttributeValue::Sequence(list) = &mut self.attributes[pos].1
      {
         list.push(entry);
         return self;
      }
      self.with_attribute(attr::BT_PROFILE_DESC_LIST, AttributeValue::Sequence(vec![entry]))
   }

   pub fn with_supported_features(self, categories: u16) -> Self {
      self.with_attribute(attr::SUPPORTED_FEATURES, AttributeValue::Uint(u32::from(categories)))
   }

   pub fn find_attribute(&self, id: u16) -> Option<&AttributeValue> {
      self
         .attributes
         .iter()
         .find(|(existing, _)| *existing == id)
         .map(|(_, value)| value)
   }

   pub fn has_service_class(&self, class: u16) -> bool {
      let Some(AttributeValue::Sequence(classes)) = self.find_attribute(attr::SERVICE_CLASS_ID_LIST)
      else {
         return false;
      };
      classes
         .iter()
         .any(|value| matches!(value, AttributeValue::Uuid(uuid) if short_uuid(uuid) == Some(class)))
   }

   /// Version of `profile` from the profile descriptor list.
   pub fn find_profile_version(&self, profile: u16) -> Option<u16> {
      let Some(AttributeValue::Sequence(list)) = self.find_attribute(attr::BT_PROFILE_DESC_LIST)
      else {
         return None;
      };
      list.iter().find_map(|entry| match entry {
         AttributeValue::Sequence(pair) => match pair.as_slice() {
            [AttributeValue::Uuid(uuid), AttributeValue::Uint(version)]
               if short_uuid(uuid) == Some(profile) =>
            {
               u16::try_from(*version).ok()
            },
            _ => None,
         },
         _ => None,
      })
   }
}

/// Discovery database filled by the SDP collaborator.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryDb {
   capacity: usize,
   records: Vec<SdpRecord>,
}

impl DiscoveryDb {
   pub fn with_capacity(capacity: usize) -> Self {
      Self {
         capacity,
         records: Vec::new(),
      }
   }

   /// Size in bytes the collaborator may fill.
   pub const fn capacity(&self) -> usize {
      self.capacity
   }

   pub fn push_record(&mut self, record: SdpRecord) {
      self.records.push(record);
   }

   pub fn records(&self) -> &[SdpRecord] {
      &self.records
   }

   /// First record advertising `service_class`.
   pub fn find_service(&self, service_class: u16) -> Option<&SdpRecord> {
      self
         .records
         .iter()
         .find(|record| record.has_service_class(service_class))
   }
}

/// Parameters of a service search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpQuery {
   pub db_len: usize,
   pub attr_ids: Vec<u16>,
}

impl SdpQuery {
   /// The attributes feature decoding needs.
   pub fn avrcp(db_len: usize) -> Self {
      Self {
         db_len,
         attr_ids: vec![
            attr::SERVICE_CLASS_ID_LIST,
            attr::BT_PROFILE_DESC_LIST,
            attr::SUPPORTED_FEATURES,
         ],
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupId(pub(crate) u64);

impl fmt::Display for LookupId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SdpStatus {
   Success,
   Failed,
   /// The collaborator dropped the lookup without completing it.
   Aborted,
}

/// One in-flight service search.
///
/// Completing consumes the lookup. Dropping it uncompleted reports
/// [`SdpStatus::Aborted`], so the handler always hears back exactly once.
#[derive(Debug)]
pub struct SdpLookup {
   id: LookupId,
   address: Address,
   db: Option<DiscoveryDb>,
   inbox: HandlerInbox,
}

impl SdpLookup {
   pub(crate) const fn new(
      id: LookupId,
      address: Address,
      db: DiscoveryDb,
      inbox: HandlerInbox,
   ) -> Self {
      Self {
         id,
         address,
         db: Some(db),
         inbox,
      }
   }

   pub const fn id(&self) -> LookupId {
      self.id
   }

   pub const fn address(&self) -> Address {
      self.address
   }

   pub fn db_mut(&mut self) -> Option<&mut DiscoveryDb> {
      self.db.as_mut()
   }

   /// Hands the database back to the connection handler.
   pub fn complete(mut self, status: SdpStatus) -> bool {
      let db = self.db.take();
      self.inbox.post(HandlerCommand::SdpComplete {
         id: self.id,
         status,
         db,
      })
   }
}

impl Drop for SdpLookup {
   fn drop(&mut self) {
      if let Some(db) = self.db.take() {
         debug!("SDP lookup {} for {} dropped uncompleted", self.id, self.address);
         self.inbox.post(HandlerCommand::SdpComplete {
            id: self.id,
            status: SdpStatus::Aborted,
            db: Some(db),
         });
      }
   }
}

/// Service discovery primitive.
pub trait SdpInterface: Send + Sync {
   /// Starts a search for `uuid` on `lookup.address()`.
   ///
   /// On `Ok` the implementation must eventually complete (or drop) `lookup`.
   fn find_service(&self, uuid: Uuid, query: &SdpQuery, lookup: SdpLookup) -> Result<()>;
}

/// Which side of the peer a service record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordSide {
   Controller,
   Target,
}

fn decode_record(
   record: &SdpRecord,
   side: RecordSide,
   address: &Address,
   policy: &dyn VolumePolicy,
) -> (u16, Features) {
   let mut features = Features::empty();
   if record.find_attribute(attr::BT_PROFILE_DESC_LIST).is_none() {
      return (0, features);
   }

   let version = record
      .find_profile_version(service_class::AV_REMOTE_CONTROL)
      .unwrap_or(0);
   if version >= AVRC_REV_1_3 {
      features |= match side {
         RecordSide::Controller => Features::VENDOR | Features::METADATA,
         RecordSide::Target => Features::VENDOR,
      };
   }
   if version >= AVRC_REV_1_4
      && let Some(categories) = record
         .find_attribute(attr::SUPPORTED_FEATURES)
         .and_then(AttributeValue::as_uint)
   {
      let categories = categories as u16;
      if categories & CATEGORY_2 != 0 {
         if policy.absolute_volume_enabled() && !policy.is_interop_blocked(address) {
            features |= Features::ADV_CTRL;
         } else {
            warn!("Absolute volume disabled for {address}");
         }
      }
      // Browsing is only taken from the controller record
      if side == RecordSide::Controller && categories & CATEGORY_BROWSE != 0 {
         features |= Features::BROWSE;
      }
   }
   (version, features)
}

/// Computes the peer's AVRCP version and feature bits from a discovery result.
///
/// The advanced-control bit is gated by `policy` at the time of the call; it is
/// not re-evaluated if the policy changes later.
pub fn decode_features(
   db: &DiscoveryDb,
   address: &Address,
   policy: &dyn VolumePolicy,
) -> (u16, Features) {
   let mut version = 0;
   let mut features = Features::empty();

   if let Some(record) = db.find_service(service_class::AV_REMOTE_CONTROL) {
      features |= Features::RC_CONTROLLER;
      let (v, f) = decode_record(record, RecordSide::Controller, address, policy);
      version = version.max(v);
      features |= f;
   }

   if let Some(record) = db.find_service(service_class::AV_REM_CTRL_TARGET) {
      features |= Features::RC_TARGET;
      let (v, f) = decode_record(record, RecordSide::Target, address, policy);
      version = version.max(v);
      features |= f;
   }

   debug!("SDP for {address}: version 0x{version:04x}, features {features}");
   (version, features)
}
