//! Connected AVRCP peer.
//!
//! A [`Device`] is created by the connection handler when a control channel
//! opens and is shared with the upper layer through [`crate::event::EventBus`].
//! It stays valid as a value after the channel closes, but everything that
//! would reach the transport fails with [`AvrcpError::DeviceNotConnected`].

use core::fmt;
use std::sync::{
   Arc, Weak,
   atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering},
};

use crossbeam::atomic::AtomicCell;
use log::{debug, info};
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};

use crate::{
   avrcp::{message::AvrcMessage, protocol::EventId},
   bluetooth::{
      address::Address,
      handler::{HandlerCommand, HandlerInbox},
      sdp::Features,
   },
   error::{AvrcpError, Result},
};

/// Transaction labels are 4 bits wide.
const LABEL_MASK: u8 = 0x0F;

#[derive(Debug)]
struct DeviceInner {
   address: Address,
   address_str: SmolStr,
   handle: u8,
   ctrl_mtu: u16,
   browse_mtu: AtomicU16,
   browsable: AtomicBool,
   connected: AtomicBool,
   volume_registered: AtomicBool,
   features: AtomicCell<Option<Features>>,
   next_label: AtomicU8,
   inbox: HandlerInbox,
}

/// A connected AVRCP peer.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

/// Weak reference to a [`Device`].
#[derive(Debug, Clone)]
pub struct WeakDevice(Weak<DeviceInner>);

impl WeakDevice {
   pub fn new(device: &Device) -> Self {
      Self(Arc::downgrade(&device.0))
   }

   pub fn upgrade(&self) -> Option<Device> {
      self.0.upgrade().map(Device)
   }
}

impl fmt::Debug for Device {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Debug::fmt(&self.0, f)
   }
}

impl PartialEq for Device {
   fn eq(&self, other: &Self) -> bool {
      Arc::ptr_eq(&self.0, &other.0)
   }
}

impl Eq for Device {}

impl Device {
   pub(crate) fn new(
      address: Address,
      handle: u8,
      ctrl_mtu: u16,
      browse_mtu: u16,
      browsable: bool,
      inbox: HandlerInbox,
   ) -> Self {
      Self(Arc::new(DeviceInner {
         address,
         address_str: address.to_smolstr(),
         handle,
         ctrl_mtu,
         browse_mtu: AtomicU16::new(browse_mtu),
         browsable: AtomicBool::new(browsable),
         connected: AtomicBool::new(true),
         volume_registered: AtomicBool::new(false),
         features: AtomicCell::new(None),
         next_label: AtomicU8::new(0),
         inbox,
      }))
   }

   pub fn address(&self) -> Address {
      self.0.address
   }

   pub fn address_str(&self) -> &SmolStr {
      &self.0.address_str
   }

   /// Control channel handle assigned by the transport.
   pub fn handle(&self) -> u8 {
      self.0.handle
   }

   pub fn ctrl_mtu(&self) -> u16 {
      self.0.ctrl_mtu
   }

   pub fn browse_mtu(&self) -> u16 {
      self.0.browse_mtu.load(Ordering::Relaxed)
   }

   pub(crate) fn set_browse_mtu(&self, mtu: u16) {
      self.0.browse_mtu.store(mtu, Ordering::Relaxed);
   }

   pub fn is_browsable(&self) -> bool {
      self.0.browsable.load(Ordering::Relaxed)
   }

   pub(crate) fn set_browsable(&self, browsable: bool) {
      self.0.browsable.store(browsable, Ordering::Relaxed);
   }

   pub fn is_connected(&self) -> bool {
      self.0.connected.load(Ordering::Relaxed)
   }

   pub(crate) fn disconnected(&self) {
      if self.0.connected.swap(false, Ordering::Relaxed) {
         info!("{}: disconnected", self.address_str());
      }
   }

   /// Peer features, once SDP has completed for this device.
   pub fn features(&self) -> Option<Features> {
      self.0.features.load()
   }

   pub(crate) fn set_features(&self, features: Features) {
      self.0.features.store(Some(features));
   }

   pub fn volume_registered(&self) -> bool {
      self.0.volume_registered.load(Ordering::Relaxed)
   }

   fn next_label(&self) -> u8 {
      self.0.next_label.fetch_add(1, Ordering::Relaxed) & LABEL_MASK
   }

   /// Queues `msg` for transmission and returns the transaction label used.
   pub fn send_message(&self, msg: &AvrcMessage) -> Result<u8> {
      if !self.is_connected() {
         return Err(AvrcpError::DeviceNotConnected);
      }

      let handle = self.handle();
      let browse = msg.is_browse();
      if browse && !self.is_browsable() {
         return Err(AvrcpError::SendFailed {
            handle,
            reason: "browse channel not available",
         });
      }

      let packet = msg.to_packet();
      if packet.is_empty() {
         return Err(AvrcpError::SendFailed {
            handle,
            reason: "message has no wire representation",
         });
      }
      let mtu = if browse {
         self.browse_mtu()
      } else {
         self.ctrl_mtu()
      };
      if packet.len() > usize::from(mtu) {
         return Err(AvrcpError::SendFailed {
            handle,
            reason: "message exceeds channel MTU",
         });
      }

      let label = self.next_label();
      debug!(
         "{}: queueing label {label} -> {}",
         self.address_str(),
         hex::encode(packet.data())
      );
      if !self.0.inbox.post(HandlerCommand::Send {
         handle,
         label,
         browse,
         packet,
      }) {
         return Err(AvrcpError::HandlerShutdown);
      }
      Ok(label)
   }

   /// Registers for volume-changed notifications from the peer.
   pub fn register_volume_changed(&self) -> Result<u8> {
      let label =
         self.send_message(&AvrcMessage::register_notification(EventId::VolumeChanged, 0))?;
      self.0.volume_registered.store(true, Ordering::Relaxed);
      info!("{}: registered for volume changes", self.address_str());
      Ok(label)
   }

   /// Converts the device state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
          "address": self.address_str().as_str(),
          "handle": self.handle(),
          "connected": self.is_connected(),
          "browsable": self.is_browsable(),
          "ctrl_mtu": self.ctrl_mtu(),
          "browse_mtu": self.browse_mtu(),
          "volume_registered": self.volume_registered(),
      });

      if let Some(features) = self.features() {
         let names: Vec<_> = features.iter_names().map(|(name, _)| name).collect();
         info["features"] = json!(names);
      }
      info
   }
}

#[cfg(test)]
mod tests {
   use tokio::sync::mpsc;

   use super::*;
   use crate::avrcp::{
      message::{AvcHeader, BrowseMessage},
      protocol::{CType, Opcode},
   };

   const PEER: Address = Address([0xA0, 0xB1, 0xC2, 0xD3, 0xE4, 0xF5]);

   fn device(
      browsable: bool,
   ) -> (
      Device,
      mpsc::UnboundedSender<HandlerCommand>,
      mpsc::UnboundedReceiver<HandlerCommand>,
   ) {
      let (tx, rx) = mpsc::unbounded_channel();
      let dev = Device::new(PEER, 3, 669, 1021, browsable, HandlerInbox::new(tx.downgrade()));
      (dev, tx, rx)
   }

   #[test]
   fn test_register_volume_changed_queues_command() {
      let (dev, _tx, mut rx) = device(false);
      assert_eq!(dev.register_volume_changed().unwrap(), 0);
      assert!(dev.volume_registered());

      let Ok(HandlerCommand::Send {
         handle,
         label,
         browse,
         packet,
      }) = rx.try_recv()
      else {
         panic!("expected a queued send");
      };
      assert_eq!((handle, label, browse), (3, 0, false));
      assert_eq!(packet.data()[2], Opcode::Vendor as u8);
      assert_eq!(packet.data()[10], EventId::VolumeChanged as u8);
   }

   #[test]
   fn test_labels_wrap_at_four_bits() {
      let (dev, _tx, _rx) = device(false);
      let msg = AvrcMessage::register_notification(EventId::TrackChanged, 0);
      let labels: Vec<u8> = (0..18).map(|_| dev.send_message(&msg).unwrap()).collect();
      assert_eq!(labels[15], 15);
      assert_eq!(labels[16], 0);
      assert_eq!(labels[17], 1);
   }

   #[test]
   fn test_send_rejections() {
      let (dev, tx, _rx) = device(false);
      let browse = AvrcMessage::Browse(BrowseMessage {
         ctype: CType::Control as u8,
         data: vec![0x71, 0x00, 0x00],
      });
      assert!(matches!(
         dev.send_message(&browse),
         Err(AvrcpError::SendFailed { handle: 3, .. })
      ));

      let other = AvrcMessage::Other {
         header: AvcHeader::new(CType::Status),
         opcode: Opcode::UnitInfo as u8,
      };
      assert!(matches!(
         dev.send_message(&other),
         Err(AvrcpError::SendFailed { .. })
      ));

      drop(tx);
      assert!(matches!(
         dev.register_volume_changed(),
         Err(AvrcpError::HandlerShutdown)
      ));
      assert!(!dev.volume_registered());

      dev.disconnected();
      assert!(!dev.is_connected());
      assert!(matches!(
         dev.register_volume_changed(),
         Err(AvrcpError::DeviceNotConnected)
      ));
   }

   #[test]
   fn test_weak_device_and_json() {
      let (dev, _tx, _rx) = device(true);
      dev.set_features(Features::RC_CONTROLLER | Features::BROWSE);
      let weak = WeakDevice::new(&dev);
      assert_eq!(weak.upgrade().as_ref(), Some(&dev));

      let info = dev.to_json();
      assert_eq!(info["address"], "A0:B1:C2:D3:E4:F5");
      assert_eq!(info["browse_mtu"], 1021);
      assert_eq!(info["features"], json!(["RC_CONTROLLER", "BROWSE"]));

      drop(dev);
      assert!(weak.upgrade().is_none());
   }
}
