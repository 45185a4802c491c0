//! Volume policy seam.
//!
//! The handler only asks two questions of the policy (is absolute volume on,
//! is this peer blocklisted) and tells it about devices that will not get
//! absolute volume. The business rules behind those answers live elsewhere.

use std::{
   collections::HashSet,
   sync::atomic::{AtomicBool, Ordering},
};

use log::debug;
use parking_lot::Mutex;

use crate::{bluetooth::address::Address, config::Config};

pub trait VolumePolicy: Send + Sync {
   /// A device without absolute volume support connected.
   fn device_connected(&self, address: Address);

   fn device_disconnected(&self, address: Address);

   fn absolute_volume_enabled(&self) -> bool;

   /// Whether `address` is on the absolute-volume interoperability blocklist.
   fn is_interop_blocked(&self, address: &Address) -> bool;
}

/// Configuration-backed policy that tracks which devices it was told about.
#[derive(Debug, Default)]
pub struct StaticPolicy {
   absolute_volume: AtomicBool,
   blocklist: Mutex<HashSet<Address>>,
   connected: Mutex<HashSet<Address>>,
}

impl StaticPolicy {
   pub fn new(absolute_volume_enabled: bool) -> Self {
      Self {
         absolute_volume: AtomicBool::new(absolute_volume_enabled),
         ..Default::default()
      }
   }

   pub fn from_config(config: &Config) -> Self {
      let policy = Self::new(config.absolute_volume_enabled);
      policy
         .blocklist
         .lock()
         .extend(config.volume_blocklist.iter().copied());
      policy
   }

   pub fn set_absolute_volume(&self, enabled: bool) {
      self.absolute_volume.store(enabled, Ordering::Relaxed);
   }

   pub fn block(&self, address: Address) {
      self.blocklist.lock().insert(address);
   }

   pub fn unblock(&self, address: &Address) -> bool {
      self.blocklist.lock().remove(address)
   }

   /// Devices currently handled without absolute volume.
   pub fn connected_devices(&self) -> Vec<Address> {
      let mut out: Vec<_> = self.connected.lock().iter().copied().collect();
      out.sort_unstable();
      out
   }
}

impl VolumePolicy for StaticPolicy {
   fn device_connected(&self, address: Address) {
      debug!("Volume policy: {address} connected without absolute volume");
      self.connected.lock().insert(address);
   }

   fn device_disconnected(&self, address: Address) {
      debug!("Volume policy: {address} disconnected");
      self.connected.lock().remove(&address);
   }

   fn absolute_volume_enabled(&self) -> bool {
      self.absolute_volume.load(Ordering::Relaxed)
   }

   fn is_interop_blocked(&self, address: &Address) -> bool {
      self.blocklist.lock().contains(address)
   }
}
