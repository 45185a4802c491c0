//! Event handling system for AVRCP peers.
//!
//! The connection handler reports connection changes and parsed responses
//! through an [`EventBus`], tagged with the [`Device`] they belong to.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use tokio::{sync::Notify, time};

use crate::{
   avrcp::{protocol::Status, response::Response},
   bluetooth::device::Device,
};

/// Events that can be emitted by the connection handler.
#[derive(Debug, Clone)]
pub enum AvrcpEvent {
   DeviceConnected,
   DeviceDisconnected,
   /// A response frame was parsed.
   Response { label: u8, response: Response },
   /// A response frame could not be parsed.
   ParseFailed { label: u8, status: Status },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, device: &Device, event: AvrcpEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Lock-free event queue that can be drained from an async task.
#[derive(Debug, Default)]
pub struct EventQueue {
   queue: SegQueue<(Device, AvrcpEvent)>,
   notifier: Notify,
}

impl EventQueue {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// Waits for the next event.
   ///
   /// Returns `None` once the queue is empty and no producer holds it anymore.
   pub async fn recv(self: &Arc<Self>) -> Option<(Device, AvrcpEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   pub fn try_recv(&self) -> Option<(Device, AvrcpEvent)> {
      self.queue.pop()
   }

   pub fn len(&self) -> usize {
      self.queue.len()
   }

   pub fn is_empty(&self) -> bool {
      self.queue.is_empty()
   }
}

impl EventBus for EventQueue {
   fn emit(&self, device: &Device, event: AvrcpEvent) {
      self.queue.push((device.clone(), event));
      self.notifier.notify_waiters();
   }
}
