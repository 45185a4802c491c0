//! Control-channel transport seam.
//!
//! The AVCTP/L2CAP layer below the message boundary is not implemented here;
//! it is injected as an [`AvrcpTransport`]. Everything the transport reports
//! back (channel events and inbound frames) goes through the
//! [`ChannelCallbacks`] it was handed at `open`, which only hold a weak handle
//! to the connection handler.

use crate::{
   avrcp::{message::AvrcMessage, packet::Packet},
   bluetooth::{
      address::Address,
      handler::{HandlerCommand, HandlerInbox},
   },
   error::Result,
};

/// Which side started the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ConnRole {
   Initiator,
   Acceptor,
}

/// Channel events reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ControlEvent {
   Open,
   Close,
   BrowseOpen,
   BrowseClose,
   Congested,
   Uncongested,
}

/// AVCTP primitives the connection handler drives, keyed by session handle.
pub trait AvrcpTransport: Send + Sync {
   /// Opens a control channel and returns its handle.
   ///
   /// Acceptors are opened against [`Address::ANY`] and report the real peer
   /// in their `Open` event.
   fn open(&self, role: ConnRole, address: Address, callbacks: ChannelCallbacks) -> Result<u8>;

   fn open_browse(&self, handle: u8, role: ConnRole) -> Result<()>;

   fn close(&self, handle: u8) -> Result<()>;

   fn msg_req(&self, handle: u8, label: u8, browse: bool, packet: &Packet) -> Result<()>;

   fn peer_mtu(&self, handle: u8) -> u16;

   fn browse_mtu(&self, handle: u8) -> u16;
}

/// Event sink handed to the transport with every `open`.
///
/// Posting after the handler is gone does nothing and returns `false`.
#[derive(Debug, Clone)]
pub struct ChannelCallbacks {
   role: ConnRole,
   inbox: HandlerInbox,
}

impl ChannelCallbacks {
   pub(crate) const fn new(role: ConnRole, inbox: HandlerInbox) -> Self {
      Self { role, inbox }
   }

   pub const fn role(&self) -> ConnRole {
      self.role
   }

   pub fn on_control(&self, handle: u8, event: ControlEvent, address: Address) -> bool {
      self.inbox.post(HandlerCommand::Control {
         role: self.role,
         handle,
         event,
         address,
      })
   }

   pub fn on_message(&self, handle: u8, label: u8, message: AvrcMessage) -> bool {
      self.inbox.post(HandlerCommand::Message {
         handle,
         label,
         message,
      })
   }
}
