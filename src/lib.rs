//! AVRCP connection handling and controller-side response parsing.
//!
//! The crate sits between an AVCTP transport and an upper media layer:
//!
//! - [`ConnectionHandler`] accepts and initiates control channels, runs
//!   service discovery and keeps one [`Device`] per open channel.
//! - The [`avrcp`] module converts messages to packets and parses the
//!   responses and browse replies a controller receives.
//! - Results reach the upper layer through an [`EventBus`].

pub mod avrcp;
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;

pub use bluetooth::{
   address::Address,
   device::{Device, WeakDevice},
   handler::{ConnectionHandler, HandlerInbox},
   policy::{StaticPolicy, VolumePolicy},
   sdp::{Features, SdpInterface},
   transport::{AvrcpTransport, ChannelCallbacks, ConnRole, ControlEvent},
};
pub use config::Config;
pub use error::{AvrcpError, Result};
pub use event::{AvrcpEvent, EventBus, EventQueue, EventSender};
