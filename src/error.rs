//! Error types for the AVRCP link layer.
//!
//! Parse failures have their own [`ParseError`](crate::avrcp::parser::ParseError)
//! because they map onto AVRCP status codes; everything that crosses a
//! collaborator seam (transport, SDP, configuration) lands here.

use thiserror::Error;

use crate::bluetooth::address::Address;

/// Main error type for the AVRCP link layer.
#[derive(Error, Debug)]
pub enum AvrcpError {
   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Failed to open control channel to {0}")]
   OpenFailed(Address),

   #[error("Failed to open browse channel on handle {0}")]
   BrowseOpenFailed(u8),

   #[error("Failed to close handle {0}")]
   CloseFailed(u8),

   #[error("Transport rejected message on handle {handle}: {reason}")]
   SendFailed { handle: u8, reason: &'static str },

   #[error("Could not start service discovery for {0}")]
   SdpUnavailable(Address),

   #[error("Could not arm the acceptor connection")]
   AcceptorUnavailable,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Connection handler has been shut down")]
   HandlerShutdown,
}

/// Convenience type alias for Results with `AvrcpError`.
pub type Result<T> = std::result::Result<T, AvrcpError>;
