//! Bluetooth side of the AVRCP link layer.
//!
//! This module provides the connection handler together with the seams it
//! drives: the control-channel transport, service discovery and the volume
//! policy.

pub mod address;
pub mod device;
pub mod handler;
pub mod policy;
pub mod sdp;
pub mod transport;
