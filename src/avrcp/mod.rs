//! AVRCP wire layer: packets, the message adapter and the response parser.

pub mod cursor;
pub mod message;
pub mod packet;
pub mod parser;
pub mod protocol;
pub mod response;
