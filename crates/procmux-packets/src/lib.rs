//! Wire packets and framing for the launcher protocol.
//!
//! Every packet is a length-prefixed frame routed by a per-process token:
//! - A 4-byte little-endian length (counting everything after itself)
//! - A 1-byte type tag plus one reserved byte
//! - A 4-byte little-endian token
//! - A type-specific payload
//!
//! The codec is streaming: [`PacketReader`] keeps partial-frame state across
//! reads, so callers only ever see complete packets.

pub mod codec;
pub mod error;
pub mod reader;
pub mod types;

pub use codec::{
    decode_packet, Packet, PacketType, ProcessFinishedPayload, StartProcessPayload,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{PacketError, Result};
pub use reader::PacketReader;
pub use types::{ChannelMode, ExitStatus, ProcessError, ProcessMode};
