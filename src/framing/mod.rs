//! AMQP 0-8 wire framing.
//!
//! Renders broker messages into protocol frames and parses the small set of
//! inbound methods the channel session consumes.
//!
//! # Wire Format
//!
//! ```text
//! Frame:
//!   [type: 1]          1 = method, 2 = content header, 3 = content body, 8 = heartbeat
//!   [channel: 2]       Big-endian channel id (0 = connection)
//!   [size: 4]          Payload length
//!   [payload: size]
//!   [end: 1]           0xCE
//!
//! Method payload:
//!   [class: 2][method: 2][arguments]
//!
//! Content header payload:
//!   [class: 2][weight: 2][body_size: 8][property_flags: 2][property list]
//! ```
//!
//! A content-bearing method (deliver, get-ok, return) is always emitted as
//! one method frame, one header frame, then zero or more body frames carrying
//! the body in its original byte order, each at most `frame_max - 8` bytes.
//!
//! # Example
//!
//! ```rust,ignore
//! use amq::framing::{FrameCodec, ProtocolVersion};
//!
//! let codec = FrameCodec::new(ProtocolVersion::V0_8, 131_072);
//! let frames = codec.encode_deliver(&message, DeliveryProperties::default(), 3, 1, "c1")?;
//! assert_eq!(frames.len(), 3); // method, header, one body frame
//! ```

mod codec;
mod field_table;
mod frame;
mod method;
mod properties;
mod wire;

use serde::{Deserialize, Serialize};

pub use codec::FrameCodec;
pub use field_table::{FieldTable, FieldValue, MAX_TABLE_DEPTH};
pub use frame::{Frame, FrameType, FRAME_END, FRAME_HEADER_SIZE, FRAME_OVERHEAD};
pub use method::{class, MethodFrame};
pub use properties::{BasicProperties, ContentHeader};

/// Default negotiated maximum frame size.
pub const DEFAULT_FRAME_MAX: u32 = 131_072;

/// Smallest frame size a peer may negotiate.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Protocol version negotiated for a connection.
///
/// One codec serves every supported version; only what the protocol
/// actually varies is switched on this tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// AMQP 0-8
    #[default]
    #[serde(rename = "0-8")]
    V0_8,
    /// AMQP 0-9-1
    #[serde(rename = "0-9-1")]
    V0_9_1,
}

impl ProtocolVersion {
    /// Version label as sent in the protocol header.
    pub fn name(&self) -> &'static str {
        match self {
            Self::V0_8 => "0-8",
            Self::V0_9_1 => "0-9-1",
        }
    }

    /// basic.nack only exists from 0-9-1 on.
    pub fn supports_nack(&self) -> bool {
        matches!(self, Self::V0_9_1)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AMQP {}", self.name())
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "0-8" | "0.8" | "08" => Ok(Self::V0_8),
            "0-9-1" | "0.9.1" | "091" => Ok(Self::V0_9_1),
            _ => Err(format!("Unknown protocol version: {s}")),
        }
    }
}

/// AMQP reply codes used by the core.
pub mod reply_code {
    /// Normal completion.
    pub const REPLY_SUCCESS: u16 = 200;
    /// Mandatory message had no route.
    pub const NO_ROUTE: u16 = 312;
    /// Immediate message had no ready consumer.
    pub const NO_CONSUMERS: u16 = 313;
    /// Operation refused by access control.
    pub const ACCESS_REFUSED: u16 = 403;
    /// Referenced entity does not exist.
    pub const NOT_FOUND: u16 = 404;
    /// Request violates a precondition (e.g. unknown delivery tag).
    pub const PRECONDITION_FAILED: u16 = 406;
    /// Frame could not be parsed.
    pub const FRAME_ERROR: u16 = 501;
    /// Method arguments could not be parsed.
    pub const SYNTAX_ERROR: u16 = 502;
    /// Method not valid in this direction or state.
    pub const COMMAND_INVALID: u16 = 503;
    /// Channel-level misuse.
    pub const CHANNEL_ERROR: u16 = 504;
    /// Frame arrived where it was not expected.
    pub const UNEXPECTED_FRAME: u16 = 505;
    /// Operation not allowed.
    pub const NOT_ALLOWED: u16 = 530;
    /// Method not implemented for the negotiated version.
    pub const NOT_IMPLEMENTED: u16 = 540;
    /// Broker-side failure.
    pub const INTERNAL_ERROR: u16 = 541;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_version_from_str() {
        assert_eq!(ProtocolVersion::from_str("0-8").unwrap(), ProtocolVersion::V0_8);
        assert_eq!(
            ProtocolVersion::from_str("0.9.1").unwrap(),
            ProtocolVersion::V0_9_1
        );
        assert!(ProtocolVersion::from_str("1-0").is_err());
    }

    #[test]
    fn test_version_capabilities() {
        assert!(!ProtocolVersion::V0_8.supports_nack());
        assert!(ProtocolVersion::V0_9_1.supports_nack());
        assert_eq!(ProtocolVersion::default(), ProtocolVersion::V0_8);
    }
}
