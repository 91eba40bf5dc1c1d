//! Raw frame envelope.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{AmqError, Result};

/// Frame end octet
pub const FRAME_END: u8 = 0xCE;

/// type + channel + size
pub const FRAME_HEADER_SIZE: usize = 7;

/// Bytes a frame adds around its payload (header + end octet)
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// Frame type octet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Method frame
    Method,
    /// Content header frame
    Header,
    /// Content body frame
    Body,
    /// Heartbeat frame
    Heartbeat,
}

impl FrameType {
    /// Wire octet
    pub fn as_byte(self) -> u8 {
        match self {
            FrameType::Method => 1,
            FrameType::Header => 2,
            FrameType::Body => 3,
            FrameType::Heartbeat => 8,
        }
    }

    /// Parse a wire octet
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FrameType::Method),
            2 => Some(FrameType::Header),
            3 => Some(FrameType::Body),
            8 => Some(FrameType::Heartbeat),
            _ => None,
        }
    }
}

/// One protocol frame. Payload bytes are owned by the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel id (0 = connection)
    pub channel: u16,
    /// Frame type
    pub kind: FrameType,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Method frame
    pub fn method(channel: u16, payload: Bytes) -> Self {
        Self {
            channel,
            kind: FrameType::Method,
            payload,
        }
    }

    /// Content header frame
    pub fn header(channel: u16, payload: Bytes) -> Self {
        Self {
            channel,
            kind: FrameType::Header,
            payload,
        }
    }

    /// Content body frame
    pub fn body(channel: u16, payload: Bytes) -> Self {
        Self {
            channel,
            kind: FrameType::Body,
            payload,
        }
    }

    /// Heartbeat frame (always channel 0)
    pub fn heartbeat() -> Self {
        Self {
            channel: 0,
            kind: FrameType::Heartbeat,
            payload: Bytes::new(),
        }
    }

    /// Size on the wire
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Append the wire form to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.kind.as_byte());
        buf.put_u16(self.channel);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.put_u8(FRAME_END);
    }

    /// Wire form in a fresh buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode one frame from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` does not yet hold a whole frame,
    /// otherwise the frame and the number of bytes consumed.
    pub fn decode(data: &[u8], frame_max: u32) -> Result<Option<(Self, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let kind = FrameType::from_byte(data[0])
            .ok_or_else(|| AmqError::MalformedFrame(format!("unknown frame type {}", data[0])))?;
        let channel = u16::from_be_bytes([data[1], data[2]]);
        let size = u32::from_be_bytes([data[3], data[4], data[5], data[6]]);

        if frame_max != 0 && size as usize + FRAME_OVERHEAD > frame_max as usize {
            return Err(AmqError::MalformedFrame(format!(
                "frame of {} bytes exceeds frame max {frame_max}",
                size as usize + FRAME_OVERHEAD
            )));
        }

        let total = FRAME_OVERHEAD + size as usize;
        if data.len() < total {
            return Ok(None);
        }

        if data[total - 1] != FRAME_END {
            return Err(AmqError::MalformedFrame(format!(
                "bad frame end octet 0x{:02x}",
                data[total - 1]
            )));
        }

        let payload = Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..total - 1]);
        Ok(Some((
            Self {
                channel,
                kind,
                payload,
            },
            total,
        )))
    }
}
