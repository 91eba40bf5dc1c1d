//! Channel- and basic-class methods handled by the session core.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire::{pack_bits, put_short_str, Reader};
use super::ProtocolVersion;
use crate::error::{AmqError, Result};

/// Class and method identifiers.
pub mod class {
    /// channel class
    pub const CHANNEL: u16 = 20;
    /// basic class
    pub const BASIC: u16 = 60;

    /// channel.flow
    pub const CHANNEL_FLOW: u16 = 20;
    /// channel.flow-ok
    pub const CHANNEL_FLOW_OK: u16 = 21;
    /// channel.close
    pub const CHANNEL_CLOSE: u16 = 40;
    /// channel.close-ok
    pub const CHANNEL_CLOSE_OK: u16 = 41;

    /// basic.cancel-ok
    pub const BASIC_CANCEL_OK: u16 = 31;
    /// basic.return
    pub const BASIC_RETURN: u16 = 50;
    /// basic.deliver
    pub const BASIC_DELIVER: u16 = 60;
    /// basic.get-ok
    pub const BASIC_GET_OK: u16 = 71;
    /// basic.ack
    pub const BASIC_ACK: u16 = 80;
    /// basic.reject
    pub const BASIC_REJECT: u16 = 90;
    /// basic.nack (0-9-1 only)
    pub const BASIC_NACK: u16 = 120;
}

/// A decoded or to-be-encoded method frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodFrame {
    /// Pause or resume content delivery
    ChannelFlow {
        /// true = resume
        active: bool,
    },
    /// Confirm a flow change
    ChannelFlowOk {
        /// State now in effect
        active: bool,
    },
    /// Close the channel
    ChannelClose {
        /// Reply code
        reply_code: u16,
        /// Reply text
        reply_text: String,
        /// Class of the failing method, or 0
        class_id: u16,
        /// Failing method, or 0
        method_id: u16,
    },
    /// Confirm channel close
    ChannelCloseOk,
    /// Consumer cancelled by the broker (auto-close notification)
    BasicCancelOk {
        /// Cancelled consumer
        consumer_tag: String,
    },
    /// Return an undeliverable message to its publisher
    BasicReturn {
        /// Reply code (312, 313, ...)
        reply_code: u16,
        /// Reply text
        reply_text: String,
        /// Exchange the message was published to
        exchange: String,
        /// Routing key it was published with
        routing_key: String,
    },
    /// Push a message to a consumer
    BasicDeliver {
        /// Receiving consumer
        consumer_tag: String,
        /// Channel-scoped delivery tag
        delivery_tag: u64,
        /// Message was delivered before
        redelivered: bool,
        /// Exchange the message was published to
        exchange: String,
        /// Routing key it was published with
        routing_key: String,
    },
    /// Answer a basic.get with a message
    BasicGetOk {
        /// Channel-scoped delivery tag
        delivery_tag: u64,
        /// Message was delivered before
        redelivered: bool,
        /// Exchange the message was published to
        exchange: String,
        /// Routing key it was published with
        routing_key: String,
        /// Messages left in the queue
        message_count: u32,
    },
    /// Acknowledge one or more deliveries
    BasicAck {
        /// Tag to acknowledge
        delivery_tag: u64,
        /// Include all lower tags
        multiple: bool,
    },
    /// Reject one delivery
    BasicReject {
        /// Tag to reject
        delivery_tag: u64,
        /// Return the message to its queue
        requeue: bool,
    },
    /// Reject one or more deliveries
    BasicNack {
        /// Tag to reject
        delivery_tag: u64,
        /// Include all lower tags
        multiple: bool,
        /// Return the messages to their queues
        requeue: bool,
    },
}

impl MethodFrame {
    /// (class id, method id)
    pub fn ids(&self) -> (u16, u16) {
        match self {
            MethodFrame::ChannelFlow { .. } => (class::CHANNEL, class::CHANNEL_FLOW),
            MethodFrame::ChannelFlowOk { .. } => (class::CHANNEL, class::CHANNEL_FLOW_OK),
            MethodFrame::ChannelClose { .. } => (class::CHANNEL, class::CHANNEL_CLOSE),
            MethodFrame::ChannelCloseOk => (class::CHANNEL, class::CHANNEL_CLOSE_OK),
            MethodFrame::BasicCancelOk { .. } => (class::BASIC, class::BASIC_CANCEL_OK),
            MethodFrame::BasicReturn { .. } => (class::BASIC, class::BASIC_RETURN),
            MethodFrame::BasicDeliver { .. } => (class::BASIC, class::BASIC_DELIVER),
            MethodFrame::BasicGetOk { .. } => (class::BASIC, class::BASIC_GET_OK),
            MethodFrame::BasicAck { .. } => (class::BASIC, class::BASIC_ACK),
            MethodFrame::BasicReject { .. } => (class::BASIC, class::BASIC_REJECT),
            MethodFrame::BasicNack { .. } => (class::BASIC, class::BASIC_NACK),
        }
    }

    /// Protocol name, e.g. `basic.deliver`
    pub fn name(&self) -> &'static str {
        match self {
            MethodFrame::ChannelFlow { .. } => "channel.flow",
            MethodFrame::ChannelFlowOk { .. } => "channel.flow-ok",
            MethodFrame::ChannelClose { .. } => "channel.close",
            MethodFrame::ChannelCloseOk => "channel.close-ok",
            MethodFrame::BasicCancelOk { .. } => "basic.cancel-ok",
            MethodFrame::BasicReturn { .. } => "basic.return",
            MethodFrame::BasicDeliver { .. } => "basic.deliver",
            MethodFrame::BasicGetOk { .. } => "basic.get-ok",
            MethodFrame::BasicAck { .. } => "basic.ack",
            MethodFrame::BasicReject { .. } => "basic.reject",
            MethodFrame::BasicNack { .. } => "basic.nack",
        }
    }

    /// Whether the method is followed by a content header and body.
    pub fn carries_content(&self) -> bool {
        matches!(
            self,
            MethodFrame::BasicDeliver { .. }
                | MethodFrame::BasicGetOk { .. }
                | MethodFrame::BasicReturn { .. }
        )
    }

    /// Encode to a fresh method payload.
    pub fn encode(&self) -> Result<Bytes> {
        let (class_id, method_id) = self.ids();
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(class_id);
        buf.put_u16(method_id);

        match self {
            MethodFrame::ChannelFlow { active } | MethodFrame::ChannelFlowOk { active } => {
                buf.put_u8(pack_bits(&[*active]));
            },
            MethodFrame::ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                buf.put_u16(*reply_code);
                put_short_str(&mut buf, reply_text)?;
                buf.put_u16(*class_id);
                buf.put_u16(*method_id);
            },
            MethodFrame::ChannelCloseOk => {},
            MethodFrame::BasicCancelOk { consumer_tag } => {
                put_short_str(&mut buf, consumer_tag)?;
            },
            MethodFrame::BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                buf.put_u16(*reply_code);
                put_short_str(&mut buf, reply_text)?;
                put_short_str(&mut buf, exchange)?;
                put_short_str(&mut buf, routing_key)?;
            },
            MethodFrame::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                put_short_str(&mut buf, consumer_tag)?;
                buf.put_u64(*delivery_tag);
                buf.put_u8(pack_bits(&[*redelivered]));
                put_short_str(&mut buf, exchange)?;
                put_short_str(&mut buf, routing_key)?;
            },
            MethodFrame::BasicGetOk {
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
                message_count,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(pack_bits(&[*redelivered]));
                put_short_str(&mut buf, exchange)?;
                put_short_str(&mut buf, routing_key)?;
                buf.put_u32(*message_count);
            },
            MethodFrame::BasicAck {
                delivery_tag,
                multiple,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(pack_bits(&[*multiple]));
            },
            MethodFrame::BasicReject {
                delivery_tag,
                requeue,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(pack_bits(&[*requeue]));
            },
            MethodFrame::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(pack_bits(&[*multiple, *requeue]));
            },
        }

        Ok(buf.freeze())
    }

    /// Decode a method payload.
    ///
    /// Returns `Ok(None)` for methods outside the session core; those belong
    /// to adjacent handlers. Truncated arguments of a known method are
    /// `MalformedFrame`.
    pub fn decode(payload: &[u8], version: ProtocolVersion) -> Result<Option<Self>> {
        let mut r = Reader::new(payload);
        let class_id = r.u16()?;
        let method_id = r.u16()?;

        let method = match (class_id, method_id) {
            (class::CHANNEL, class::CHANNEL_FLOW) => MethodFrame::ChannelFlow {
                active: r.u8()? & 1 != 0,
            },
            (class::CHANNEL, class::CHANNEL_FLOW_OK) => MethodFrame::ChannelFlowOk {
                active: r.u8()? & 1 != 0,
            },
            (class::CHANNEL, class::CHANNEL_CLOSE) => MethodFrame::ChannelClose {
                reply_code: r.u16()?,
                reply_text: r.short_str()?,
                class_id: r.u16()?,
                method_id: r.u16()?,
            },
            (class::CHANNEL, class::CHANNEL_CLOSE_OK) => MethodFrame::ChannelCloseOk,
            (class::BASIC, class::BASIC_CANCEL_OK) => MethodFrame::BasicCancelOk {
                consumer_tag: r.short_str()?,
            },
            (class::BASIC, class::BASIC_RETURN) => MethodFrame::BasicReturn {
                reply_code: r.u16()?,
                reply_text: r.short_str()?,
                exchange: r.short_str()?,
                routing_key: r.short_str()?,
            },
            (class::BASIC, class::BASIC_DELIVER) => MethodFrame::BasicDeliver {
                consumer_tag: r.short_str()?,
                delivery_tag: r.u64()?,
                redelivered: r.u8()? & 1 != 0,
                exchange: r.short_str()?,
                routing_key: r.short_str()?,
            },
            (class::BASIC, class::BASIC_GET_OK) => MethodFrame::BasicGetOk {
                delivery_tag: r.u64()?,
                redelivered: r.u8()? & 1 != 0,
                exchange: r.short_str()?,
                routing_key: r.short_str()?,
                message_count: r.u32()?,
            },
            (class::BASIC, class::BASIC_ACK) => MethodFrame::BasicAck {
                delivery_tag: r.u64()?,
                multiple: r.u8()? & 1 != 0,
            },
            (class::BASIC, class::BASIC_REJECT) => MethodFrame::BasicReject {
                delivery_tag: r.u64()?,
                requeue: r.u8()? & 1 != 0,
            },
            (class::BASIC, class::BASIC_NACK) if version.supports_nack() => {
                let delivery_tag = r.u64()?;
                let bits = r.u8()?;
                MethodFrame::BasicNack {
                    delivery_tag,
                    multiple: bits & 1 != 0,
                    requeue: bits & 2 != 0,
                }
            },
            (class::BASIC, class::BASIC_NACK) => {
                return Err(AmqError::MalformedFrame(format!(
                    "basic.nack is not part of AMQP {}",
                    version.name()
                )));
            },
            _ => return Ok(None),
        };

        Ok(Some(method))
    }
}
