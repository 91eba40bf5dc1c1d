//! Message to frame-sequence rendering.

use bytes::Bytes;

use super::frame::{Frame, FrameType, FRAME_OVERHEAD};
use super::method::MethodFrame;
use super::properties::ContentHeader;
use super::{ProtocolVersion, DEFAULT_FRAME_MAX, FRAME_MIN_SIZE};
use crate::error::{AmqError, Result};
use crate::message::{DeliveryProperties, DeliveryTag, Message, PublishInfo};

/// Stateless frame encoder bound to one connection's negotiated limits.
///
/// Every `encode_*` call either returns the complete frame sequence or an
/// error; a partial sequence is never produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    version: ProtocolVersion,
    frame_max: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(ProtocolVersion::default(), DEFAULT_FRAME_MAX)
    }
}

impl FrameCodec {
    /// Create a codec. `frame_max == 0` means no limit; a limit too small to
    /// carry any payload is raised to [`FRAME_MIN_SIZE`].
    pub fn new(version: ProtocolVersion, frame_max: u32) -> Self {
        let frame_max = if frame_max != 0 && frame_max as usize <= FRAME_OVERHEAD {
            FRAME_MIN_SIZE
        } else {
            frame_max
        };
        Self { version, frame_max }
    }

    /// Negotiated protocol version
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Negotiated maximum frame size (0 = unlimited)
    pub fn frame_max(&self) -> u32 {
        self.frame_max
    }

    /// Largest payload one frame can carry
    pub fn max_payload(&self) -> usize {
        if self.frame_max == 0 {
            usize::MAX
        } else {
            self.frame_max as usize - FRAME_OVERHEAD
        }
    }

    /// Number of body frames a body of `len` bytes is split into
    pub fn body_frame_count(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else {
            len.div_ceil(self.max_payload())
        }
    }

    /// Encode a single method frame.
    pub fn encode_method(&self, channel: u16, method: &MethodFrame) -> Result<Frame> {
        let payload = method.encode()?;
        self.check_payload(&payload, method.name())?;
        Ok(Frame::method(channel, payload))
    }

    /// basic.deliver + header + body frames
    pub fn encode_deliver(
        &self,
        message: &Message,
        props: DeliveryProperties,
        channel: u16,
        delivery_tag: DeliveryTag,
        consumer_tag: &str,
    ) -> Result<Vec<Frame>> {
        let method = MethodFrame::BasicDeliver {
            consumer_tag: consumer_tag.to_string(),
            delivery_tag,
            redelivered: props.redelivered,
            exchange: message.exchange().to_string(),
            routing_key: message.routing_key().to_string(),
        };
        self.encode_content(channel, &method, &message.content_header(), message.body())
    }

    /// basic.get-ok + header + body frames
    pub fn encode_get_ok(
        &self,
        message: &Message,
        props: DeliveryProperties,
        channel: u16,
        delivery_tag: DeliveryTag,
        queue_depth_after_get: u32,
    ) -> Result<Vec<Frame>> {
        let method = MethodFrame::BasicGetOk {
            delivery_tag,
            redelivered: props.redelivered,
            exchange: message.exchange().to_string(),
            routing_key: message.routing_key().to_string(),
            message_count: queue_depth_after_get,
        };
        self.encode_content(channel, &method, &message.content_header(), message.body())
    }

    /// basic.return + header + body frames
    pub fn encode_return(
        &self,
        publish_info: &PublishInfo,
        header: &ContentHeader,
        body: &Bytes,
        channel: u16,
        reply_code: u16,
        reply_text: &str,
    ) -> Result<Vec<Frame>> {
        let method = MethodFrame::BasicReturn {
            reply_code,
            reply_text: reply_text.to_string(),
            exchange: publish_info.exchange.clone(),
            routing_key: publish_info.routing_key.clone(),
        };
        self.encode_content(channel, &method, header, body)
    }

    /// Notification that the broker cancelled `consumer_tag`.
    pub fn encode_consumer_auto_close(&self, channel: u16, consumer_tag: &str) -> Result<Frame> {
        self.encode_method(
            channel,
            &MethodFrame::BasicCancelOk {
                consumer_tag: consumer_tag.to_string(),
            },
        )
    }

    /// Decode one inbound frame from the front of `data`.
    pub fn decode_frame(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        Frame::decode(data, self.frame_max)
    }

    /// Decode the method carried by `frame`, if it is one the core handles.
    pub fn decode_method(&self, frame: &Frame) -> Result<Option<MethodFrame>> {
        if frame.kind != FrameType::Method {
            return Ok(None);
        }
        MethodFrame::decode(&frame.payload, self.version)
    }

    fn encode_content(
        &self,
        channel: u16,
        method: &MethodFrame,
        header: &ContentHeader,
        body: &Bytes,
    ) -> Result<Vec<Frame>> {
        if header.body_size != body.len() as u64 {
            return Err(AmqError::Encoding(format!(
                "content header announces {} bytes but body has {}",
                header.body_size,
                body.len()
            )));
        }

        let method_frame = self.encode_method(channel, method)?;
        let header_payload = header.encode()?;
        self.check_payload(&header_payload, "content header")?;

        let chunk = self.max_payload();
        let mut frames = Vec::with_capacity(2 + self.body_frame_count(body.len()));
        frames.push(method_frame);
        frames.push(Frame::header(channel, header_payload));

        let mut offset = 0;
        while offset < body.len() {
            let end = offset.saturating_add(chunk).min(body.len());
            frames.push(Frame::body(channel, body.slice(offset..end)));
            offset = end;
        }

        Ok(frames)
    }

    fn check_payload(&self, payload: &Bytes, what: &str) -> Result<()> {
        if payload.len() > self.max_payload() {
            return Err(AmqError::Encoding(format!(
                "{what} of {} bytes exceeds frame max {}",
                payload.len(),
                self.frame_max
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::BasicProperties;

    fn message(body: &[u8]) -> Message {
        Message::new("amq.direct", "orders", Bytes::copy_from_slice(body))
    }

    #[test]
    fn test_small_deliver_is_three_frames() {
        let codec = FrameCodec::default();
        let frames = codec
            .encode_deliver(&message(b"hello"), DeliveryProperties::default(), 3, 1, "c1")
            .unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].kind, FrameType::Method);
        assert_eq!(frames[1].kind, FrameType::Header);
        assert_eq!(frames[2].kind, FrameType::Body);
        assert!(frames.iter().all(|f| f.channel == 3));

        let method = codec.decode_method(&frames[0]).unwrap().unwrap();
        assert!(matches!(
            method,
            MethodFrame::BasicDeliver { delivery_tag: 1, ref consumer_tag, .. } if consumer_tag == "c1"
        ));
    }

    #[test]
    fn test_body_split_in_order() {
        let codec = FrameCodec::new(ProtocolVersion::V0_8, 4096);
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let frames = codec
            .encode_deliver(&message(&body), DeliveryProperties::default(), 1, 9, "c")
            .unwrap();

        let chunk = 4096 - FRAME_OVERHEAD;
        assert_eq!(frames.len(), 2 + body.len().div_ceil(chunk));
        assert!(frames[2..].iter().all(|f| f.encoded_len() <= 4096));

        let reassembled: Vec<u8> = frames[2..]
            .iter()
            .flat_map(|f| f.payload.iter().copied())
            .collect();
        assert_eq!(reassembled, body);
    }

    #[test]
    fn test_empty_body_has_no_body_frames() {
        let codec = FrameCodec::default();
        let frames = codec
            .encode_get_ok(&message(b""), DeliveryProperties::default(), 2, 1, 0)
            .unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_get_ok_carries_queue_depth() {
        let codec = FrameCodec::default();
        let frames = codec
            .encode_get_ok(&message(b"x"), DeliveryProperties { redelivered: true }, 2, 4, 17)
            .unwrap();
        let method = codec.decode_method(&frames[0]).unwrap().unwrap();
        assert_eq!(
            method,
            MethodFrame::BasicGetOk {
                delivery_tag: 4,
                redelivered: true,
                exchange: "amq.direct".to_string(),
                routing_key: "orders".to_string(),
                message_count: 17,
            }
        );
    }

    #[test]
    fn test_return_uses_publish_info() {
        let codec = FrameCodec::default();
        let msg = message(b"lost").mandatory(true);
        let frames = codec
            .encode_return(
                &msg.publish_info(),
                &msg.content_header(),
                msg.body(),
                7,
                312,
                "NO_ROUTE",
            )
            .unwrap();
        assert_eq!(frames.len(), 3);
        let method = codec.decode_method(&frames[0]).unwrap().unwrap();
        assert!(matches!(method, MethodFrame::BasicReturn { reply_code: 312, .. }));
    }

    #[test]
    fn test_oversized_header_emits_nothing() {
        let codec = FrameCodec::new(ProtocolVersion::V0_8, 4096);
        let mut props = BasicProperties::default();
        for i in 0..200 {
            props = props.with_header(format!("header-{i}"), "x".repeat(40));
        }
        let msg = message(b"body").with_properties(props);
        let result = codec.encode_deliver(&msg, DeliveryProperties::default(), 1, 1, "c");
        assert!(matches!(result, Err(AmqError::Encoding(_))));
    }

    #[test]
    fn test_oversized_consumer_tag_fails() {
        let codec = FrameCodec::default();
        assert!(codec.encode_consumer_auto_close(1, &"t".repeat(256)).is_err());
        let frame = codec.encode_consumer_auto_close(1, "c1").unwrap();
        assert_eq!(
            codec.decode_method(&frame).unwrap(),
            Some(MethodFrame::BasicCancelOk {
                consumer_tag: "c1".to_string()
            })
        );
    }

    #[test]
    fn test_tiny_frame_max_is_raised() {
        let codec = FrameCodec::new(ProtocolVersion::V0_8, 4);
        assert_eq!(codec.frame_max(), FRAME_MIN_SIZE);
        assert_eq!(FrameCodec::new(ProtocolVersion::V0_8, 0).max_payload(), usize::MAX);
    }
}
