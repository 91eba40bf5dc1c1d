//! Undeliverable-message notifications to publishers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::sink::{FrameSink, OutboundBlock};
use crate::framing::{reply_code, ContentHeader, FrameCodec};
use crate::message::{Message, PublishInfo};

/// Why a message goes back to its publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnReason {
    /// Mandatory message matched no queue
    NoRoute,
    /// Immediate message found no ready consumer
    NoConsumers,
    /// Consumer rejected it and no other consumer can take it
    Rejected,
}

impl ReturnReason {
    /// Reply code sent in basic.return
    pub fn reply_code(&self) -> u16 {
        match self {
            Self::NoRoute => reply_code::NO_ROUTE,
            Self::NoConsumers | Self::Rejected => reply_code::NO_CONSUMERS,
        }
    }

    /// Reply text sent in basic.return
    pub fn reply_text(&self) -> &'static str {
        match self {
            Self::NoRoute => "NO_ROUTE",
            Self::NoConsumers => "NO_CONSUMERS",
            Self::Rejected => "NO_CONSUMERS: rejected by consumer",
        }
    }
}

/// Result of one return attempt. Never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// basic.return frames were handed to the sink
    Returned {
        /// Frames submitted
        frames: usize,
    },
    /// Encoding or the sink failed; logged and counted
    Failed,
}

#[derive(Debug, Default)]
struct ReturnCounters {
    returned: AtomicU64,
    failed: AtomicU64,
}

/// Counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReturnStats {
    /// Messages returned
    pub returned: u64,
    /// Returns that could not be sent
    pub failed: u64,
}

/// Sends basic.return to a publisher's connection.
///
/// Clones share the sink and the counters.
#[derive(Debug, Clone)]
pub struct ReturnPath {
    codec: FrameCodec,
    sink: Arc<dyn FrameSink>,
    counters: Arc<ReturnCounters>,
}

impl ReturnPath {
    /// Return path writing to `sink`
    pub fn new(codec: FrameCodec, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            codec,
            sink,
            counters: Arc::new(ReturnCounters::default()),
        }
    }

    /// Encode and emit basic.return on the publisher's `channel`.
    pub fn return_message(
        &self,
        publish_info: &PublishInfo,
        header: &ContentHeader,
        body: &Bytes,
        channel: u16,
        reply_code: u16,
        reply_text: &str,
    ) -> ReturnOutcome {
        let frames = match self
            .codec
            .encode_return(publish_info, header, body, channel, reply_code, reply_text)
        {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(
                    "Could not encode basic.return on channel {} ({}): {}",
                    channel,
                    reply_code,
                    e
                );
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return ReturnOutcome::Failed;
            },
        };

        let count = frames.len();
        match self.sink.submit(OutboundBlock::new(channel, frames)) {
            Ok(()) => {
                tracing::debug!(
                    "Returned message to channel {} ({} {}) exchange='{}' key='{}'",
                    channel,
                    reply_code,
                    reply_text,
                    publish_info.exchange,
                    publish_info.routing_key
                );
                self.counters.returned.fetch_add(1, Ordering::Relaxed);
                ReturnOutcome::Returned { frames: count }
            },
            Err(e) => {
                tracing::warn!("Could not send basic.return on channel {}: {}", channel, e);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                ReturnOutcome::Failed
            },
        }
    }

    /// Return a whole message for `reason`
    pub fn return_for(&self, message: &Message, channel: u16, reason: ReturnReason) -> ReturnOutcome {
        self.return_message(
            &message.publish_info(),
            &message.content_header(),
            message.body(),
            channel,
            reason.reply_code(),
            reason.reply_text(),
        )
    }

    /// Counters snapshot
    pub fn stats(&self) -> ReturnStats {
        ReturnStats {
            returned: self.counters.returned.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{BasicProperties, FrameType, MethodFrame};
    use crate::session::ChannelSink;

    #[test]
    fn test_no_route_return() {
        let (sink, mut rx) = ChannelSink::pair();
        let path = ReturnPath::new(FrameCodec::default(), Arc::new(sink));
        let msg = Message::new("amq.direct", "nowhere", "payload").mandatory(true);

        let outcome = path.return_for(&msg, 4, ReturnReason::NoRoute);
        assert_eq!(outcome, ReturnOutcome::Returned { frames: 3 });

        let block = rx.try_recv().unwrap();
        assert_eq!(block.channel, 4);
        assert_eq!(block.frames[1].kind, FrameType::Header);
        let method = FrameCodec::default().decode_method(&block.frames[0]).unwrap();
        assert!(matches!(
            method,
            Some(MethodFrame::BasicReturn { reply_code: 312, ref routing_key, .. }) if routing_key == "nowhere"
        ));
        assert_eq!(path.stats().returned, 1);
    }

    #[test]
    fn test_encode_failure_is_counted_not_raised() {
        let (sink, mut rx) = ChannelSink::pair();
        let path = ReturnPath::new(FrameCodec::default(), Arc::new(sink));
        let props = BasicProperties::default().with_message_id(&"x".repeat(300));
        let msg = Message::new("", "q", "b").with_properties(props);

        assert_eq!(path.return_for(&msg, 1, ReturnReason::NoConsumers), ReturnOutcome::Failed);
        assert!(rx.try_recv().is_err());
        assert_eq!(path.stats(), ReturnStats { returned: 0, failed: 1 });
    }

    #[test]
    fn test_closed_sink_is_counted() {
        let (sink, rx) = ChannelSink::pair();
        drop(rx);
        let path = ReturnPath::new(FrameCodec::default(), Arc::new(sink));
        let clone = path.clone();

        let msg = Message::new("", "q", "b");
        assert_eq!(path.return_for(&msg, 1, ReturnReason::Rejected), ReturnOutcome::Failed);
        assert_eq!(clone.stats().failed, 1);
    }
}
