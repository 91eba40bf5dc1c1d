//! Channel table of one connection and the collaborator-facing boundary.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::channel::{ChannelSession, ChannelStats, ConsumeOptions, DeliveryOutcome};
use super::returns::{ReturnOutcome, ReturnPath, ReturnReason};
use super::sink::{ChannelSink, FrameSink, OutboundBlock};
use crate::access::{ObjectAttributes, Operation, Subject};
use crate::broker::{Broker, QueueHandle};
use crate::delivery::ReleaseSummary;
use crate::error::{AmqError, Result};
use crate::framing::{reply_code, ContentHeader, Frame, FrameCodec};
use crate::message::{DeliveryProperties, DeliveryTag, Message, PublishInfo};

type SharedChannel = Arc<Mutex<ChannelSession>>;

/// What happened to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Enqueued on this many queues
    Routed(usize),
    /// Sent back to the publisher
    Returned(ReturnReason),
    /// Unroutable and not mandatory; dropped
    Discarded,
}

/// Result of feeding inbound bytes to a connection.
#[derive(Debug, Default)]
pub struct InboundReport {
    /// Bytes consumed; a trailing partial frame is not counted
    pub consumed: usize,
    /// Frames dispatched, successfully or not
    pub frames: usize,
    /// Per-channel failures, in arrival order. Channels hit by a protocol
    /// violation are already closed.
    pub errors: Vec<AmqError>,
}

impl InboundReport {
    /// Whether every frame was handled without error
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One client connection.
///
/// Channels run independently: each call locks only the channel it names.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    broker: Arc<Broker>,
    subject: Subject,
    codec: FrameCodec,
    sink: Arc<ChannelSink>,
    returns: ReturnPath,
    channels: Arc<RwLock<HashMap<u16, SharedChannel>>>,
}

impl Connection {
    /// Connection bound to `broker`; normally built by [`Broker::connect`]
    pub fn new(
        id: Uuid,
        broker: Arc<Broker>,
        subject: Subject,
        sink: Arc<ChannelSink>,
        returns: ReturnPath,
    ) -> Self {
        let codec = broker.codec();
        Self {
            id,
            broker,
            subject,
            codec,
            sink,
            returns,
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Connection id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Authenticated principal
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Negotiated codec
    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Outbound sink shared by every channel
    pub fn sink(&self) -> &Arc<ChannelSink> {
        &self.sink
    }

    /// Open channel `channel`
    pub async fn open_channel(&self, channel: u16) -> Result<()> {
        let channel_max = self.broker.config().broker.channel_max;
        if channel == 0 || channel > channel_max {
            return Err(AmqError::violation(
                channel,
                reply_code::CHANNEL_ERROR,
                format!("channel id must be within 1..={channel_max}"),
            ));
        }

        let mut channels = self.channels.write().await;
        if channels.contains_key(&channel) {
            return Err(AmqError::ChannelExists(channel));
        }
        let sink: Arc<dyn FrameSink> = self.sink.clone();
        let session = ChannelSession::new(
            channel,
            self.subject.clone(),
            self.codec,
            sink,
            self.broker.gate().clone(),
        )
        .with_flow_config(&self.broker.config().flow);
        channels.insert(channel, Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Shared handle to one channel
    pub async fn channel(&self, channel: u16) -> Result<SharedChannel> {
        self.channels
            .read()
            .await
            .get(&channel)
            .cloned()
            .ok_or(AmqError::UnknownChannel(channel))
    }

    /// Open channel ids, sorted
    pub async fn channel_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.channels.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Register a consumer; returns its tag
    pub async fn consume(
        &self,
        channel: u16,
        queue: Arc<dyn QueueHandle>,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<String> {
        let handle = self.channel(channel).await?;
        let result = handle.lock().await.consume(queue, consumer_tag, options);
        result
    }

    /// Cancel a consumer
    pub async fn cancel(&self, channel: u16, consumer_tag: &str) -> Result<()> {
        let handle = self.channel(channel).await?;
        let result = handle.lock().await.cancel(consumer_tag);
        result
    }

    /// Deliver to a consumer. `None` when nothing awaits acknowledgment:
    /// no-ack consumer, deferred, or blocked.
    pub async fn deliver(
        &self,
        message: Arc<Message>,
        props: DeliveryProperties,
        channel: u16,
        consumer_tag: &str,
    ) -> Result<Option<DeliveryTag>> {
        let outcome = self
            .deliver_outcome(message, props, channel, consumer_tag)
            .await?;
        Ok(match outcome {
            DeliveryOutcome::Delivered {
                tag, tracked: true, ..
            } => Some(tag),
            _ => None,
        })
    }

    /// Deliver to a consumer, reporting the full outcome
    pub async fn deliver_outcome(
        &self,
        message: Arc<Message>,
        props: DeliveryProperties,
        channel: u16,
        consumer_tag: &str,
    ) -> Result<DeliveryOutcome> {
        let handle = self.channel(channel).await?;
        let mut session = handle.lock().await;
        let result = session.deliver(message, props, consumer_tag);
        self.forget_if_closed(&session).await;
        result
    }

    /// Answer a basic.get
    pub async fn get_ok(
        &self,
        message: Arc<Message>,
        props: DeliveryProperties,
        queue: Arc<dyn QueueHandle>,
        channel: u16,
        queue_depth_after_get: u32,
    ) -> Result<DeliveryTag> {
        let handle = self.channel(channel).await?;
        let result = handle
            .lock()
            .await
            .get_ok(message, props, queue, queue_depth_after_get);
        result
    }

    /// Send basic.return on `channel` of this connection. Never fails.
    pub fn return_message(
        &self,
        publish_info: &PublishInfo,
        header: &ContentHeader,
        body: &Bytes,
        channel: u16,
        reply_code: u16,
        reply_text: &str,
    ) -> ReturnOutcome {
        self.returns
            .return_message(publish_info, header, body, channel, reply_code, reply_text)
    }

    /// Notify the peer that the broker closed `consumer_tag`
    pub async fn emit_auto_close(&self, channel: u16, consumer_tag: &str) -> Result<()> {
        let handle = self.channel(channel).await?;
        let result = handle.lock().await.emit_auto_close(consumer_tag);
        result
    }

    /// Submit a pre-built frame as-is
    pub fn write_frame(&self, frame: Frame) -> Result<()> {
        self.sink.submit(OutboundBlock::single(frame))
    }

    /// Peer acknowledgment
    pub async fn handle_ack(&self, channel: u16, tag: DeliveryTag, multiple: bool) -> Result<usize> {
        let handle = self.channel(channel).await?;
        let mut session = handle.lock().await;
        let result = session.handle_ack(tag, multiple);
        self.forget_if_closed(&session).await;
        result
    }

    /// Peer rejection; orphaned messages go back to their publishers
    pub async fn handle_reject(&self, channel: u16, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let handle = self.channel(channel).await?;
        let mut session = handle.lock().await;
        let result = session.handle_reject(tag, requeue);
        self.forget_if_closed(&session).await;
        drop(session);
        self.return_orphans(result?);
        Ok(())
    }

    /// Decode and dispatch one inbound frame
    pub async fn handle_frame(&self, frame: &Frame) -> Result<()> {
        let handle = self.channel(frame.channel).await?;
        let mut session = handle.lock().await;
        let result = session.handle_frame(frame);
        self.forget_if_closed(&session).await;
        drop(session);
        self.return_orphans(result?);
        Ok(())
    }

    /// Decode every whole frame in `data` and dispatch it.
    ///
    /// A failure on one channel is recorded and the remaining frames are
    /// still dispatched; only an undecodable frame aborts the read, since
    /// the stream can no longer be delimited. A trailing partial frame is
    /// left for the next read.
    pub async fn handle_bytes(&self, data: &[u8]) -> Result<InboundReport> {
        let mut report = InboundReport::default();
        while let Some((frame, used)) = self.codec.decode_frame(&data[report.consumed..])? {
            report.consumed += used;
            if frame.channel == 0 {
                tracing::debug!("Connection {}: ignoring channel-0 frame", self.id);
                continue;
            }
            report.frames += 1;
            if let Err(e) = self.handle_frame(&frame).await {
                tracing::warn!(
                    "Connection {}: frame on channel {} failed: {}",
                    self.id,
                    frame.channel,
                    e
                );
                report.errors.push(e);
            }
        }
        Ok(report)
    }

    /// Pause or resume delivery on `channel`
    pub async fn set_flow(&self, channel: u16, active: bool) -> Result<Vec<DeliveryOutcome>> {
        let handle = self.channel(channel).await?;
        let mut session = handle.lock().await;
        let result = session.set_flow(active);
        self.forget_if_closed(&session).await;
        result
    }

    /// Route a message published on `channel`.
    ///
    /// Mandatory messages with no route and immediate messages with no
    /// ready consumer go back through the return path.
    pub async fn publish(&self, message: Message, channel: u16) -> Result<PublishOutcome> {
        {
            let handle = self.channel(channel).await?;
            let session = handle.lock().await;
            if session.is_closed() {
                return Err(AmqError::ChannelClosed(channel));
            }
        }

        let object = ObjectAttributes::named(message.exchange())
            .with("routing_key", message.routing_key())
            .with("channel", channel);
        self.broker
            .gate()
            .check(Operation::Publish, &self.subject, &object)?;

        let message = Arc::new(message.published_by(self.id, channel));
        let queues = self.broker.router().route(&message);

        if queues.is_empty() {
            if message.is_mandatory() {
                self.returns.return_for(&message, channel, ReturnReason::NoRoute);
                return Ok(PublishOutcome::Returned(ReturnReason::NoRoute));
            }
            tracing::debug!(
                "Discarding unroutable message {} (exchange='{}', key='{}')",
                message.id(),
                message.exchange(),
                message.routing_key()
            );
            return Ok(PublishOutcome::Discarded);
        }

        if message.is_immediate() && !queues.iter().any(|q| q.has_ready_consumer()) {
            self.returns
                .return_for(&message, channel, ReturnReason::NoConsumers);
            return Ok(PublishOutcome::Returned(ReturnReason::NoConsumers));
        }

        for queue in &queues {
            queue.enqueue(Arc::clone(&message));
        }
        Ok(PublishOutcome::Routed(queues.len()))
    }

    /// Close one channel and drop it from the table
    pub async fn close_channel(&self, channel: u16, requeue_outstanding: bool) -> Result<ReleaseSummary> {
        let handle = self.channel(channel).await?;
        let summary = handle.lock().await.close(requeue_outstanding)?;
        self.channels.write().await.remove(&channel);
        Ok(summary)
    }

    /// Auto-close idle consumers on every channel
    pub async fn reap_idle_consumers(&self) -> Result<usize> {
        let handles: Vec<SharedChannel> = self.channels.read().await.values().cloned().collect();
        let mut reaped = 0;
        for handle in handles {
            reaped += handle.lock().await.reap_idle_consumers()?.len();
        }
        Ok(reaped)
    }

    /// Per-channel statistics, by channel id
    pub async fn stats(&self) -> Vec<ChannelStats> {
        let handles: Vec<SharedChannel> = self.channels.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            stats.push(handle.lock().await.stats());
        }
        stats.sort_by_key(|s| s.channel);
        stats
    }

    /// Close every channel, requeueing outstanding deliveries
    pub async fn close(&self) {
        let drained: Vec<(u16, SharedChannel)> = self.channels.write().await.drain().collect();
        for (id, handle) in drained {
            let mut session = handle.lock().await;
            if session.is_closed() {
                continue;
            }
            if let Err(e) = session.close(true) {
                tracing::warn!("Connection {}: closing channel {} failed: {}", self.id, id, e);
            }
        }
        self.broker.disconnect(self.id);
    }

    async fn forget_if_closed(&self, session: &ChannelSession) {
        if session.is_closed() {
            self.channels.write().await.remove(&session.id());
        }
    }

    fn return_orphans(&self, orphans: Vec<Arc<Message>>) {
        for message in orphans {
            let Some(publisher) = message.publisher() else {
                tracing::debug!("Discarding rejected message {} with no publisher", message.id());
                continue;
            };
            let path = if publisher.connection == self.id {
                Some(self.returns.clone())
            } else {
                self.broker.return_path(publisher.connection)
            };
            match path {
                Some(path) => {
                    path.return_for(&message, publisher.channel, ReturnReason::Rejected);
                },
                None => tracing::debug!(
                    "Publisher of message {} is gone; discarding",
                    message.id()
                ),
            }
        }
    }
}
