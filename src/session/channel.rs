//! Per-channel session state machine.
//!
//! ```text
//!            set_flow(false)
//!   ┌──────┐ ─────────────► ┌──────────────┐
//!   │ OPEN │                │ FLOW-STOPPED │   deliveries queue up,
//!   └──────┘ ◄───────────── └──────────────┘   acks keep flowing
//!      │      set_flow(true)        │
//!      │ close / violation          │
//!      ▼                            ▼
//!   ┌─────────┐  release_all  ┌────────┐
//!   │ CLOSING │ ────────────► │ CLOSED │
//!   └─────────┘               └────────┘
//! ```
//!
//! Every outbound delivery is authorized, encoded, handed to the sink, and
//! only then given a tag and tracked. A failure at any step leaves the
//! tracker and the flow controller untouched.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::sink::{FrameSink, OutboundBlock};
use crate::access::{AccessControlGate, ObjectAttributes, Operation, Subject};
use crate::broker::QueueHandle;
use crate::config::FlowConfig;
use crate::delivery::{
    ConsumerFlowController, ConsumerId, ConsumerState, CreditLimit, CreditOutcome, DeliveryTracker,
    ReleaseSummary, TrackedDelivery,
};
use crate::error::{AmqError, Result};
use crate::framing::{reply_code, Frame, FrameCodec, FrameType, MethodFrame};
use crate::message::{DeliveryProperties, DeliveryTag, Message};

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelState {
    /// Delivering normally
    Open,
    /// Peer asked to pause content delivery
    FlowStopped,
    /// Teardown in progress
    Closing,
    /// Terminal; holds no deliveries or consumers
    Closed,
}

/// Per-consumer options for [`ChannelSession::consume`].
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Deliveries need no acknowledgment
    pub no_ack: bool,
    /// Override the channel default auto-close flag
    pub auto_close: Option<bool>,
    /// Override the channel default prefetch window
    pub limit: Option<CreditLimit>,
}

impl ConsumeOptions {
    /// No-ack consumer
    pub fn no_ack() -> Self {
        Self {
            no_ack: true,
            ..Self::default()
        }
    }

    /// Set the prefetch window
    pub fn with_limit(mut self, limit: CreditLimit) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set auto-close on window exhaustion
    pub fn with_auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = Some(auto_close);
        self
    }
}

/// What happened to one delivery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Frames were handed to the sink
    Delivered {
        /// Tag sent with basic.deliver
        tag: DeliveryTag,
        /// Wire bytes submitted
        bytes: usize,
        /// Tag awaits acknowledgment (false for no-ack consumers)
        tracked: bool,
    },
    /// Channel is flow-stopped; queued until flow resumes
    Deferred,
    /// Consumer has no credit; message untouched
    Blocked,
}

#[derive(Debug)]
struct PendingDelivery {
    message: Arc<Message>,
    props: DeliveryProperties,
    consumer_tag: String,
    queue: Arc<dyn QueueHandle>,
}

/// Channel statistics
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    /// Channel id
    pub channel: u16,
    /// Current state
    pub state: ChannelState,
    /// Registered consumers
    pub consumers: usize,
    /// Unacknowledged deliveries
    pub outstanding: usize,
    /// Deliveries waiting for flow to resume
    pub pending: usize,
    /// Deliveries sent (including basic.get-ok)
    pub delivered: u64,
    /// Deliveries acknowledged
    pub acknowledged: u64,
    /// Deliveries rejected or nacked
    pub rejected: u64,
    /// Seconds since the channel opened
    pub uptime_secs: u64,
}

/// One logical channel.
#[derive(Debug)]
pub struct ChannelSession {
    id: u16,
    state: ChannelState,
    subject: Subject,
    codec: FrameCodec,
    sink: Arc<dyn FrameSink>,
    gate: AccessControlGate,
    tracker: DeliveryTracker,
    flow: ConsumerFlowController,
    default_limit: CreditLimit,
    default_auto_close: bool,
    pending: VecDeque<PendingDelivery>,
    delivered: u64,
    acknowledged: u64,
    rejected: u64,
    opened_at: Instant,
}

impl ChannelSession {
    /// Open channel `id` for `subject`
    pub fn new(
        id: u16,
        subject: Subject,
        codec: FrameCodec,
        sink: Arc<dyn FrameSink>,
        gate: AccessControlGate,
    ) -> Self {
        tracing::info!("Channel {} opened for {}", id, subject.user);
        Self {
            id,
            state: ChannelState::Open,
            subject,
            codec,
            sink,
            gate,
            tracker: DeliveryTracker::new(id),
            flow: ConsumerFlowController::new(),
            default_limit: CreditLimit::unlimited(),
            default_auto_close: false,
            pending: VecDeque::new(),
            delivered: 0,
            acknowledged: 0,
            rejected: 0,
            opened_at: Instant::now(),
        }
    }

    /// Apply consumer flow defaults
    pub fn with_flow_config(mut self, config: &FlowConfig) -> Self {
        self.default_limit = config.credit_limit();
        self.default_auto_close = config.auto_close;
        self.flow = std::mem::take(&mut self.flow).with_idle_timeout(config.idle_timeout());
        self
    }

    /// Channel id
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Lifecycle state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether the channel reached CLOSED
    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// Outstanding-delivery table
    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    /// Consumer credit windows
    pub fn flow(&self) -> &ConsumerFlowController {
        &self.flow
    }

    /// Register a consumer on `queue`. An empty tag gets a generated one.
    pub fn consume(
        &mut self,
        queue: Arc<dyn QueueHandle>,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<String> {
        self.ensure_usable()?;
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", uuid::Uuid::new_v4())
        } else {
            consumer_tag.to_string()
        };

        let object = self.object(queue.name()).with("consumer", &tag);
        self.gate.check(Operation::Consume, &self.subject, &object)?;

        let state = ConsumerState::new(&tag, Arc::clone(&queue), options.limit.unwrap_or(self.default_limit))
            .with_auto_close(options.auto_close.unwrap_or(self.default_auto_close))
            .with_no_ack(options.no_ack);
        self.flow.register(state)?;
        queue.consumer_added();

        tracing::info!(
            "Channel {}: consumer '{}' on '{}' (no_ack={})",
            self.id,
            tag,
            queue.name(),
            options.no_ack
        );
        Ok(tag)
    }

    /// Remove a consumer. Its unacknowledged deliveries stay tracked.
    pub fn cancel(&mut self, consumer_tag: &str) -> Result<()> {
        if self.state == ChannelState::Closed {
            return Err(AmqError::ChannelClosed(self.id));
        }
        let consumer = self
            .flow
            .remove(consumer_tag)
            .ok_or_else(|| AmqError::UnknownConsumer(consumer_tag.to_string()))?;
        if consumer.is_active() {
            consumer.queue().consumer_removed();
        }
        let requeued = self.requeue_pending(|p| p.consumer_tag == consumer_tag);

        tracing::info!(
            "Channel {}: consumer '{}' cancelled ({} pending requeued)",
            self.id,
            consumer_tag,
            requeued
        );
        Ok(())
    }

    /// Push `message` to `consumer_tag`.
    pub fn deliver(
        &mut self,
        message: Arc<Message>,
        props: DeliveryProperties,
        consumer_tag: &str,
    ) -> Result<DeliveryOutcome> {
        self.ensure_usable()?;
        let consumer = self
            .flow
            .get(consumer_tag)
            .ok_or_else(|| AmqError::UnknownConsumer(consumer_tag.to_string()))?;
        if !consumer.is_active() {
            return Err(AmqError::ConsumerClosed(consumer_tag.to_string()));
        }
        let queue = Arc::clone(consumer.queue());

        let object = self.object(queue.name()).with("consumer", consumer_tag);
        self.gate.check(Operation::Deliver, &self.subject, &object)?;

        if self.state == ChannelState::FlowStopped {
            tracing::debug!(
                "Channel {}: flow stopped, deferring message {} for '{}'",
                self.id,
                message.id(),
                consumer_tag
            );
            self.pending.push_back(PendingDelivery {
                message,
                props,
                consumer_tag: consumer_tag.to_string(),
                queue,
            });
            return Ok(DeliveryOutcome::Deferred);
        }

        self.send_delivery(message, props, consumer_tag, queue)
    }

    /// Answer a basic.get with `message`; not paused by flow control.
    pub fn get_ok(
        &mut self,
        message: Arc<Message>,
        props: DeliveryProperties,
        queue: Arc<dyn QueueHandle>,
        queue_depth_after_get: u32,
    ) -> Result<DeliveryTag> {
        self.ensure_usable()?;
        let object = self.object(queue.name());
        self.gate.check(Operation::Get, &self.subject, &object)?;

        let tag = self.tracker.peek_next_tag();
        let frames = self
            .codec
            .encode_get_ok(&message, props, self.id, tag, queue_depth_after_get)?;
        self.sink.submit(OutboundBlock::new(self.id, frames))?;

        let tag = self.tracker.next_tag();
        self.tracker.track(tag, message, None, queue)?;
        self.delivered += 1;
        tracing::debug!("Channel {}: get-ok tag {}", self.id, tag);
        Ok(tag)
    }

    /// Peer acknowledged `tag`. Returns how many deliveries were settled.
    pub fn handle_ack(&mut self, tag: DeliveryTag, multiple: bool) -> Result<usize> {
        self.ensure_usable()?;
        let settled = match self.tracker.acknowledge(tag, multiple) {
            Ok(settled) => settled,
            Err(e) => return Err(self.fail(e)),
        };
        self.return_credit(&settled);
        self.acknowledged += settled.len() as u64;
        Ok(settled.len())
    }

    /// Peer rejected `tag`.
    ///
    /// Returns the messages that were discarded with nowhere else to go;
    /// the caller sends them back to their publishers.
    pub fn handle_reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<Vec<Arc<Message>>> {
        self.ensure_usable()?;
        let entry = match self.tracker.reject(tag, requeue) {
            Ok(entry) => entry,
            Err(e) => return Err(self.fail(e)),
        };
        Ok(self.settle_rejected(vec![entry], requeue))
    }

    /// Peer nacked `tag` (0-9-1 only). Same result as [`handle_reject`](Self::handle_reject).
    pub fn handle_nack(
        &mut self,
        tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<Vec<Arc<Message>>> {
        self.ensure_usable()?;
        if !self.codec.version().supports_nack() {
            let err = AmqError::violation(
                self.id,
                reply_code::NOT_IMPLEMENTED,
                format!("basic.nack is not part of {}", self.codec.version()),
            );
            return Err(self.fail(err));
        }
        let rejected = match self.tracker.reject_up_to(tag, multiple, requeue) {
            Ok(rejected) => rejected,
            Err(e) => return Err(self.fail(e)),
        };
        Ok(self.settle_rejected(rejected, requeue))
    }

    /// Pause or resume content delivery, answering with channel.flow-ok.
    ///
    /// Resuming drains deferred deliveries in order; the outcome of each is
    /// returned.
    pub fn set_flow(&mut self, active: bool) -> Result<Vec<DeliveryOutcome>> {
        self.ensure_usable()?;
        let mut outcomes = Vec::new();

        match (active, self.state) {
            (false, ChannelState::Open) => {
                self.state = ChannelState::FlowStopped;
                tracing::info!("Channel {}: flow stopped", self.id);
            },
            (true, ChannelState::FlowStopped) => {
                self.state = ChannelState::Open;
                tracing::info!(
                    "Channel {}: flow resumed, {} deferred deliveries",
                    self.id,
                    self.pending.len()
                );
                outcomes = self.drain_pending()?;
            },
            _ => {},
        }

        self.write_frame(self.codec.encode_method(self.id, &MethodFrame::ChannelFlowOk { active })?)?;
        Ok(outcomes)
    }

    /// Tell the peer `consumer_tag` was closed by the broker and stop
    /// delivering to it. A no-op for an already inactive consumer.
    pub fn emit_auto_close(&mut self, consumer_tag: &str) -> Result<()> {
        if self.state == ChannelState::Closed {
            return Err(AmqError::ChannelClosed(self.id));
        }
        let consumer = self
            .flow
            .get(consumer_tag)
            .ok_or_else(|| AmqError::UnknownConsumer(consumer_tag.to_string()))?;
        if !consumer.is_active() {
            return Ok(());
        }
        let queue = Arc::clone(consumer.queue());

        let frame = self.codec.encode_consumer_auto_close(self.id, consumer_tag)?;
        self.sink.submit(OutboundBlock::single(frame))?;
        self.flow.deactivate(consumer_tag);
        queue.consumer_removed();
        self.requeue_pending(|p| p.consumer_tag == consumer_tag);

        tracing::info!("Channel {}: consumer '{}' auto-closed", self.id, consumer_tag);
        Ok(())
    }

    /// Auto-close consumers idle past the configured timeout
    pub fn reap_idle_consumers(&mut self) -> Result<Vec<String>> {
        let idle = self.flow.idle_consumers(Instant::now());
        for tag in &idle {
            self.emit_auto_close(tag)?;
        }
        Ok(idle)
    }

    /// Submit a pre-built frame for this channel
    pub fn write_frame(&self, frame: Frame) -> Result<()> {
        if self.state == ChannelState::Closed {
            return Err(AmqError::ChannelClosed(self.id));
        }
        self.sink.submit(OutboundBlock::single(frame))
    }

    /// Close the channel, resolving every outstanding delivery.
    ///
    /// Deferred deliveries were never sent and always go back to their
    /// queues unmarked.
    pub fn close(&mut self, requeue_outstanding: bool) -> Result<ReleaseSummary> {
        if matches!(self.state, ChannelState::Closing | ChannelState::Closed) {
            return Err(AmqError::ChannelClosed(self.id));
        }
        let object = self.object(&format!("channel-{}", self.id));
        self.gate.check(Operation::CloseChannel, &self.subject, &object)?;

        self.state = ChannelState::Closing;
        let summary = self.teardown(requeue_outstanding);
        self.state = ChannelState::Closed;

        tracing::info!(
            "Channel {} closed (requeued={}, dropped={})",
            self.id,
            summary.requeued,
            summary.dropped
        );
        Ok(summary)
    }

    /// Dispatch one inbound frame.
    ///
    /// Returns messages rejected with nowhere else to go, as
    /// [`handle_reject`](Self::handle_reject) does.
    pub fn handle_frame(&mut self, frame: &Frame) -> Result<Vec<Arc<Message>>> {
        if frame.channel != self.id {
            return Err(AmqError::UnknownChannel(frame.channel));
        }
        if frame.kind != FrameType::Method {
            let err = AmqError::violation(
                self.id,
                reply_code::UNEXPECTED_FRAME,
                format!("unexpected {:?} frame", frame.kind),
            );
            return Err(self.fail(err));
        }

        let method = match self.codec.decode_method(frame) {
            Ok(Some(method)) => method,
            Ok(None) => {
                tracing::debug!("Channel {}: method not handled by the core", self.id);
                return Ok(Vec::new());
            },
            Err(e) => return Err(self.fail(e)),
        };

        match method {
            MethodFrame::BasicAck {
                delivery_tag,
                multiple,
            } => {
                self.handle_ack(delivery_tag, multiple)?;
                Ok(Vec::new())
            },
            MethodFrame::BasicReject {
                delivery_tag,
                requeue,
            } => self.handle_reject(delivery_tag, requeue),
            MethodFrame::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => self.handle_nack(delivery_tag, multiple, requeue),
            MethodFrame::ChannelFlow { active } => {
                self.set_flow(active)?;
                Ok(Vec::new())
            },
            MethodFrame::ChannelClose {
                reply_code,
                reply_text,
                ..
            } => {
                tracing::info!(
                    "Channel {}: peer closed ({} {})",
                    self.id,
                    reply_code,
                    reply_text
                );
                self.close(true)?;
                self.sink.submit(OutboundBlock::single(
                    self.codec.encode_method(self.id, &MethodFrame::ChannelCloseOk)?,
                ))?;
                Ok(Vec::new())
            },
            MethodFrame::ChannelFlowOk { .. } | MethodFrame::ChannelCloseOk => Ok(Vec::new()),
            other => {
                let err = AmqError::violation(
                    self.id,
                    reply_code::COMMAND_INVALID,
                    format!("{} is not valid from a client", other.name()),
                );
                Err(self.fail(err))
            },
        }
    }

    /// Snapshot of channel counters
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            channel: self.id,
            state: self.state,
            consumers: self.flow.len(),
            outstanding: self.tracker.outstanding_count(),
            pending: self.pending.len(),
            delivered: self.delivered,
            acknowledged: self.acknowledged,
            rejected: self.rejected,
            uptime_secs: self.opened_at.elapsed().as_secs(),
        }
    }

    fn send_delivery(
        &mut self,
        message: Arc<Message>,
        props: DeliveryProperties,
        consumer_tag: &str,
        queue: Arc<dyn QueueHandle>,
    ) -> Result<DeliveryOutcome> {
        let size = message.size() as u64;
        if !self.flow.can_accept(consumer_tag, size) {
            tracing::debug!(
                "Channel {}: consumer '{}' has no credit for {} bytes",
                self.id,
                consumer_tag,
                size
            );
            return Ok(DeliveryOutcome::Blocked);
        }
        let (no_ack, consumer_id) = self
            .flow
            .get(consumer_tag)
            .map(|c| (c.no_ack(), c.id()))
            .ok_or_else(|| AmqError::UnknownConsumer(consumer_tag.to_string()))?;

        let tag = self.tracker.peek_next_tag();
        let frames = self
            .codec
            .encode_deliver(&message, props, self.id, tag, consumer_tag)?;
        let block = OutboundBlock::new(self.id, frames);
        let bytes = block.encoded_len();
        self.sink.submit(block)?;

        let tag = self.tracker.next_tag();
        if !no_ack {
            self.tracker
                .track(tag, Arc::clone(&message), Some((consumer_tag, consumer_id)), queue)?;
        }
        let credit = self.flow.on_delivered(consumer_tag, size)?;
        self.delivered += 1;
        tracing::debug!(
            "Channel {}: deliver tag {} message {} to '{}' ({} bytes)",
            self.id,
            tag,
            message.id(),
            consumer_tag,
            bytes
        );

        if credit == CreditOutcome::AutoClose {
            // The delivery is already on its way; report it even if the
            // notification cannot follow.
            if let Err(e) = self.emit_auto_close(consumer_tag) {
                tracing::warn!(
                    "Channel {}: auto-close of '{}' failed: {}",
                    self.id,
                    consumer_tag,
                    e
                );
            }
        }
        Ok(DeliveryOutcome::Delivered {
            tag,
            bytes,
            tracked: !no_ack,
        })
    }

    fn drain_pending(&mut self) -> Result<Vec<DeliveryOutcome>> {
        let mut outcomes = Vec::with_capacity(self.pending.len());
        while let Some(pending) = self.pending.pop_front() {
            if self.state != ChannelState::Open {
                self.pending.push_front(pending);
                break;
            }
            let active = self
                .flow
                .get(&pending.consumer_tag)
                .is_some_and(ConsumerState::is_active);
            if !active {
                pending
                    .queue
                    .requeue(pending.message, pending.props.redelivered);
                continue;
            }

            let PendingDelivery {
                message,
                props,
                consumer_tag,
                queue,
            } = pending;
            match self.send_delivery(Arc::clone(&message), props, &consumer_tag, Arc::clone(&queue)) {
                Ok(DeliveryOutcome::Blocked) => {
                    queue.requeue(message, props.redelivered);
                    outcomes.push(DeliveryOutcome::Blocked);
                },
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    queue.requeue(message, props.redelivered);
                    if e.is_channel_fatal() {
                        return Err(self.fail(e));
                    }
                    tracing::warn!(
                        "Channel {}: deferred delivery to '{}' failed: {}",
                        self.id,
                        consumer_tag,
                        e
                    );
                },
            }
        }
        Ok(outcomes)
    }

    fn settle_rejected(&mut self, rejected: Vec<TrackedDelivery>, requeued: bool) -> Vec<Arc<Message>> {
        self.return_credit(&rejected);
        self.rejected += rejected.len() as u64;
        if requeued {
            return Vec::new();
        }

        let mut orphans = Vec::new();
        for entry in rejected {
            let own = entry
                .consumer_tag
                .as_deref()
                .and_then(|tag| self.flow.get(tag))
                .is_some_and(|c| {
                    c.is_active()
                        && Some(c.id()) == entry.consumer_id
                        && c.queue().name() == entry.queue.name()
                });
            let others = entry.queue.ready_consumers().saturating_sub(usize::from(own));

            if others > 0 {
                entry.queue.requeue(entry.message, true);
            } else {
                tracing::debug!(
                    "Channel {}: message {} rejected with no other consumer on '{}'",
                    self.id,
                    entry.message.id(),
                    entry.queue.name()
                );
                orphans.push(entry.message);
            }
        }
        orphans
    }

    fn return_credit(&mut self, settled: &[TrackedDelivery]) {
        let mut per_consumer: HashMap<(&str, ConsumerId), (u32, u64)> = HashMap::new();
        for delivery in settled {
            if let (Some(tag), Some(id)) = (delivery.consumer_tag.as_deref(), delivery.consumer_id) {
                let credit = per_consumer.entry((tag, id)).or_default();
                credit.0 += 1;
                credit.1 += delivery.size();
            }
        }
        for ((tag, id), (count, bytes)) in per_consumer {
            self.flow.on_acknowledged(tag, id, count, bytes);
        }
    }

    fn requeue_pending(&mut self, select: impl Fn(&PendingDelivery) -> bool) -> usize {
        let (matched, kept): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|p| select(p));
        self.pending = kept;
        let count = matched.len();
        for p in matched {
            p.queue.requeue(p.message, p.props.redelivered);
        }
        count
    }

    fn teardown(&mut self, requeue: bool) -> ReleaseSummary {
        self.requeue_pending(|_| true);
        let summary = self.tracker.release_all(requeue);
        for consumer in self.flow.clear() {
            if consumer.is_active() {
                consumer.queue().consumer_removed();
            }
        }
        summary
    }

    /// Tear the channel down after a fatal error and hand the error back.
    fn fail(&mut self, err: AmqError) -> AmqError {
        if !err.is_channel_fatal() || self.state == ChannelState::Closed {
            return err;
        }
        tracing::warn!("Channel {}: {}; closing", self.id, err);

        self.state = ChannelState::Closing;
        let summary = self.teardown(true);
        self.state = ChannelState::Closed;

        let close = MethodFrame::ChannelClose {
            reply_code: err.reply_code(),
            reply_text: err.to_string(),
            class_id: 0,
            method_id: 0,
        };
        let sent = self
            .codec
            .encode_method(self.id, &close)
            .and_then(|frame| self.sink.submit(OutboundBlock::single(frame)));
        if let Err(e) = sent {
            tracing::debug!("Channel {}: could not send channel.close: {}", self.id, e);
        }
        tracing::debug!(
            "Channel {}: {} deliveries requeued after violation",
            self.id,
            summary.requeued
        );
        err
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            ChannelState::Open | ChannelState::FlowStopped => Ok(()),
            ChannelState::Closing | ChannelState::Closed => Err(AmqError::ChannelClosed(self.id)),
        }
    }

    fn object(&self, name: &str) -> ObjectAttributes {
        ObjectAttributes::named(name)
            .with("channel", self.id)
            .with("vhost", &self.subject.virtual_host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessControlProvider, AccessRule, RuleBasedAccessControl, RuleEffect};
    use crate::broker::InMemoryQueue;
    use crate::framing::ProtocolVersion;
    use crate::session::ChannelSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn session_with(
        gate: AccessControlGate,
        version: ProtocolVersion,
    ) -> (ChannelSession, UnboundedReceiver<OutboundBlock>) {
        let (sink, rx) = ChannelSink::pair();
        let session = ChannelSession::new(
            1,
            Subject::new("guest"),
            FrameCodec::new(version, 4096),
            Arc::new(sink),
            gate,
        );
        (session, rx)
    }

    fn session() -> (ChannelSession, UnboundedReceiver<OutboundBlock>) {
        session_with(AccessControlGate::default(), ProtocolVersion::V0_9_1)
    }

    fn msg(body: &str) -> Arc<Message> {
        Arc::new(Message::new("", "q", body.to_string()))
    }

    fn methods(rx: &mut UnboundedReceiver<OutboundBlock>) -> Vec<MethodFrame> {
        let codec = FrameCodec::new(ProtocolVersion::V0_9_1, 4096);
        let mut out = Vec::new();
        while let Ok(block) = rx.try_recv() {
            if let Ok(Some(method)) = codec.decode_method(&block.frames[0]) {
                out.push(method);
            }
        }
        out
    }

    #[test]
    fn test_deliver_allocates_increasing_tags() {
        let (mut ch, mut rx) = session();
        let queue = InMemoryQueue::shared("q");
        ch.consume(queue, "c1", ConsumeOptions::default()).unwrap();

        for expected in 1..=3 {
            let outcome = ch.deliver(msg("x"), DeliveryProperties::default(), "c1").unwrap();
            assert!(matches!(outcome, DeliveryOutcome::Delivered { tag, tracked: true, .. } if tag == expected));
        }
        assert_eq!(ch.tracker().tags(), vec![1, 2, 3]);
        assert_eq!(methods(&mut rx).len(), 3);
    }

    #[test]
    fn test_generated_consumer_tag() {
        let (mut ch, _rx) = session();
        let tag = ch
            .consume(InMemoryQueue::shared("q"), "", ConsumeOptions::default())
            .unwrap();
        assert!(tag.starts_with("amq.ctag-"));
    }

    #[test]
    fn test_no_ack_deliveries_are_not_tracked() {
        let (mut ch, _rx) = session();
        ch.consume(InMemoryQueue::shared("q"), "c1", ConsumeOptions::no_ack())
            .unwrap();
        let outcome = ch.deliver(msg("x"), DeliveryProperties::default(), "c1").unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Delivered { tag: 1, tracked: false, .. }));
        assert_eq!(ch.tracker().outstanding_count(), 0);
    }

    #[test]
    fn test_encoding_failure_changes_nothing() {
        let (mut ch, mut rx) = session();
        ch.consume(InMemoryQueue::shared("q"), "c1", ConsumeOptions::default())
            .unwrap();
        let props = crate::framing::BasicProperties::default().with_reply_to(&"r".repeat(256));
        let bad = Arc::new(Message::new("", "q", "x").with_properties(props));

        let err = ch.deliver(bad, DeliveryProperties::default(), "c1").unwrap_err();
        assert!(matches!(err, AmqError::Encoding(_)));
        assert_eq!(ch.tracker().peek_next_tag(), 1);
        assert_eq!(ch.flow().get("c1").unwrap().unacked_count(), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(ch.state(), ChannelState::Open);
    }

    #[test]
    fn test_denied_delivery_changes_nothing() {
        let acl = RuleBasedAccessControl::new(&[
            AccessRule::new(RuleEffect::Allow).for_operation(Operation::Consume),
            AccessRule::new(RuleEffect::Deny).for_operation(Operation::Deliver),
        ])
        .unwrap();
        let gate = AccessControlGate::new(AccessControlProvider::new("acl", Arc::new(acl)));
        let (mut ch, mut rx) = session_with(gate, ProtocolVersion::V0_9_1);
        ch.consume(InMemoryQueue::shared("q"), "c1", ConsumeOptions::default())
            .unwrap();

        let err = ch.deliver(msg("x"), DeliveryProperties::default(), "c1").unwrap_err();
        assert!(matches!(err, AmqError::AccessDenied { .. }));
        assert_eq!(ch.tracker().peek_next_tag(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_flow_stop_defers_and_resume_drains_in_order() {
        let (mut ch, mut rx) = session();
        ch.consume(InMemoryQueue::shared("q"), "c1", ConsumeOptions::default())
            .unwrap();

        ch.set_flow(false).unwrap();
        assert_eq!(ch.state(), ChannelState::FlowStopped);
        for body in ["a", "b"] {
            assert_eq!(
                ch.deliver(msg(body), DeliveryProperties::default(), "c1").unwrap(),
                DeliveryOutcome::Deferred
            );
        }
        assert_eq!(ch.stats().pending, 2);

        let outcomes = ch.set_flow(true).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], DeliveryOutcome::Delivered { tag: 1, .. }));
        assert!(matches!(outcomes[1], DeliveryOutcome::Delivered { tag: 2, .. }));

        let sent = methods(&mut rx);
        assert_eq!(sent[0], MethodFrame::ChannelFlowOk { active: false });
        assert_eq!(sent[1], MethodFrame::ChannelFlowOk { active: true });
        assert!(matches!(sent[2], MethodFrame::BasicDeliver { delivery_tag: 1, .. }));
    }

    #[test]
    fn test_acks_flow_while_stopped() {
        let (mut ch, _rx) = session();
        ch.consume(InMemoryQueue::shared("q"), "c1", ConsumeOptions::default())
            .unwrap();
        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();
        ch.set_flow(false).unwrap();
        assert_eq!(ch.handle_ack(1, false).unwrap(), 1);
    }

    #[test]
    fn test_get_ok_not_paused_by_flow() {
        let (mut ch, _rx) = session();
        ch.set_flow(false).unwrap();
        let queue = InMemoryQueue::shared("q");
        let tag = ch.get_ok(msg("g"), DeliveryProperties::default(), queue, 0).unwrap();
        assert_eq!(tag, 1);
        assert!(ch.tracker().is_outstanding(1));
    }

    #[test]
    fn test_exhausted_window_blocks() {
        let (mut ch, _rx) = session();
        let opts = ConsumeOptions::default().with_limit(CreditLimit::count(1));
        ch.consume(InMemoryQueue::shared("q"), "c1", opts).unwrap();

        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();
        assert_eq!(
            ch.deliver(msg("b"), DeliveryProperties::default(), "c1").unwrap(),
            DeliveryOutcome::Blocked
        );
        ch.handle_ack(1, false).unwrap();
        assert!(matches!(
            ch.deliver(msg("b"), DeliveryProperties::default(), "c1").unwrap(),
            DeliveryOutcome::Delivered { tag: 2, .. }
        ));
    }

    #[test]
    fn test_auto_close_on_exhaustion() {
        let (mut ch, mut rx) = session();
        let queue = InMemoryQueue::shared("q");
        let opts = ConsumeOptions::default()
            .with_limit(CreditLimit::count(2))
            .with_auto_close(true);
        ch.consume(queue.clone(), "c1", opts).unwrap();

        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();
        ch.deliver(msg("b"), DeliveryProperties::default(), "c1").unwrap();

        let sent = methods(&mut rx);
        assert_eq!(
            sent.last(),
            Some(&MethodFrame::BasicCancelOk {
                consumer_tag: "c1".to_string()
            })
        );
        assert!(!ch.flow().get("c1").unwrap().is_active());
        assert_eq!(queue.ready_consumers(), 0);
        assert!(matches!(
            ch.deliver(msg("c"), DeliveryProperties::default(), "c1"),
            Err(AmqError::ConsumerClosed(_))
        ));

        ch.emit_auto_close("c1").unwrap();
        assert!(methods(&mut rx).is_empty());
    }

    #[test]
    fn test_unknown_ack_closes_channel_and_requeues() {
        let (mut ch, mut rx) = session();
        let queue = InMemoryQueue::shared("q");
        ch.consume(queue.clone(), "c1", ConsumeOptions::default()).unwrap();
        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();
        ch.deliver(msg("b"), DeliveryProperties::default(), "c1").unwrap();
        methods(&mut rx);

        let err = ch.handle_ack(99, false).unwrap_err();
        assert_eq!(err.reply_code(), reply_code::PRECONDITION_FAILED);
        assert!(ch.is_closed());
        assert_eq!(ch.tracker().outstanding_count(), 0);
        assert!(ch.flow().is_empty());
        assert_eq!(queue.depth(), 2);

        let sent = methods(&mut rx);
        assert!(matches!(sent[0], MethodFrame::ChannelClose { reply_code: 406, .. }));
        assert!(matches!(ch.handle_ack(1, false), Err(AmqError::ChannelClosed(1))));
    }

    #[test]
    fn test_reject_requeue_returns_credit() {
        let (mut ch, _rx) = session();
        let queue = InMemoryQueue::shared("q");
        let opts = ConsumeOptions::default().with_limit(CreditLimit::count(1));
        ch.consume(queue.clone(), "c1", opts).unwrap();
        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();

        assert!(ch.handle_reject(1, true).unwrap().is_empty());
        assert!(ch.flow().has_credit("c1"));
        let (_, props) = queue.pop().unwrap();
        assert!(props.redelivered);
    }

    #[test]
    fn test_reject_without_alternate_consumer_orphans() {
        let (mut ch, _rx) = session();
        let queue = InMemoryQueue::shared("q");
        ch.consume(queue.clone(), "c1", ConsumeOptions::default()).unwrap();
        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();

        let orphans = ch.handle_reject(1, false).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_reject_with_alternate_consumer_requeues() {
        let (mut ch, _rx) = session();
        let queue = InMemoryQueue::shared("q");
        ch.consume(queue.clone(), "c1", ConsumeOptions::default()).unwrap();
        ch.consume(queue.clone(), "c2", ConsumeOptions::default()).unwrap();
        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();

        assert!(ch.handle_reject(1, false).unwrap().is_empty());
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn test_nack_needs_0_9_1() {
        let (mut ch, _rx) = session_with(AccessControlGate::default(), ProtocolVersion::V0_8);
        ch.consume(InMemoryQueue::shared("q"), "c1", ConsumeOptions::default())
            .unwrap();
        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();

        let err = ch.handle_nack(1, false, true).unwrap_err();
        assert_eq!(err.reply_code(), reply_code::NOT_IMPLEMENTED);
        assert!(ch.is_closed());
    }

    #[test]
    fn test_nack_multiple() {
        let (mut ch, _rx) = session();
        let queue = InMemoryQueue::shared("q");
        ch.consume(queue.clone(), "c1", ConsumeOptions::default()).unwrap();
        for body in ["a", "b", "c"] {
            ch.deliver(msg(body), DeliveryProperties::default(), "c1").unwrap();
        }
        ch.handle_nack(2, true, true).unwrap();
        assert_eq!(ch.tracker().tags(), vec![3]);
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_close_releases_everything() {
        let (mut ch, _rx) = session();
        let queue = InMemoryQueue::shared("q");
        ch.consume(queue.clone(), "c1", ConsumeOptions::default()).unwrap();
        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();
        ch.set_flow(false).unwrap();
        ch.deliver(msg("b"), DeliveryProperties::default(), "c1").unwrap();

        let summary = ch.close(false).unwrap();
        assert_eq!(summary.dropped, 1);
        assert!(ch.is_closed());
        assert!(ch.flow().is_empty());
        assert_eq!(ch.stats().pending, 0);
        // the deferred delivery was never sent, so it goes back
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.ready_consumers(), 0);
        assert!(matches!(ch.close(true), Err(AmqError::ChannelClosed(1))));
    }

    #[test]
    fn test_close_requeue_returns_unacked() {
        let (mut ch, _rx) = session();
        let queue = InMemoryQueue::shared("q");
        ch.consume(queue.clone(), "c1", ConsumeOptions::default()).unwrap();
        let first = msg("m1");
        let second = msg("m2");
        ch.deliver(first, DeliveryProperties::default(), "c1").unwrap();
        ch.deliver(second.clone(), DeliveryProperties::default(), "c1").unwrap();
        assert_eq!(ch.handle_ack(1, false).unwrap(), 1);

        let summary = ch.close(true).unwrap();
        assert_eq!(summary.requeued, 1);
        assert_eq!(ch.state(), ChannelState::Closed);
        assert_eq!(ch.tracker().outstanding_count(), 0);
        assert_eq!(queue.message_ids(), vec![second.id()]);
        let (_, props) = queue.pop().unwrap();
        assert!(props.redelivered);
    }

    #[test]
    fn test_denied_close_keeps_channel_open() {
        let acl = RuleBasedAccessControl::new(&[
            AccessRule::new(RuleEffect::Allow).for_operation(Operation::Consume),
            AccessRule::new(RuleEffect::Allow).for_operation(Operation::Deliver),
            AccessRule::new(RuleEffect::Deny).for_operation(Operation::CloseChannel),
        ])
        .unwrap();
        let gate = AccessControlGate::new(AccessControlProvider::new("acl", Arc::new(acl)));
        let (mut ch, _rx) = session_with(gate, ProtocolVersion::V0_9_1);
        let queue = InMemoryQueue::shared("q");
        ch.consume(queue.clone(), "c1", ConsumeOptions::default()).unwrap();
        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();

        let err = ch.close(true).unwrap_err();
        assert!(matches!(err, AmqError::AccessDenied { .. }));
        assert_eq!(ch.state(), ChannelState::Open);
        assert_eq!(ch.tracker().tags(), vec![1]);
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.ready_consumers(), 1);
    }

    #[test]
    fn test_denied_get_ok_changes_nothing() {
        let acl = RuleBasedAccessControl::new(&[
            AccessRule::new(RuleEffect::Deny).for_operation(Operation::Get),
        ])
        .unwrap();
        let gate = AccessControlGate::new(AccessControlProvider::new("acl", Arc::new(acl)));
        let (mut ch, mut rx) = session_with(gate, ProtocolVersion::V0_9_1);

        let err = ch
            .get_ok(msg("x"), DeliveryProperties::default(), InMemoryQueue::shared("q"), 0)
            .unwrap_err();
        assert!(matches!(err, AmqError::AccessDenied { .. }));
        assert_eq!(ch.tracker().peek_next_tag(), 1);
        assert_eq!(ch.tracker().outstanding_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_denied_consume_registers_nothing() {
        let acl = RuleBasedAccessControl::new(&[
            AccessRule::new(RuleEffect::Allow).for_operation(Operation::Get),
        ])
        .unwrap();
        let gate = AccessControlGate::new(AccessControlProvider::new("acl", Arc::new(acl)));
        let (mut ch, mut rx) = session_with(gate, ProtocolVersion::V0_9_1);
        let queue = InMemoryQueue::shared("q");

        let err = ch
            .consume(queue.clone(), "c1", ConsumeOptions::default())
            .unwrap_err();
        assert!(matches!(err, AmqError::AccessDenied { .. }));
        assert!(ch.flow().is_empty());
        assert_eq!(queue.ready_consumers(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reused_consumer_tag_keeps_prefetch() {
        let (mut ch, _rx) = session();
        let queue = InMemoryQueue::shared("q");
        let opts = ConsumeOptions::default().with_limit(CreditLimit::count(1));
        ch.consume(queue.clone(), "c1", opts.clone()).unwrap();
        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();
        ch.cancel("c1").unwrap();

        ch.consume(queue.clone(), "c1", opts).unwrap();
        assert!(matches!(
            ch.deliver(msg("b"), DeliveryProperties::default(), "c1").unwrap(),
            DeliveryOutcome::Delivered { tag: 2, .. }
        ));

        // tag 1 belonged to the cancelled registration
        assert_eq!(ch.handle_ack(1, false).unwrap(), 1);
        assert_eq!(
            ch.deliver(msg("c"), DeliveryProperties::default(), "c1").unwrap(),
            DeliveryOutcome::Blocked
        );
        assert_eq!(ch.handle_ack(2, false).unwrap(), 1);
        assert!(ch.flow().has_credit("c1"));
    }

    /// Sink that accepts a fixed number of blocks, then fails.
    #[derive(Debug)]
    struct FailingSink {
        inner: ChannelSink,
        accepts: AtomicUsize,
    }

    impl FrameSink for FailingSink {
        fn submit(&self, block: OutboundBlock) -> Result<()> {
            self.accepts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map_err(|_| AmqError::SinkClosed)?;
            self.inner.submit(block)
        }
    }

    #[test]
    fn test_failed_auto_close_still_reports_delivery() {
        let (inner, mut rx) = ChannelSink::pair();
        let sink = FailingSink {
            inner,
            accepts: AtomicUsize::new(1),
        };
        let mut ch = ChannelSession::new(
            1,
            Subject::new("guest"),
            FrameCodec::new(ProtocolVersion::V0_9_1, 4096),
            Arc::new(sink),
            AccessControlGate::default(),
        );
        let opts = ConsumeOptions::default()
            .with_limit(CreditLimit::count(1))
            .with_auto_close(true);
        ch.consume(InMemoryQueue::shared("q"), "c1", opts).unwrap();

        let outcome = ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Delivered { tag: 1, tracked: true, .. }));
        assert!(ch.tracker().is_outstanding(1));
        assert_eq!(
            methods(&mut rx),
            vec![MethodFrame::BasicDeliver {
                consumer_tag: "c1".to_string(),
                delivery_tag: 1,
                redelivered: false,
                exchange: String::new(),
                routing_key: "q".to_string(),
            }]
        );
    }

    #[test]
    fn test_cancel_keeps_outstanding() {
        let (mut ch, _rx) = session();
        let queue = InMemoryQueue::shared("q");
        ch.consume(queue.clone(), "c1", ConsumeOptions::default()).unwrap();
        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();

        ch.cancel("c1").unwrap();
        assert!(ch.tracker().is_outstanding(1));
        assert_eq!(ch.handle_ack(1, false).unwrap(), 1);
        assert!(matches!(ch.cancel("c1"), Err(AmqError::UnknownConsumer(_))));
    }

    #[test]
    fn test_handle_frame_dispatch() {
        let (mut ch, mut rx) = session();
        ch.consume(InMemoryQueue::shared("q"), "c1", ConsumeOptions::default())
            .unwrap();
        ch.deliver(msg("a"), DeliveryProperties::default(), "c1").unwrap();
        ch.deliver(msg("b"), DeliveryProperties::default(), "c1").unwrap();
        methods(&mut rx);

        let codec = FrameCodec::new(ProtocolVersion::V0_9_1, 4096);
        let ack = codec
            .encode_method(1, &MethodFrame::BasicAck { delivery_tag: 2, multiple: true })
            .unwrap();
        ch.handle_frame(&ack).unwrap();
        assert_eq!(ch.tracker().outstanding_count(), 0);

        let close = codec
            .encode_method(
                1,
                &MethodFrame::ChannelClose {
                    reply_code: 200,
                    reply_text: "bye".to_string(),
                    class_id: 0,
                    method_id: 0,
                },
            )
            .unwrap();
        ch.handle_frame(&close).unwrap();
        assert!(ch.is_closed());
        assert_eq!(methods(&mut rx), vec![MethodFrame::ChannelCloseOk]);
    }

    #[test]
    fn test_client_sending_deliver_is_violation() {
        let (mut ch, _rx) = session();
        let codec = FrameCodec::new(ProtocolVersion::V0_9_1, 4096);
        let deliver = codec
            .encode_method(
                1,
                &MethodFrame::BasicDeliver {
                    consumer_tag: "c".to_string(),
                    delivery_tag: 1,
                    redelivered: false,
                    exchange: String::new(),
                    routing_key: "q".to_string(),
                },
            )
            .unwrap();
        let err = ch.handle_frame(&deliver).unwrap_err();
        assert_eq!(err.reply_code(), reply_code::COMMAND_INVALID);
        assert!(ch.is_closed());
    }

    #[test]
    fn test_body_frame_is_unexpected() {
        let (mut ch, _rx) = session();
        let err = ch
            .handle_frame(&Frame::body(1, bytes::Bytes::from_static(b"x")))
            .unwrap_err();
        assert_eq!(err.reply_code(), reply_code::UNEXPECTED_FRAME);
    }

    #[test]
    fn test_idle_reaper() {
        let (sink, _rx) = ChannelSink::pair();
        let config = FlowConfig {
            idle_auto_close_secs: Some(0),
            ..FlowConfig::default()
        };
        let mut ch = ChannelSession::new(
            1,
            Subject::new("guest"),
            FrameCodec::default(),
            Arc::new(sink),
            AccessControlGate::default(),
        )
        .with_flow_config(&config);
        ch.consume(InMemoryQueue::shared("q"), "c1", ConsumeOptions::default())
            .unwrap();

        assert_eq!(ch.reap_idle_consumers().unwrap(), vec!["c1".to_string()]);
        assert!(!ch.flow().get("c1").unwrap().is_active());
        assert!(ch.reap_idle_consumers().unwrap().is_empty());
    }
}
