//! Outstanding-delivery table for one channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use super::flow::ConsumerId;
use crate::broker::QueueHandle;
use crate::error::{AmqError, Result};
use crate::framing::reply_code;
use crate::message::{DeliveryTag, Message};

/// One unacknowledged delivery.
#[derive(Debug, Clone)]
pub struct TrackedDelivery {
    /// Channel-scoped tag
    pub tag: DeliveryTag,
    /// Message in flight
    pub message: Arc<Message>,
    /// Receiving consumer; `None` for basic.get
    pub consumer_tag: Option<String>,
    /// Registration of that consumer the delivery was charged to
    pub consumer_id: Option<ConsumerId>,
    /// Queue the message came from
    pub queue: Arc<dyn QueueHandle>,
    /// When the delivery was sent
    pub delivered_at: Instant,
}

impl TrackedDelivery {
    /// Body size, counted against byte windows
    pub fn size(&self) -> u64 {
        self.message.size() as u64
    }
}

/// Result of tearing the tracker down.
#[derive(Debug, Default)]
pub struct ReleaseSummary {
    /// Deliveries handed back to their queues
    pub requeued: usize,
    /// Deliveries dropped
    pub dropped: usize,
    /// The released entries, in tag order
    pub released: Vec<TrackedDelivery>,
}

/// Allocates delivery tags and tracks the unacknowledged ones.
///
/// Tags start at 1, increase strictly and are never reused. Once
/// [`release_all`](Self::release_all) has run the tracker is closing and
/// refuses new entries.
#[derive(Debug)]
pub struct DeliveryTracker {
    channel: u16,
    next_tag: DeliveryTag,
    outstanding: BTreeMap<DeliveryTag, TrackedDelivery>,
    closing: bool,
}

impl DeliveryTracker {
    /// Empty tracker for `channel`
    pub fn new(channel: u16) -> Self {
        Self {
            channel,
            next_tag: 1,
            outstanding: BTreeMap::new(),
            closing: false,
        }
    }

    /// Tag the next allocation will return
    pub fn peek_next_tag(&self) -> DeliveryTag {
        self.next_tag
    }

    /// Allocate a tag
    pub fn next_tag(&mut self) -> DeliveryTag {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    /// Record an allocated tag as outstanding
    pub fn track(
        &mut self,
        tag: DeliveryTag,
        message: Arc<Message>,
        consumer: Option<(&str, ConsumerId)>,
        queue: Arc<dyn QueueHandle>,
    ) -> Result<()> {
        if self.closing {
            return Err(AmqError::ChannelClosed(self.channel));
        }
        if tag == 0 || tag >= self.next_tag || self.outstanding.contains_key(&tag) {
            return Err(AmqError::violation(
                self.channel,
                reply_code::INTERNAL_ERROR,
                format!("delivery tag {tag} was not allocated or is already tracked"),
            ));
        }

        self.outstanding.insert(
            tag,
            TrackedDelivery {
                tag,
                message,
                consumer_tag: consumer.map(|(tag, _)| tag.to_string()),
                consumer_id: consumer.map(|(_, id)| id),
                queue,
                delivered_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Settle `tag` (and every lower outstanding tag when `multiple`).
    ///
    /// `tag == 0` with `multiple` settles everything. With `multiple` any
    /// allocated tag is valid even if nothing at or below it is still
    /// outstanding; a single tag must be outstanding.
    pub fn acknowledge(
        &mut self,
        tag: DeliveryTag,
        multiple: bool,
    ) -> Result<Vec<TrackedDelivery>> {
        let settled = self.take(tag, multiple, "acknowledge")?;
        tracing::debug!(
            "Channel {}: acknowledged {} deliveries up to tag {} (multiple={})",
            self.channel,
            settled.len(),
            tag,
            multiple
        );
        Ok(settled)
    }

    /// Reject one outstanding delivery, requeueing it if asked.
    pub fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<TrackedDelivery> {
        let entry = self
            .outstanding
            .remove(&tag)
            .ok_or_else(|| self.unknown_tag(tag, "reject"))?;
        if requeue {
            entry.queue.requeue(Arc::clone(&entry.message), true);
        }
        Ok(entry)
    }

    /// Reject with acknowledge-style selection (basic.nack).
    pub fn reject_up_to(
        &mut self,
        tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<Vec<TrackedDelivery>> {
        let rejected = self.take(tag, multiple, "nack")?;
        if requeue {
            for entry in &rejected {
                entry.queue.requeue(Arc::clone(&entry.message), true);
            }
        }
        Ok(rejected)
    }

    /// Resolve every outstanding delivery and start closing.
    ///
    /// Runs once; later calls find nothing to release.
    pub fn release_all(&mut self, requeue: bool) -> ReleaseSummary {
        self.closing = true;
        let released: Vec<TrackedDelivery> =
            std::mem::take(&mut self.outstanding).into_values().collect();

        let mut summary = ReleaseSummary::default();
        for entry in &released {
            if requeue {
                entry.queue.requeue(Arc::clone(&entry.message), true);
                summary.requeued += 1;
            } else {
                summary.dropped += 1;
            }
        }
        if !released.is_empty() {
            tracing::debug!(
                "Channel {}: released {} deliveries (requeued={}, dropped={})",
                self.channel,
                released.len(),
                summary.requeued,
                summary.dropped
            );
        }
        summary.released = released;
        summary
    }

    /// Whether `tag` is unacknowledged
    pub fn is_outstanding(&self, tag: DeliveryTag) -> bool {
        self.outstanding.contains_key(&tag)
    }

    /// Number of unacknowledged deliveries
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Unacknowledged deliveries for one consumer
    pub fn outstanding_for(&self, consumer_tag: &str) -> usize {
        self.outstanding
            .values()
            .filter(|d| d.consumer_tag.as_deref() == Some(consumer_tag))
            .count()
    }

    /// Outstanding tags in ascending order
    pub fn tags(&self) -> Vec<DeliveryTag> {
        self.outstanding.keys().copied().collect()
    }

    /// Whether teardown has started
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    fn take(
        &mut self,
        tag: DeliveryTag,
        multiple: bool,
        op: &str,
    ) -> Result<Vec<TrackedDelivery>> {
        if !multiple {
            return match self.outstanding.remove(&tag) {
                Some(entry) => Ok(vec![entry]),
                None => Err(self.unknown_tag(tag, op)),
            };
        }
        if tag == 0 {
            return Ok(std::mem::take(&mut self.outstanding).into_values().collect());
        }
        if tag >= self.next_tag {
            return Err(self.unknown_tag(tag, op));
        }

        let rest = self.outstanding.split_off(&(tag + 1));
        let settled = std::mem::replace(&mut self.outstanding, rest);
        Ok(settled.into_values().collect())
    }

    fn unknown_tag(&self, tag: DeliveryTag, op: &str) -> AmqError {
        AmqError::violation(
            self.channel,
            reply_code::PRECONDITION_FAILED,
            format!("{op}: unknown delivery tag {tag}"),
        )
    }
}
