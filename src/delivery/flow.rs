//! Per-consumer credit accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::broker::QueueHandle;
use crate::error::{AmqError, Result};

/// Registration identity of a consumer, unique per controller.
///
/// A tag can be reused after cancel; the id cannot, so credit for an old
/// registration's deliveries never lands on a new one.
pub type ConsumerId = u64;

/// Prefetch window. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLimit {
    /// Unacknowledged deliveries
    pub count: u32,
    /// Unacknowledged body bytes
    pub bytes: u64,
}

impl CreditLimit {
    /// No limit
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Count-only window
    pub fn count(count: u32) -> Self {
        Self { count, bytes: 0 }
    }

    /// Add a byte window
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    /// Whether neither dimension is limited
    pub fn is_unlimited(&self) -> bool {
        self.count == 0 && self.bytes == 0
    }
}

/// What `on_delivered` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    /// Credit consumed, consumer still has room or is not auto-close
    Granted,
    /// Credit consumed and the window is now exhausted; close the consumer
    AutoClose,
    /// Delivery would overrun the window; nothing consumed
    Refused,
}

/// One consumer's flow state.
#[derive(Debug, Clone)]
pub struct ConsumerState {
    id: ConsumerId,
    tag: String,
    queue: Arc<dyn QueueHandle>,
    limit: CreditLimit,
    auto_close: bool,
    no_ack: bool,
    active: bool,
    unacked_count: u32,
    unacked_bytes: u64,
    exhaustion_signalled: bool,
    delivered: u64,
    last_activity: Instant,
}

impl ConsumerState {
    /// New active consumer with an empty window
    pub fn new(tag: &str, queue: Arc<dyn QueueHandle>, limit: CreditLimit) -> Self {
        Self {
            id: 0,
            tag: tag.to_string(),
            queue,
            limit,
            auto_close: false,
            no_ack: false,
            active: true,
            unacked_count: 0,
            unacked_bytes: 0,
            exhaustion_signalled: false,
            delivered: 0,
            last_activity: Instant::now(),
        }
    }

    /// Close the consumer when its window is exhausted
    pub fn with_auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    /// Deliveries need no acknowledgment and use no credit
    pub fn with_no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    /// Registration id; 0 until registered
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Consumer tag
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Backing queue
    pub fn queue(&self) -> &Arc<dyn QueueHandle> {
        &self.queue
    }

    /// Prefetch window
    pub fn limit(&self) -> CreditLimit {
        self.limit
    }

    /// Auto-close eligibility
    pub fn auto_close(&self) -> bool {
        self.auto_close
    }

    /// No-ack mode
    pub fn no_ack(&self) -> bool {
        self.no_ack
    }

    /// Still taking deliveries
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Unacknowledged deliveries
    pub fn unacked_count(&self) -> u32 {
        self.unacked_count
    }

    /// Unacknowledged body bytes
    pub fn unacked_bytes(&self) -> u64 {
        self.unacked_bytes
    }

    /// Deliveries made so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn fits(&self, size: u64) -> bool {
        if self.no_ack {
            return true;
        }
        let count_ok = self.limit.count == 0 || self.unacked_count < self.limit.count;
        // A message larger than the whole byte window still goes out when
        // nothing else is outstanding.
        let bytes_ok = self.limit.bytes == 0
            || self.unacked_count == 0
            || self.unacked_bytes + size <= self.limit.bytes;
        count_ok && bytes_ok
    }

    fn exhausted(&self) -> bool {
        if self.no_ack {
            return false;
        }
        (self.limit.count != 0 && self.unacked_count >= self.limit.count)
            || (self.limit.bytes != 0 && self.unacked_bytes >= self.limit.bytes)
    }
}

/// Credit windows for every consumer on a channel.
#[derive(Debug, Default)]
pub struct ConsumerFlowController {
    consumers: HashMap<String, ConsumerState>,
    idle_timeout: Option<Duration>,
    last_id: ConsumerId,
}

impl ConsumerFlowController {
    /// Controller without idle auto-close
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable idle auto-close
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Add a consumer; its tag must be unused on this channel.
    /// Returns the id assigned to this registration.
    pub fn register(&mut self, mut state: ConsumerState) -> Result<ConsumerId> {
        if self.consumers.contains_key(&state.tag) {
            return Err(AmqError::DuplicateConsumer(state.tag));
        }
        self.last_id += 1;
        state.id = self.last_id;
        self.consumers.insert(state.tag.clone(), state);
        Ok(self.last_id)
    }

    /// Drop a consumer's entry
    pub fn remove(&mut self, consumer_tag: &str) -> Option<ConsumerState> {
        self.consumers.remove(consumer_tag)
    }

    /// Look up a consumer
    pub fn get(&self, consumer_tag: &str) -> Option<&ConsumerState> {
        self.consumers.get(consumer_tag)
    }

    /// Whether `consumer_tag` could take one more delivery now
    pub fn has_credit(&self, consumer_tag: &str) -> bool {
        self.consumers
            .get(consumer_tag)
            .is_some_and(|c| c.active && c.fits(0) && !c.exhausted())
    }

    /// Whether a delivery of `size` bytes fits the window
    pub fn can_accept(&self, consumer_tag: &str, size: u64) -> bool {
        self.consumers
            .get(consumer_tag)
            .is_some_and(|c| c.active && c.fits(size))
    }

    /// Charge one delivery of `size` bytes.
    pub fn on_delivered(&mut self, consumer_tag: &str, size: u64) -> Result<CreditOutcome> {
        let consumer = self
            .consumers
            .get_mut(consumer_tag)
            .ok_or_else(|| AmqError::UnknownConsumer(consumer_tag.to_string()))?;
        if !consumer.active {
            return Err(AmqError::ConsumerClosed(consumer_tag.to_string()));
        }
        if !consumer.fits(size) {
            return Ok(CreditOutcome::Refused);
        }

        consumer.delivered += 1;
        consumer.last_activity = Instant::now();
        if consumer.no_ack {
            return Ok(CreditOutcome::Granted);
        }

        consumer.unacked_count += 1;
        consumer.unacked_bytes += size;

        if consumer.exhausted() && consumer.auto_close && !consumer.exhaustion_signalled {
            consumer.exhaustion_signalled = true;
            tracing::debug!(
                "Consumer '{}' exhausted its window ({} unacked, {} bytes)",
                consumer.tag,
                consumer.unacked_count,
                consumer.unacked_bytes
            );
            return Ok(CreditOutcome::AutoClose);
        }
        Ok(CreditOutcome::Granted)
    }

    /// Return credit for `count` deliveries totalling `bytes` made to
    /// registration `consumer_id`.
    ///
    /// Called for every way a delivery leaves the unacked set. Cancelled
    /// consumers, and a later consumer reusing the same tag, get nothing.
    pub fn on_acknowledged(
        &mut self,
        consumer_tag: &str,
        consumer_id: ConsumerId,
        count: u32,
        bytes: u64,
    ) {
        let Some(consumer) = self.consumers.get_mut(consumer_tag) else {
            return;
        };
        if consumer.id != consumer_id {
            tracing::debug!(
                "Ignoring credit for stale registration {} of consumer '{}'",
                consumer_id,
                consumer_tag
            );
            return;
        }
        consumer.unacked_count = consumer.unacked_count.saturating_sub(count);
        consumer.unacked_bytes = consumer.unacked_bytes.saturating_sub(bytes);
        consumer.last_activity = Instant::now();
        if !consumer.exhausted() {
            consumer.exhaustion_signalled = false;
        }
    }

    /// Stop deliveries to a consumer; returns false if unknown
    pub fn deactivate(&mut self, consumer_tag: &str) -> bool {
        match self.consumers.get_mut(consumer_tag) {
            Some(consumer) => {
                consumer.active = false;
                true
            },
            None => false,
        }
    }

    /// Active consumers idle past the configured timeout
    pub fn idle_consumers(&self, now: Instant) -> Vec<String> {
        let Some(timeout) = self.idle_timeout else {
            return Vec::new();
        };
        let mut idle: Vec<String> = self
            .consumers
            .values()
            .filter(|c| c.active && now.saturating_duration_since(c.last_activity) >= timeout)
            .map(|c| c.tag.clone())
            .collect();
        idle.sort();
        idle
    }

    /// Consumer tags, sorted
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.consumers.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Number of consumers
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    /// Whether there are no consumers
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Remove every consumer, returning them
    pub fn clear(&mut self) -> Vec<ConsumerState> {
        self.consumers.drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryQueue;
    use proptest::prelude::*;

    fn controller(limit: CreditLimit, auto_close: bool) -> ConsumerFlowController {
        let mut flow = ConsumerFlowController::new();
        flow.register(
            ConsumerState::new("c1", InMemoryQueue::shared("q"), limit).with_auto_close(auto_close),
        )
        .unwrap();
        flow
    }

    #[test]
    fn test_count_window_refuses_overrun() {
        let mut flow = controller(CreditLimit::count(2), false);
        assert_eq!(flow.on_delivered("c1", 10).unwrap(), CreditOutcome::Granted);
        assert_eq!(flow.on_delivered("c1", 10).unwrap(), CreditOutcome::Granted);
        assert!(!flow.has_credit("c1"));
        assert_eq!(flow.on_delivered("c1", 10).unwrap(), CreditOutcome::Refused);
        assert_eq!(flow.get("c1").unwrap().unacked_count(), 2);

        flow.on_acknowledged("c1", 1, 1, 10);
        assert!(flow.has_credit("c1"));
    }

    #[test]
    fn test_auto_close_signalled_once() {
        let mut flow = controller(CreditLimit::count(1), true);
        assert_eq!(flow.on_delivered("c1", 1).unwrap(), CreditOutcome::AutoClose);
        assert_eq!(flow.on_delivered("c1", 1).unwrap(), CreditOutcome::Refused);

        flow.on_acknowledged("c1", 1, 1, 1);
        assert_eq!(flow.on_delivered("c1", 1).unwrap(), CreditOutcome::AutoClose);
    }

    #[test]
    fn test_byte_window() {
        let mut flow = controller(CreditLimit::unlimited().with_bytes(100), false);
        assert!(flow.can_accept("c1", 500));
        flow.on_delivered("c1", 60).unwrap();
        assert!(!flow.can_accept("c1", 60));
        assert!(flow.can_accept("c1", 40));

        flow.on_acknowledged("c1", 1, 1, 60);
        assert_eq!(flow.get("c1").unwrap().unacked_bytes(), 0);
    }

    #[test]
    fn test_no_ack_consumes_no_credit() {
        let mut flow = ConsumerFlowController::new();
        flow.register(
            ConsumerState::new("c1", InMemoryQueue::shared("q"), CreditLimit::count(1))
                .with_no_ack(true)
                .with_auto_close(true),
        )
        .unwrap();
        for _ in 0..5 {
            assert_eq!(flow.on_delivered("c1", 1).unwrap(), CreditOutcome::Granted);
        }
        assert_eq!(flow.get("c1").unwrap().unacked_count(), 0);
        assert_eq!(flow.get("c1").unwrap().delivered(), 5);
    }

    #[test]
    fn test_inactive_and_unknown_consumers() {
        let mut flow = controller(CreditLimit::unlimited(), false);
        assert!(flow.deactivate("c1"));
        assert!(!flow.has_credit("c1"));
        assert!(matches!(
            flow.on_delivered("c1", 1),
            Err(AmqError::ConsumerClosed(_))
        ));
        assert!(matches!(
            flow.on_delivered("nope", 1),
            Err(AmqError::UnknownConsumer(_))
        ));
        assert!(!flow.deactivate("nope"));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut flow = controller(CreditLimit::unlimited(), false);
        let again = ConsumerState::new("c1", InMemoryQueue::shared("q"), CreditLimit::unlimited());
        assert!(matches!(
            flow.register(again),
            Err(AmqError::DuplicateConsumer(_))
        ));
    }

    #[test]
    fn test_reused_tag_gets_no_stale_credit() {
        let mut flow = controller(CreditLimit::count(1), false);
        let old = flow.get("c1").unwrap().id();
        flow.on_delivered("c1", 1).unwrap();
        flow.remove("c1");

        let new = flow
            .register(ConsumerState::new("c1", InMemoryQueue::shared("q"), CreditLimit::count(1)))
            .unwrap();
        assert_ne!(old, new);
        flow.on_delivered("c1", 1).unwrap();

        flow.on_acknowledged("c1", old, 1, 1);
        assert_eq!(flow.get("c1").unwrap().unacked_count(), 1);
        assert!(!flow.has_credit("c1"));

        flow.on_acknowledged("c1", new, 1, 1);
        assert!(flow.has_credit("c1"));
    }

    #[test]
    fn test_idle_consumers() {
        let flow = controller(CreditLimit::unlimited(), false);
        let later = Instant::now() + Duration::from_secs(120);
        assert!(flow.idle_consumers(later).is_empty());

        let flow = controller(CreditLimit::unlimited(), false)
            .with_idle_timeout(Some(Duration::from_secs(60)));
        assert_eq!(flow.idle_consumers(later), vec!["c1".to_string()]);
        assert!(flow.idle_consumers(Instant::now()).is_empty());
    }

    proptest! {
        #[test]
        fn prop_window_never_overrun(limit in 1u32..20, attempts in 1usize..100) {
            let mut flow = controller(CreditLimit::count(limit), false);
            let granted = (0..attempts)
                .filter(|_| flow.on_delivered("c1", 1).unwrap() != CreditOutcome::Refused)
                .count();
            prop_assert_eq!(granted, attempts.min(limit as usize));
            prop_assert!(flow.get("c1").unwrap().unacked_count() <= limit);
        }
    }
}
