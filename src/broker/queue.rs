//! Queue collaborator boundary and a minimal in-memory queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::message::{DeliveryProperties, Message};

/// What the channel core needs from a queue.
pub trait QueueHandle: Send + Sync + std::fmt::Debug {
    /// Queue name, used as the access-control object
    fn name(&self) -> &str;

    /// Append a freshly routed message
    fn enqueue(&self, message: Arc<Message>);

    /// Hand a message back, ahead of anything not yet delivered
    fn requeue(&self, message: Arc<Message>, redelivered: bool);

    /// Consumers currently able to take messages
    fn ready_consumers(&self) -> usize;

    /// Whether some consumer could take a message right now
    fn has_ready_consumer(&self) -> bool {
        self.ready_consumers() > 0
    }

    /// Messages waiting
    fn depth(&self) -> usize;

    /// A consumer subscribed
    fn consumer_added(&self) {}

    /// A consumer went away
    fn consumer_removed(&self) {}
}

#[derive(Debug)]
struct Queued {
    message: Arc<Message>,
    redelivered: bool,
}

/// FIFO queue kept in memory. No persistence.
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    messages: Mutex<VecDeque<Queued>>,
    consumers: AtomicUsize,
}

impl InMemoryQueue {
    /// Create an empty queue
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: Mutex::new(VecDeque::new()),
            consumers: AtomicUsize::new(0),
        }
    }

    /// Create an empty queue behind an `Arc`
    pub fn shared(name: &str) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    /// Take the next message with its redelivered flag
    pub fn pop(&self) -> Option<(Arc<Message>, DeliveryProperties)> {
        let mut messages = self.messages.lock().ok()?;
        messages.pop_front().map(|q| {
            (
                q.message,
                DeliveryProperties {
                    redelivered: q.redelivered,
                },
            )
        })
    }

    /// Snapshot of queued message ids, head first
    pub fn message_ids(&self) -> Vec<uuid::Uuid> {
        self.messages
            .lock()
            .map(|m| m.iter().map(|q| q.message.id()).collect())
            .unwrap_or_default()
    }
}

impl QueueHandle for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, message: Arc<Message>) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push_back(Queued {
                message,
                redelivered: false,
            });
        }
    }

    fn requeue(&self, message: Arc<Message>, redelivered: bool) {
        tracing::debug!(
            "Requeue message {} to '{}' (redelivered={})",
            message.id(),
            self.name,
            redelivered
        );
        if let Ok(mut messages) = self.messages.lock() {
            messages.push_front(Queued {
                message,
                redelivered,
            });
        }
    }

    fn ready_consumers(&self) -> usize {
        self.consumers.load(Ordering::Relaxed)
    }

    fn depth(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn consumer_added(&self) {
        self.consumers.fetch_add(1, Ordering::Relaxed);
    }

    fn consumer_removed(&self) {
        let _ = self
            .consumers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = InMemoryQueue::new("q");
        queue.enqueue(Arc::new(Message::new("", "q", "1")));
        queue.enqueue(Arc::new(Message::new("", "q", "2")));

        assert_eq!(queue.depth(), 2);
        let (first, props) = queue.pop().unwrap();
        assert_eq!(first.body().as_ref(), b"1");
        assert!(!props.redelivered);
    }

    #[test]
    fn test_requeue_goes_to_head() {
        let queue = InMemoryQueue::new("q");
        queue.enqueue(Arc::new(Message::new("", "q", "fresh")));
        queue.requeue(Arc::new(Message::new("", "q", "back")), true);

        let (head, props) = queue.pop().unwrap();
        assert_eq!(head.body().as_ref(), b"back");
        assert!(props.redelivered);
    }

    #[test]
    fn test_consumer_count_saturates() {
        let queue = InMemoryQueue::new("q");
        assert!(!queue.has_ready_consumer());
        queue.consumer_added();
        assert!(queue.has_ready_consumer());
        queue.consumer_removed();
        queue.consumer_removed();
        assert_eq!(queue.ready_consumers(), 0);
    }
}
