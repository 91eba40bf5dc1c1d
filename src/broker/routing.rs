//! Routing collaborator boundary and a direct-exchange router.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::queue::QueueHandle;
use crate::message::Message;

/// Resolves a published message to the queues it should land on.
pub trait Router: Send + Sync + std::fmt::Debug {
    /// Queues matching the message's exchange and routing key
    fn route(&self, message: &Message) -> Vec<Arc<dyn QueueHandle>>;
}

type BindingKey = (String, String);

/// Exact-match routing.
///
/// The default exchange (`""`) routes to the queue named by the routing key;
/// named exchanges route through explicit bindings.
#[derive(Debug, Default)]
pub struct DirectRouter {
    queues: RwLock<HashMap<String, Arc<dyn QueueHandle>>>,
    bindings: RwLock<HashMap<BindingKey, Vec<String>>>,
}

impl DirectRouter {
    /// Create a router with no queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a queue; it is reachable through the default exchange
    pub fn declare(&self, queue: Arc<dyn QueueHandle>) {
        if let Ok(mut queues) = self.queues.write() {
            queues.insert(queue.name().to_string(), queue);
        }
    }

    /// Bind `queue` to `exchange` under `routing_key`
    pub fn bind(&self, exchange: &str, routing_key: &str, queue: &str) {
        if let Ok(mut bindings) = self.bindings.write() {
            let bound = bindings
                .entry((exchange.to_string(), routing_key.to_string()))
                .or_default();
            if !bound.iter().any(|q| q == queue) {
                bound.push(queue.to_string());
            }
        }
    }

    /// Look up a declared queue
    pub fn queue(&self, name: &str) -> Option<Arc<dyn QueueHandle>> {
        self.queues.read().ok()?.get(name).cloned()
    }
}

impl Router for DirectRouter {
    fn route(&self, message: &Message) -> Vec<Arc<dyn QueueHandle>> {
        if message.exchange().is_empty() {
            return self.queue(message.routing_key()).into_iter().collect();
        }

        let names = self
            .bindings
            .read()
            .ok()
            .and_then(|b| {
                b.get(&(
                    message.exchange().to_string(),
                    message.routing_key().to_string(),
                ))
                .cloned()
            })
            .unwrap_or_default();

        names.iter().filter_map(|name| self.queue(name)).collect()
    }
}
