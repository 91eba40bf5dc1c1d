//! Collaborators around the channel core, and the broker handle that wires
//! them together.
//!
//! The core only talks to queues and routing through the [`QueueHandle`]
//! and [`Router`] traits. [`InMemoryQueue`] and [`DirectRouter`] are the
//! minimal implementations used by tests and the CLI.
//!
//! There is no process-wide registry: callers build a [`Broker`] and open
//! connections from it.

mod queue;
mod routing;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

pub use queue::{InMemoryQueue, QueueHandle};
pub use routing::{DirectRouter, Router};

use crate::access::{AccessControlGate, Subject};
use crate::config::Config;
use crate::error::Result;
use crate::session::{ChannelSink, Connection, OutboundBlock, ReturnPath};

/// Shared broker state: configuration, access control, routing, and the
/// return paths of live connections.
#[derive(Debug)]
pub struct Broker {
    config: Config,
    gate: AccessControlGate,
    router: Arc<dyn Router>,
    return_paths: RwLock<HashMap<Uuid, ReturnPath>>,
}

impl Broker {
    /// Build a broker from configuration
    pub fn new(config: Config, router: Arc<dyn Router>) -> Result<Arc<Self>> {
        config.validate()?;
        let gate = AccessControlGate::from_config(&config.access)?;
        Ok(Self::with_gate(config, gate, router))
    }

    /// Build a broker with an explicit gate
    pub fn with_gate(config: Config, gate: AccessControlGate, router: Arc<dyn Router>) -> Arc<Self> {
        Arc::new(Self {
            config,
            gate,
            router,
            return_paths: RwLock::new(HashMap::new()),
        })
    }

    /// Open a connection for `subject`. The receiver yields every frame
    /// block the connection emits, in order.
    pub fn connect(
        self: &Arc<Self>,
        subject: Subject,
    ) -> (Connection, mpsc::UnboundedReceiver<OutboundBlock>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let sink = Arc::new(ChannelSink::new(tx));
        let returns = ReturnPath::new(self.codec(), sink.clone());

        if let Ok(mut paths) = self.return_paths.write() {
            paths.insert(id, returns.clone());
        }
        tracing::info!("Connection {} opened for {}", id, subject.user);

        let connection = Connection::new(id, Arc::clone(self), subject, sink, returns);
        (connection, rx)
    }

    /// Forget a closed connection
    pub fn disconnect(&self, connection: Uuid) {
        if let Ok(mut paths) = self.return_paths.write() {
            if paths.remove(&connection).is_some() {
                tracing::info!("Connection {} closed", connection);
            }
        }
    }

    /// Return path of a live connection
    pub fn return_path(&self, connection: Uuid) -> Option<ReturnPath> {
        self.return_paths.read().ok()?.get(&connection).cloned()
    }

    /// Live connections
    pub fn connection_count(&self) -> usize {
        self.return_paths.read().map(|p| p.len()).unwrap_or(0)
    }

    /// Effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Access control gate
    pub fn gate(&self) -> &AccessControlGate {
        &self.gate
    }

    /// Routing collaborator
    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Codec for the configured protocol and frame size
    pub fn codec(&self) -> crate::framing::FrameCodec {
        crate::framing::FrameCodec::new(self.config.broker.protocol, self.config.broker.frame_max)
    }
}
