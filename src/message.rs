//! Broker-side message envelope.
//!
//! Messages are immutable once built and shared as `Arc<Message>` between the
//! routing collaborator, queues and the channels delivering them.

use bytes::Bytes;
use uuid::Uuid;

use crate::framing::{BasicProperties, ContentHeader};

/// Channel-scoped delivery identifier, starting at 1.
pub type DeliveryTag = u64;

/// Per-delivery flags that are not part of the message itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryProperties {
    /// Message was handed out before and came back to the queue
    pub redelivered: bool,
}

/// How the publisher addressed a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishInfo {
    /// Target exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Must be routed to at least one queue, else returned
    pub mandatory: bool,
    /// Must reach a ready consumer, else returned
    pub immediate: bool,
}

/// Channel a message was published on, used to route it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Publisher {
    /// Publishing connection
    pub connection: Uuid,
    /// Publishing channel on that connection
    pub channel: u16,
}

/// Immutable message envelope.
#[derive(Debug, Clone)]
pub struct Message {
    id: Uuid,
    publish: PublishInfo,
    publisher: Option<Publisher>,
    properties: BasicProperties,
    body: Bytes,
}

impl Message {
    /// Create a message with default properties
    pub fn new(exchange: &str, routing_key: &str, body: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            publish: PublishInfo {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                mandatory: false,
                immediate: false,
            },
            publisher: None,
            properties: BasicProperties::default(),
            body: body.into(),
        }
    }

    /// Set the header properties
    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Set the mandatory flag
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.publish.mandatory = mandatory;
        self
    }

    /// Set the immediate flag
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.publish.immediate = immediate;
        self
    }

    /// Record the publishing channel
    pub fn published_by(mut self, connection: Uuid, channel: u16) -> Self {
        self.publisher = Some(Publisher {
            connection,
            channel,
        });
        self
    }

    /// Publishing channel, if the message came in through a connection
    pub fn publisher(&self) -> Option<Publisher> {
        self.publisher
    }

    /// Broker-assigned id, used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Exchange the message was published to
    pub fn exchange(&self) -> &str {
        &self.publish.exchange
    }

    /// Routing key it was published with
    pub fn routing_key(&self) -> &str {
        &self.publish.routing_key
    }

    /// Mandatory flag
    pub fn is_mandatory(&self) -> bool {
        self.publish.mandatory
    }

    /// Immediate flag
    pub fn is_immediate(&self) -> bool {
        self.publish.immediate
    }

    /// Header properties
    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    /// Message body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body size in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// Publish addressing, as echoed in basic.return
    pub fn publish_info(&self) -> PublishInfo {
        self.publish.clone()
    }

    /// Content header describing this message
    pub fn content_header(&self) -> ContentHeader {
        ContentHeader::basic(self.body.len() as u64, self.properties.clone())
    }
}
