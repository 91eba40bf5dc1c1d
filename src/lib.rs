//! # AMQ Core - Broker-side AMQP 0-8 Session Engine
//!
//! The part of a message broker that sits between queues and the wire: it
//! turns queued messages into AMQP frames, tracks which deliveries a client
//! still owes an acknowledgment for, enforces per-consumer prefetch credit,
//! and sends undeliverable messages back to their publishers.
//!
//! ## Features
//!
//! - **Frame codec**: basic.deliver / get-ok / return rendered as
//!   method + header + body frames, split at the negotiated `frame_max`
//! - **Delivery tracking**: channel-scoped, strictly increasing tags with
//!   single, multiple and reject settlement
//! - **Consumer credit**: count and byte windows, with optional auto-close
//!   when a window is exhausted
//! - **Channel flow**: channel.flow pause/resume with deferred deliveries
//! - **Access control**: pluggable provider consulted before every
//!   client-visible operation
//!
//! ## Architecture
//!
//! ```text
//!   Router ──► QueueHandle                         peer
//!                 │  deliver / get_ok               ▲
//!                 ▼                                 │ OutboundBlock
//!   ┌─────────────────────────── Connection ────────┴──────────┐
//!   │  ChannelSession(1)   ChannelSession(2)   ...   FrameSink │
//!   │   ├─ DeliveryTracker       (tags awaiting ack)           │
//!   │   ├─ ConsumerFlowController (credit windows)             │
//!   │   └─ AccessControlGate     (shared with the Broker)      │
//!   └──────────────────────────────────────────────────────────┘
//!                 ▲
//!                 │ handle_bytes / handle_frame (ack, reject, flow, close)
//!                peer
//! ```
//!
//! ### Channel Lifecycle
//!
//! | State          | Deliveries        | Acks     | Leaves on                     |
//! |----------------|-------------------|----------|-------------------------------|
//! | `Open`         | sent              | accepted | flow(false), close, violation |
//! | `FlowStopped`  | deferred in order | accepted | flow(true), close, violation  |
//! | `Closing`      | refused           | refused  | release complete              |
//! | `Closed`       | refused           | refused  | never                         |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use amq::{Broker, Config, ConsumeOptions, DirectRouter, InMemoryQueue, Message, Subject};
//!
//! let router = Arc::new(DirectRouter::new());
//! let queue = InMemoryQueue::shared("orders");
//! router.declare(queue.clone());
//!
//! let broker = Broker::new(Config::default(), router)?;
//! let (conn, mut frames) = broker.connect(Subject::new("guest"));
//! conn.open_channel(1).await?;
//! conn.consume(1, queue.clone(), "c1", ConsumeOptions::default()).await?;
//!
//! conn.publish(Message::new("", "orders", "hello"), 1).await?;
//! let (msg, props) = queue.pop().unwrap();
//! let tag = conn.deliver(msg, props, 1, "c1").await?;
//! conn.handle_ack(1, tag.unwrap(), false).await?;
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: AMQP frame codec and method model
//! - [`session`]: Connections, channels, frame sinks and the return path
//! - [`delivery`]: Delivery-tag tracking and consumer credit
//! - [`access`]: Access-control providers and the gate
//! - [`broker`]: Queue and router boundaries, the broker handle
//! - [`message`]: Broker-side message model
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod access;
pub mod broker;
pub mod config;
pub mod delivery;
pub mod error;
pub mod framing;
pub mod message;
pub mod session;

// Re-exports for convenience
pub use access::{
    AccessControl, AccessControlGate, AccessControlProvider, AccessDecision, ObjectAttributes,
    Operation, Subject,
};
pub use broker::{Broker, DirectRouter, InMemoryQueue, QueueHandle, Router};
pub use config::Config;
pub use delivery::{ConsumerFlowController, CreditLimit, DeliveryTracker};
pub use error::{AmqError, Result};
pub use framing::{Frame, FrameCodec, MethodFrame, ProtocolVersion};
pub use message::{DeliveryProperties, DeliveryTag, Message};
pub use session::{
    ChannelSession, ChannelState, ConsumeOptions, Connection, DeliveryOutcome, FrameSink,
    PublishOutcome, ReturnReason,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default AMQP protocol version spoken by the core
pub const PROTOCOL_VERSION: &str = "0-8";
