//! Broker-side protocol sessions.
//!
//! A [`Connection`] multiplexes [`ChannelSession`]s; each channel converts
//! messages to frames, tracks what the peer has not acknowledged, and
//! enforces consumer credit. Frames leave through a [`FrameSink`] as whole
//! [`OutboundBlock`]s so a delivery never interleaves with another
//! channel's frames.
//!
//! # Boundary
//!
//! | Call                        | Direction       | Result                       |
//! |-----------------------------|-----------------|------------------------------|
//! | `deliver`                   | queue → peer    | tag, deferred or blocked     |
//! | `get_ok`                    | queue → peer    | tag                          |
//! | `return_message`            | broker → publisher | returned or failed (never an error) |
//! | `emit_auto_close`           | broker → peer   | consumer deactivated         |
//! | `handle_ack` / `handle_reject` | peer → broker | settled deliveries         |
//! | `handle_frame`              | peer → broker   | dispatched method            |
//!
//! # Example
//!
//! ```rust,ignore
//! let broker = Broker::new(Config::default(), router)?;
//! let (conn, mut frames) = broker.connect(Subject::new("guest"));
//! conn.open_channel(1).await?;
//! conn.consume(1, queue.clone(), "c1", ConsumeOptions::default()).await?;
//! let tag = conn.deliver(message, DeliveryProperties::default(), 1, "c1").await?;
//! ```

mod channel;
mod connection;
mod returns;
mod sink;

pub use channel::{ChannelSession, ChannelState, ChannelStats, ConsumeOptions, DeliveryOutcome};
pub use connection::{Connection, InboundReport, PublishOutcome};
pub use returns::{ReturnOutcome, ReturnPath, ReturnReason, ReturnStats};
pub use sink::{ChannelSink, FrameSink, OutboundBlock};
