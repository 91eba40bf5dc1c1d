//! Outbound frame sink.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::{AmqError, Result};
use crate::framing::Frame;

/// Frames that must reach the wire back to back.
///
/// A content delivery (method, header, bodies) is always one block so its
/// frames never interleave with another channel's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBlock {
    /// Channel the frames belong to
    pub channel: u16,
    /// Frames in emission order
    pub frames: Vec<Frame>,
}

impl OutboundBlock {
    /// Block of frames for `channel`
    pub fn new(channel: u16, frames: Vec<Frame>) -> Self {
        Self { channel, frames }
    }

    /// Block holding one frame
    pub fn single(frame: Frame) -> Self {
        Self {
            channel: frame.channel,
            frames: vec![frame],
        }
    }

    /// Bytes on the wire
    pub fn encoded_len(&self) -> usize {
        self.frames.iter().map(Frame::encoded_len).sum()
    }

    /// Wire form of every frame, concatenated
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        for frame in &self.frames {
            frame.encode_into(&mut buf);
        }
        buf.freeze()
    }
}

/// Where a channel hands its frames.
pub trait FrameSink: Send + Sync + std::fmt::Debug {
    /// Queue a block for the wire; blocks keep submission order
    fn submit(&self, block: OutboundBlock) -> Result<()>;
}

/// [`FrameSink`] over an unbounded tokio channel, one per connection.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundBlock>,
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl ChannelSink {
    /// Wrap the sending half of the connection's writer channel
    pub fn new(tx: mpsc::UnboundedSender<OutboundBlock>) -> Self {
        Self {
            tx,
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Sink plus the receiver a writer task would drain
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<OutboundBlock>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Frames submitted so far
    pub fn frames_sent(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Wire bytes submitted so far
    pub fn bytes_sent(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Whether the receiving side is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl FrameSink for ChannelSink {
    fn submit(&self, block: OutboundBlock) -> Result<()> {
        let frames = block.frames.len() as u64;
        let bytes = block.encoded_len() as u64;
        self.tx.send(block).map_err(|_| AmqError::SinkClosed)?;
        self.frames.fetch_add(frames, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }
}
