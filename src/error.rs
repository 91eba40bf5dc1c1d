//! AMQ broker core error types.
//!
//! # Error Classification
//!
//! | Class               | Variants                                   | Effect                          |
//! |---------------------|--------------------------------------------|---------------------------------|
//! | Protocol violation  | `ProtocolViolation`, `MalformedFrame`      | Fatal to the channel            |
//! | Authorization       | `AccessDenied`                             | Operation aborted, channel usable |
//! | Encoding            | `Encoding`                                 | Message not sent, channel usable |
//! | Caller misuse       | `ChannelClosed`, `UnknownConsumer`, ...    | Reported to the immediate caller |
//! | Configuration       | `Config`                                   | Reported to the immediate caller |
//!
//! Unroutable messages and consumer credit exhaustion are not errors; they
//! travel through the return path and the auto-close notification.

use thiserror::Error;

use crate::access::Operation;
use crate::framing::reply_code;

/// AMQ broker core errors.
#[derive(Error, Debug)]
pub enum AmqError {
    /// Peer broke the protocol on a channel. The channel is torn down.
    #[error("Protocol violation on channel {channel} ({code}): {text}")]
    ProtocolViolation {
        /// Channel the violation was detected on.
        channel: u16,
        /// AMQP reply code sent with channel.close.
        code: u16,
        /// Human-readable reason.
        text: String,
    },

    /// Inbound frame could not be parsed.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Access control refused the operation.
    #[error("Access denied: {operation} by '{subject}' on '{object}'")]
    AccessDenied {
        /// Operation that was refused.
        operation: Operation,
        /// Principal that attempted it.
        subject: String,
        /// Object the operation targeted.
        object: String,
    },

    /// Message could not be rendered into frames.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Operation on a channel that is closing or closed.
    #[error("Channel {0} is closed")]
    ChannelClosed(u16),

    /// No channel with this id on the connection.
    #[error("Unknown channel: {0}")]
    UnknownChannel(u16),

    /// Channel id already in use on the connection.
    #[error("Channel {0} is already open")]
    ChannelExists(u16),

    /// No consumer with this tag on the channel.
    #[error("Unknown consumer: {0}")]
    UnknownConsumer(String),

    /// Consumer tag already registered on the channel.
    #[error("Consumer tag already in use: {0}")]
    DuplicateConsumer(String),

    /// Consumer was auto-closed or cancelled and takes no more deliveries.
    #[error("Consumer closed: {0}")]
    ConsumerClosed(String),

    /// Outbound frame sink has been dropped.
    #[error("Outbound frame sink closed")]
    SinkClosed,

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for AMQ operations
pub type Result<T> = std::result::Result<T, AmqError>;

impl AmqError {
    /// Build a protocol violation for `channel`.
    pub fn violation(channel: u16, code: u16, text: impl Into<String>) -> Self {
        AmqError::ProtocolViolation {
            channel,
            code,
            text: text.into(),
        }
    }

    /// Whether this error must tear down the channel it occurred on.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(
            self,
            AmqError::ProtocolViolation { .. } | AmqError::MalformedFrame(_)
        )
    }

    /// AMQP reply code that best describes this error.
    pub fn reply_code(&self) -> u16 {
        match self {
            AmqError::ProtocolViolation { code, .. } => *code,
            AmqError::MalformedFrame(_) => reply_code::FRAME_ERROR,
            AmqError::AccessDenied { .. } => reply_code::ACCESS_REFUSED,
            AmqError::ChannelClosed(_) | AmqError::UnknownChannel(_) | AmqError::ChannelExists(_) => {
                reply_code::CHANNEL_ERROR
            },
            AmqError::UnknownConsumer(_) | AmqError::ConsumerClosed(_) => reply_code::NOT_FOUND,
            AmqError::DuplicateConsumer(_) => reply_code::NOT_ALLOWED,
            AmqError::Encoding(_)
            | AmqError::SinkClosed
            | AmqError::Config(_)
            | AmqError::Json(_)
            | AmqError::Io(_) => reply_code::INTERNAL_ERROR,
        }
    }
}

impl From<toml::de::Error> for AmqError {
    fn from(err: toml::de::Error) -> Self {
        AmqError::Config(err.to_string())
    }
}

impl From<regex::Error> for AmqError {
    fn from(err: regex::Error) -> Self {
        AmqError::Config(format!("Invalid access rule pattern: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_is_fatal() {
        let err = AmqError::violation(3, reply_code::PRECONDITION_FAILED, "unknown delivery tag 9");
        assert!(err.is_channel_fatal());
        assert_eq!(err.reply_code(), 406);
        assert_eq!(
            err.to_string(),
            "Protocol violation on channel 3 (406): unknown delivery tag 9"
        );
    }

    #[test]
    fn test_denial_is_recoverable() {
        let err = AmqError::AccessDenied {
            operation: Operation::Consume,
            subject: "guest".to_string(),
            object: "orders".to_string(),
        };
        assert!(!err.is_channel_fatal());
        assert_eq!(err.reply_code(), 403);
        assert!(!AmqError::Encoding("too big".into()).is_channel_fatal());
    }
}
