// src/errors.rs

use thiserror::Error;

use crate::transport::ChannelId;

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel {0} is already allocated on this connection")]
    ChannelInUse(ChannelId),

    #[error("channel {0} is not open on this connection")]
    UnknownChannel(ChannelId),

    #[error("connection is down")]
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("failed to open channel {channel}: {reason}")]
    Open { channel: ChannelId, reason: String },

    #[error("channel {channel} closed by broker ({reply_code}: {reply_text})")]
    ClosedByBroker {
        channel: ChannelId,
        reply_code: u16,
        reply_text: String,
    },

    #[error("channel {channel} received a delivery for unknown consumer tag {consumer_tag:?}")]
    UnknownConsumer {
        channel: ChannelId,
        consumer_tag: String,
    },

    #[error("consumer tag {0:?} is already in use on this channel")]
    DuplicateConsumer(String),

    #[error("channel {0} is closed")]
    Closed(ChannelId),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ChannelError {
    /// Whether this error leaves the channel unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChannelError::DuplicateConsumer(_))
    }
}

// Custom Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;
