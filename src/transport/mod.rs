// src/transport/mod.rs
//
// The seam between the channel layer and the connection: framing, heartbeats
// and the socket all live behind this trait.

pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::method::Method;

pub use memory::MemoryTransport;

pub type ChannelId = u16;

/// Every method the broker sends on one channel, in arrival order.
pub type IncomingMethods = mpsc::UnboundedReceiver<Method>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity of the underlying connection, used to build channel identities.
    fn identity(&self) -> &str;

    /// Allocate `channel` on the connection and subscribe to everything the
    /// broker sends on it. The stream ends when the channel is torn down.
    async fn open_channel(&self, channel: ChannelId) -> Result<IncomingMethods, TransportError>;

    async fn send(&self, channel: ChannelId, method: Method) -> Result<(), TransportError>;

    /// Release `channel` on the connection.
    async fn close_channel(&self, channel: ChannelId) -> Result<(), TransportError>;
}
