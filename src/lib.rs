//! Logical-channel layer of an AMQP 0-9-1 client.
//!
//! A [`Channel`] multiplexes one channel over a shared connection reached
//! through a [`Transport`]. Channels opened as `Channel<WithConfirm>` track
//! every publish until the broker acks, nacks or returns it; an
//! [`Exchange`] fixes, through its kind, which binding argument each
//! bind/unbind call takes.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rabbit_channel::{
//!     Channel, Confirmation, DeclareOptions, Exchange, MemoryTransport, Method, PublishOptions,
//!     Topic, WithConfirm,
//! };
//!
//! # async fn example() -> rabbit_channel::Result<()> {
//! let transport = Arc::new(MemoryTransport::new("conn"));
//! let channel = Channel::<WithConfirm>::open("publisher", transport.clone(), 1).await?;
//!
//! let logs = Exchange::<Topic>::declare(&channel, "logs", DeclareOptions::default()).await?;
//! logs.bind_queue(&channel, "q1", "*.error".to_string()).await?;
//!
//! let confirmation = logs
//!     .publish(&channel, PublishOptions::default(), "app.error", Default::default(), b"boom".to_vec())
//!     .await?;
//!
//! // Play the broker's side: acknowledge the publish.
//! transport.inject(1, Method::BasicAck { delivery_tag: confirmation.delivery_tag(), multiple: false })?;
//! assert_eq!(confirmation.await, Confirmation::Ok);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod confirm;
pub mod errors;
pub mod exchange;
pub mod method;
pub mod transport;
pub mod tx;

// Re-export specific items to simplify imports elsewhere
pub use channel::{Channel, ChannelStatus, ConsumeOptions, Prefetch, PublishOptions, Returns};
pub use config::ChannelConfig;
pub use confirm::{
    Confirmation, ConfirmLedger, ConfirmMode, Failure, NoConfirm, PendingConfirm, Unconfirmed,
    WithConfirm,
};
pub use errors::{ChannelError, Result, TransportError};
pub use exchange::{DeclareOptions, Direct, Exchange, ExchangeKind, ExchangeType, Fanout, Headers, Topic};
pub use method::{Delivery, Method, MethodKind, ReturnedMessage};
pub use transport::{ChannelId, MemoryTransport, Transport};
pub use tx::Transaction;
