// src/tx.rs

use std::sync::Arc;

use tracing::debug;

use crate::channel::{Channel, Core};
use crate::confirm::ConfirmMode;
use crate::errors::Result;
use crate::method::Method;

/// A channel in transaction mode. Works the same whether or not the channel
/// uses publisher confirms; the two are independent on the broker.
pub struct Transaction {
    core: Arc<Core>,
}

impl Transaction {
    /// Put `channel` in transaction mode with `tx.select`.
    pub async fn start<M: ConfirmMode>(channel: &Channel<M>) -> Result<Self> {
        let core = channel.core().clone();
        core.call(Method::TxSelect).await?;
        debug!(channel = channel.id(), "Transaction started");
        Ok(Self { core })
    }

    pub async fn commit(&self) -> Result<()> {
        self.core.call(Method::TxCommit).await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.core.call(Method::TxRollback).await
    }
}
