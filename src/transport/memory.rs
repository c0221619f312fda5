// src/transport/memory.rs

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{ChannelId, IncomingMethods, Transport};
use crate::errors::TransportError;
use crate::method::{Method, MethodKind};

/// In-process transport that plays the broker's side of the synchronous
/// handshakes. Everything sent is recorded per channel, and broker events can
/// be pushed in with [`MemoryTransport::inject`].
pub struct MemoryTransport {
    identity: String,
    state: Mutex<State>,
}

struct State {
    connected: bool,
    auto_reply: bool,
    channels: HashMap<ChannelId, mpsc::UnboundedSender<Method>>,
    sent: HashMap<ChannelId, Vec<Method>>,
    failures: HashMap<MethodKind, (u16, String)>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(&format!("memory-{}", &Uuid::new_v4().to_string()[..8]))
    }
}

impl MemoryTransport {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            state: Mutex::new(State {
                connected: true,
                auto_reply: true,
                channels: HashMap::new(),
                sent: HashMap::new(),
                failures: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer synchronous requests with their `-ok` reply (the default).
    pub fn set_auto_reply(&self, enabled: bool) {
        self.state().auto_reply = enabled;
    }

    /// Make the broker refuse the next `kind` request by closing the channel.
    pub fn fail_next(&self, kind: MethodKind, reply_code: u16, reply_text: &str) {
        self.state()
            .failures
            .insert(kind, (reply_code, reply_text.to_string()));
    }

    /// Deliver `method` to `channel` as if the broker had sent it.
    pub fn inject(&self, channel: ChannelId, method: Method) -> Result<(), TransportError> {
        let state = self.state();
        let incoming = state
            .channels
            .get(&channel)
            .ok_or(TransportError::UnknownChannel(channel))?;
        trace!(channel, kind = ?method.kind(), "Injecting broker method");
        incoming
            .send(method)
            .map_err(|_| TransportError::UnknownChannel(channel))
    }

    /// Everything the client sent on `channel`, oldest first.
    pub fn sent(&self, channel: ChannelId) -> Vec<Method> {
        self.state().sent.get(&channel).cloned().unwrap_or_default()
    }

    pub fn sent_of(&self, channel: ChannelId, kind: MethodKind) -> Vec<Method> {
        self.sent(channel)
            .into_iter()
            .filter(|method| method.kind() == kind)
            .collect()
    }

    pub fn is_open(&self, channel: ChannelId) -> bool {
        self.state().channels.contains_key(&channel)
    }

    /// Drop the connection: every channel's incoming stream ends.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.connected = false;
        state.channels.clear();
        debug!(identity = %self.identity, "Memory transport disconnected");
    }
}

fn loopback_reply(method: &Method) -> Option<Method> {
    let expected = method.expected_reply()?;
    let reply = match method {
        Method::ChannelFlow { active } => Method::ChannelFlowOk { active: *active },
        Method::BasicConsume { consumer_tag, .. } => Method::BasicConsumeOk {
            consumer_tag: consumer_tag.clone(),
        },
        Method::BasicCancel { consumer_tag, .. } => Method::BasicCancelOk {
            consumer_tag: consumer_tag.clone(),
        },
        _ => match expected {
            MethodKind::ChannelOpenOk => Method::ChannelOpenOk,
            MethodKind::ChannelCloseOk => Method::ChannelCloseOk,
            MethodKind::ExchangeDeclareOk => Method::ExchangeDeclareOk,
            MethodKind::ExchangeDeleteOk => Method::ExchangeDeleteOk,
            MethodKind::ExchangeBindOk => Method::ExchangeBindOk,
            MethodKind::ExchangeUnbindOk => Method::ExchangeUnbindOk,
            MethodKind::QueueBindOk => Method::QueueBindOk,
            MethodKind::QueueUnbindOk => Method::QueueUnbindOk,
            MethodKind::BasicQosOk => Method::BasicQosOk,
            MethodKind::ConfirmSelectOk => Method::ConfirmSelectOk,
            MethodKind::TxSelectOk => Method::TxSelectOk,
            MethodKind::TxCommitOk => Method::TxCommitOk,
            MethodKind::TxRollbackOk => Method::TxRollbackOk,
            _ => return None,
        },
    };
    Some(reply)
}

#[async_trait]
impl Transport for MemoryTransport {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn open_channel(&self, channel: ChannelId) -> Result<IncomingMethods, TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if state.channels.contains_key(&channel) {
            return Err(TransportError::ChannelInUse(channel));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.channels.insert(channel, tx);
        Ok(rx)
    }

    async fn send(&self, channel: ChannelId, method: Method) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if !state.channels.contains_key(&channel) {
            return Err(TransportError::UnknownChannel(channel));
        }

        let kind = method.kind();
        let reply = if !state.auto_reply {
            None
        } else if let Some((reply_code, reply_text)) = state.failures.remove(&kind) {
            Some(Method::ChannelClose {
                reply_code,
                reply_text,
                class_id: 0,
                method_id: 0,
            })
        } else {
            loopback_reply(&method)
        };

        state.sent.entry(channel).or_default().push(method);
        if let (Some(reply), Some(incoming)) = (reply, state.channels.get(&channel)) {
            let _ = incoming.send(reply);
        }
        Ok(())
    }

    async fn close_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.state()
            .channels
            .remove(&channel)
            .map(|_| ())
            .ok_or(TransportError::UnknownChannel(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_synchronous_requests() {
        let transport = MemoryTransport::new("conn");
        let mut incoming = transport.open_channel(1).await.unwrap();

        transport.send(1, Method::ChannelOpen).await.unwrap();
        transport
            .send(
                1,
                Method::BasicAck {
                    delivery_tag: 1,
                    multiple: false,
                },
            )
            .await
            .unwrap();
        transport.send(1, Method::TxSelect).await.unwrap();

        assert_eq!(incoming.recv().await, Some(Method::ChannelOpenOk));
        assert_eq!(incoming.recv().await, Some(Method::TxSelectOk));
        assert_eq!(transport.sent(1).len(), 3);
    }

    #[tokio::test]
    async fn scripted_failure_closes_the_channel() {
        let transport = MemoryTransport::new("conn");
        let mut incoming = transport.open_channel(2).await.unwrap();
        transport.fail_next(MethodKind::TxCommit, 406, "PRECONDITION_FAILED");

        transport.send(2, Method::TxCommit).await.unwrap();

        match incoming.recv().await {
            Some(Method::ChannelClose { reply_code, .. }) => assert_eq!(reply_code, 406),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_double_allocation_and_unknown_channels() {
        let transport = MemoryTransport::new("conn");
        let _incoming = transport.open_channel(1).await.unwrap();

        assert_eq!(
            transport.open_channel(1).await.err(),
            Some(TransportError::ChannelInUse(1))
        );
        assert_eq!(
            transport.send(9, Method::ChannelOpen).await,
            Err(TransportError::UnknownChannel(9))
        );

        transport.disconnect();
        assert_eq!(
            transport.send(1, Method::ChannelOpen).await,
            Err(TransportError::Disconnected)
        );
    }
}
