// src/channel/returns.rs

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::method::ReturnedMessage;

/// Fans every `basic.return` out to all open [`Returns`] streams.
#[derive(Default)]
pub(crate) struct ReturnBroadcast {
    subscribers: Vec<mpsc::UnboundedSender<ReturnedMessage>>,
    closed: bool,
}

impl ReturnBroadcast {
    pub fn subscribe(&mut self) -> Returns {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed {
            self.subscribers.push(tx);
        }
        Returns { rx }
    }

    /// Returns how many listeners received the message. Listeners that were
    /// dropped are pruned.
    pub fn broadcast(&mut self, returned: &ReturnedMessage) -> usize {
        self.subscribers
            .retain(|subscriber| subscriber.send(returned.clone()).is_ok());
        self.subscribers.len()
    }

    /// End every stream; later subscriptions end immediately.
    pub fn close(&mut self) {
        self.closed = true;
        self.subscribers.clear();
    }
}

/// Messages the broker handed back as unroutable. Ends when the channel closes.
pub struct Returns {
    rx: mpsc::UnboundedReceiver<ReturnedMessage>,
}

impl Returns {
    pub async fn recv(&mut self) -> Option<ReturnedMessage> {
        self.rx.recv().await
    }
}

impl Stream for Returns {
    type Item = ReturnedMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
