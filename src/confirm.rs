// src/confirm.rs
//
// Publisher confirms: the ledger of published-but-unacknowledged messages and
// the type-level switch between confirmed and unconfirmed channels.

use std::collections::VecDeque;
use std::future::{ready, Future, Ready};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::method::ReturnedMessage;

/// How the broker settled one published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Rejected,
    Undeliverable,
    /// The channel went away before the broker settled the message.
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Rejected,
    Undeliverable,
    ChannelClosed,
}

/// Result of awaiting a publish on a channel with publisher confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ok,
    Failed(Failure),
}

impl Confirmation {
    pub fn is_ok(&self) -> bool {
        matches!(self, Confirmation::Ok)
    }
}

impl From<Outcome> for Confirmation {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Delivered => Confirmation::Ok,
            Outcome::Rejected => Confirmation::Failed(Failure::Rejected),
            Outcome::Undeliverable => Confirmation::Failed(Failure::Undeliverable),
            Outcome::ChannelClosed => Confirmation::Failed(Failure::ChannelClosed),
        }
    }
}

/// Resolves once the broker acks, nacks or returns the message.
#[derive(Debug)]
pub struct PendingConfirm {
    delivery_tag: u64,
    outcome: oneshot::Receiver<Outcome>,
}

impl PendingConfirm {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }
}

impl Future for PendingConfirm {
    type Output = Confirmation;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped resolver means the ledger was torn down with the channel.
        Pin::new(&mut self.outcome).poll(cx).map(|outcome| {
            outcome
                .map(Confirmation::from)
                .unwrap_or(Confirmation::Failed(Failure::ChannelClosed))
        })
    }
}

struct PendingMessage {
    delivery_tag: u64,
    exchange: String,
    routing_key: String,
    resolver: Option<oneshot::Sender<Outcome>>,
}

impl PendingMessage {
    /// First resolution wins; later calls report `false` and change nothing.
    fn resolve(&mut self, outcome: Outcome) -> bool {
        match self.resolver.take() {
            Some(resolver) => {
                // The publisher may have dropped its future; that is not our concern.
                let _ = resolver.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// Ordered record of messages published on a confirmed channel that the
/// broker has not settled yet. Delivery tags increase strictly from head to
/// tail because entries are only ever appended with a fresh tag.
#[derive(Default)]
pub struct ConfirmLedger {
    next_delivery_tag: u64,
    unacked: VecDeque<PendingMessage>,
}

impl ConfirmLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tag the most recent publish was assigned (0 before any publish).
    pub fn next_delivery_tag(&self) -> u64 {
        self.next_delivery_tag
    }

    pub fn len(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }

    pub fn contains(&self, delivery_tag: u64) -> bool {
        self.position(delivery_tag).is_some()
    }

    pub fn enqueue(&mut self, exchange: &str, routing_key: &str) -> PendingConfirm {
        self.next_delivery_tag += 1;
        let delivery_tag = self.next_delivery_tag;
        let (resolver, outcome) = oneshot::channel();
        self.unacked.push_back(PendingMessage {
            delivery_tag,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            resolver: Some(resolver),
        });
        trace!(delivery_tag, exchange, routing_key, "Tracking published message");
        PendingConfirm {
            delivery_tag,
            outcome,
        }
    }

    /// Undo the latest `enqueue` when the publish never reached the wire.
    pub fn rollback(&mut self, delivery_tag: u64) -> bool {
        match self.unacked.back() {
            Some(last) if last.delivery_tag == delivery_tag => {
                self.unacked.pop_back();
                self.next_delivery_tag -= 1;
                true
            }
            _ => false,
        }
    }

    /// `basic.ack` from the broker. Returns how many messages were removed.
    pub fn on_ack(&mut self, delivery_tag: u64, multiple: bool) -> usize {
        self.settle(delivery_tag, multiple, Outcome::Delivered)
    }

    /// `basic.nack` from the broker. Returns how many messages were removed.
    pub fn on_reject(&mut self, delivery_tag: u64, multiple: bool) -> usize {
        self.settle(delivery_tag, multiple, Outcome::Rejected)
    }

    /// `basic.return` from the broker. The return carries no delivery tag, so
    /// the earliest unsettled message published with the same exchange and
    /// routing key is failed. It stays in the ledger until the broker's
    /// ack/nack for its tag arrives. Returns the tag that was failed.
    pub fn on_return(&mut self, exchange: &str, routing_key: &str) -> Option<u64> {
        let pending = self.unacked.iter_mut().find(|pending| {
            pending.resolver.is_some()
                && pending.exchange == exchange
                && pending.routing_key == routing_key
        });
        match pending {
            Some(pending) => {
                pending.resolve(Outcome::Undeliverable);
                debug!(
                    delivery_tag = pending.delivery_tag,
                    exchange, routing_key, "Published message returned as unroutable"
                );
                Some(pending.delivery_tag)
            }
            None => {
                debug!(exchange, routing_key, "Return matches no pending publish");
                None
            }
        }
    }

    /// Fail every outstanding message with [`Outcome::ChannelClosed`].
    pub fn abandon_all(&mut self) -> usize {
        let count = self.unacked.len();
        for mut pending in self.unacked.drain(..) {
            pending.resolve(Outcome::ChannelClosed);
        }
        if count > 0 {
            debug!(count, "Abandoned unconfirmed publishes");
        }
        count
    }

    fn position(&self, delivery_tag: u64) -> Option<usize> {
        self.unacked
            .binary_search_by_key(&delivery_tag, |pending| pending.delivery_tag)
            .ok()
    }

    fn settle(&mut self, delivery_tag: u64, multiple: bool, outcome: Outcome) -> usize {
        if multiple {
            // Tag 0 with `multiple` covers everything outstanding.
            let mut removed = 0;
            while let Some(front) = self.unacked.front() {
                if delivery_tag != 0 && front.delivery_tag > delivery_tag {
                    break;
                }
                if let Some(mut pending) = self.unacked.pop_front() {
                    pending.resolve(outcome);
                    removed += 1;
                }
            }
            return removed;
        }

        match self.position(delivery_tag).and_then(|idx| self.unacked.remove(idx)) {
            Some(mut pending) => {
                if !pending.resolve(outcome) {
                    trace!(delivery_tag, ?outcome, "Message was already settled by a return");
                }
                1
            }
            None => {
                warn!(delivery_tag, ?outcome, "Broker settled an unknown delivery tag");
                0
            }
        }
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for super::NoConfirm {}
    impl Sealed for super::WithConfirm {}
}

/// Whether a channel runs with publisher confirms. Fixed by the channel's type
/// for its whole lifetime.
pub trait ConfirmMode: private::Sealed + Send + Sync + 'static {
    type Ledger: Send + Sync + 'static;
    type Outcome: Send + 'static;
    type Pending: Future<Output = Self::Outcome> + Send + Unpin + 'static;

    /// Whether `confirm.select` is sent when the channel opens.
    const SELECT: bool;

    fn ledger() -> Self::Ledger;

    fn track(ledger: &Self::Ledger, exchange: &str, routing_key: &str) -> Self::Pending;

    fn untrack(ledger: &Self::Ledger, pending: &Self::Pending);

    fn on_ack(ledger: &Self::Ledger, delivery_tag: u64, multiple: bool);

    fn on_nack(ledger: &Self::Ledger, delivery_tag: u64, multiple: bool);

    fn on_return(ledger: &Self::Ledger, returned: &ReturnedMessage);

    fn abandon(ledger: &Self::Ledger);
}

/// Publishes complete as soon as they are written.
#[derive(Debug, Clone, Copy)]
pub struct NoConfirm;

/// Publishes complete when the broker settles them.
#[derive(Debug, Clone, Copy)]
pub struct WithConfirm;

/// Outcome of a publish on a channel without confirms: it was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unconfirmed;

impl ConfirmMode for NoConfirm {
    type Ledger = ();
    type Outcome = Unconfirmed;
    type Pending = Ready<Unconfirmed>;

    const SELECT: bool = false;

    fn ledger() -> Self::Ledger {}

    fn track(_: &Self::Ledger, _: &str, _: &str) -> Self::Pending {
        ready(Unconfirmed)
    }

    fn untrack(_: &Self::Ledger, _: &Self::Pending) {}

    fn on_ack(_: &Self::Ledger, delivery_tag: u64, _: bool) {
        warn!(delivery_tag, "Ack received on a channel without publisher confirms");
    }

    fn on_nack(_: &Self::Ledger, delivery_tag: u64, _: bool) {
        warn!(delivery_tag, "Nack received on a channel without publisher confirms");
    }

    fn on_return(_: &Self::Ledger, _: &ReturnedMessage) {}

    fn abandon(_: &Self::Ledger) {}
}

pub(crate) fn lock(ledger: &Mutex<ConfirmLedger>) -> MutexGuard<'_, ConfirmLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConfirmMode for WithConfirm {
    type Ledger = Mutex<ConfirmLedger>;
    type Outcome = Confirmation;
    type Pending = PendingConfirm;

    const SELECT: bool = true;

    fn ledger() -> Self::Ledger {
        Mutex::new(ConfirmLedger::new())
    }

    fn track(ledger: &Self::Ledger, exchange: &str, routing_key: &str) -> Self::Pending {
        lock(ledger).enqueue(exchange, routing_key)
    }

    fn untrack(ledger: &Self::Ledger, pending: &Self::Pending) {
        lock(ledger).rollback(pending.delivery_tag());
    }

    fn on_ack(ledger: &Self::Ledger, delivery_tag: u64, multiple: bool) {
        lock(ledger).on_ack(delivery_tag, multiple);
    }

    fn on_nack(ledger: &Self::Ledger, delivery_tag: u64, multiple: bool) {
        lock(ledger).on_reject(delivery_tag, multiple);
    }

    fn on_return(ledger: &Self::Ledger, returned: &ReturnedMessage) {
        lock(ledger).on_return(&returned.exchange, &returned.routing_key);
    }

    fn abandon(ledger: &Self::Ledger) {
        lock(ledger).abandon_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn settled(pending: &mut PendingConfirm) -> Option<Confirmation> {
        pending.now_or_never()
    }

    fn publish_n(ledger: &mut ConfirmLedger, n: usize) -> Vec<PendingConfirm> {
        (0..n).map(|_| ledger.enqueue("logs", "app.error")).collect()
    }

    #[test]
    fn tags_start_at_one_and_increase() {
        let mut ledger = ConfirmLedger::new();
        assert_eq!(ledger.next_delivery_tag(), 0);

        let pending = publish_n(&mut ledger, 3);
        let tags: Vec<u64> = pending.iter().map(PendingConfirm::delivery_tag).collect();
        assert_eq!(tags, vec![1, 2, 3]);
        assert_eq!(ledger.next_delivery_tag(), 3);
    }

    #[test]
    fn single_ack_resolves_only_its_message() {
        let mut ledger = ConfirmLedger::new();
        let mut pending = publish_n(&mut ledger, 3);

        assert_eq!(ledger.on_ack(2, false), 1);

        assert_eq!(settled(&mut pending[1]), Some(Confirmation::Ok));
        assert_eq!(settled(&mut pending[0]), None);
        assert_eq!(settled(&mut pending[2]), None);
        assert!(!ledger.contains(2));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn multiple_ack_resolves_the_prefix() {
        let mut ledger = ConfirmLedger::new();
        let mut pending = publish_n(&mut ledger, 5);

        assert_eq!(ledger.on_ack(3, true), 3);

        for p in pending.iter_mut().take(3) {
            assert_eq!(settled(p), Some(Confirmation::Ok));
        }
        for p in pending.iter_mut().skip(3) {
            assert_eq!(settled(p), None);
        }
        assert!(ledger.contains(4));
        assert!(ledger.contains(5));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn multiple_ack_with_tag_zero_covers_everything() {
        let mut ledger = ConfirmLedger::new();
        let _pending = publish_n(&mut ledger, 4);

        assert_eq!(ledger.on_ack(0, true), 4);
        assert!(ledger.is_empty());
    }

    #[test]
    fn reject_fails_only_its_message() {
        let mut ledger = ConfirmLedger::new();
        let mut pending = publish_n(&mut ledger, 3);

        assert_eq!(ledger.on_reject(2, false), 1);

        assert_eq!(
            settled(&mut pending[1]),
            Some(Confirmation::Failed(Failure::Rejected))
        );
        assert_eq!(settled(&mut pending[0]), None);
        assert_eq!(settled(&mut pending[2]), None);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let mut ledger = ConfirmLedger::new();
        let mut pending = publish_n(&mut ledger, 1);

        assert_eq!(ledger.on_ack(42, false), 0);
        assert_eq!(ledger.on_reject(42, false), 0);

        assert_eq!(settled(&mut pending[0]), None);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn return_fails_earliest_match_and_keeps_it_until_settled() {
        let mut ledger = ConfirmLedger::new();
        let mut first = ledger.enqueue("logs", "app.error");
        let mut other = ledger.enqueue("logs", "app.info");
        let mut second = ledger.enqueue("logs", "app.error");

        assert_eq!(ledger.on_return("logs", "app.error"), Some(1));

        assert_eq!(
            settled(&mut first),
            Some(Confirmation::Failed(Failure::Undeliverable))
        );
        assert_eq!(settled(&mut other), None);
        assert_eq!(settled(&mut second), None);
        assert!(ledger.contains(1));

        // The broker's ack for the returned tag removes it without re-resolving.
        assert_eq!(ledger.on_ack(1, false), 1);
        assert!(!ledger.contains(1));

        // A second return for the same pair moves on to the next unsettled message.
        assert_eq!(ledger.on_return("logs", "app.error"), Some(3));
        assert_eq!(
            settled(&mut second),
            Some(Confirmation::Failed(Failure::Undeliverable))
        );
    }

    #[test]
    fn return_without_match_is_dropped() {
        let mut ledger = ConfirmLedger::new();
        let mut pending = publish_n(&mut ledger, 1);

        assert_eq!(ledger.on_return("other", "app.error"), None);
        assert_eq!(settled(&mut pending[0]), None);
    }

    #[test]
    fn returned_message_covered_by_multiple_ack_stays_failed() {
        let mut ledger = ConfirmLedger::new();
        let mut pending = publish_n(&mut ledger, 2);

        ledger.on_return("logs", "app.error");
        assert_eq!(ledger.on_ack(2, true), 2);

        assert_eq!(
            settled(&mut pending[0]),
            Some(Confirmation::Failed(Failure::Undeliverable))
        );
        assert_eq!(settled(&mut pending[1]), Some(Confirmation::Ok));
    }

    #[test]
    fn rollback_only_undoes_the_latest_publish() {
        let mut ledger = ConfirmLedger::new();
        let pending = publish_n(&mut ledger, 2);

        assert!(!ledger.rollback(pending[0].delivery_tag()));
        assert!(ledger.rollback(pending[1].delivery_tag()));
        assert_eq!(ledger.next_delivery_tag(), 1);
        assert_eq!(ledger.enqueue("logs", "k").delivery_tag(), 2);
    }

    #[test]
    fn abandoned_and_dropped_ledgers_fail_pending_publishes() {
        let mut ledger = ConfirmLedger::new();
        let mut pending = publish_n(&mut ledger, 2);
        assert_eq!(ledger.abandon_all(), 2);
        assert_eq!(
            settled(&mut pending[0]),
            Some(Confirmation::Failed(Failure::ChannelClosed))
        );

        let mut ledger = ConfirmLedger::new();
        let mut orphan = ledger.enqueue("logs", "k");
        drop(ledger);
        assert_eq!(
            settled(&mut orphan),
            Some(Confirmation::Failed(Failure::ChannelClosed))
        );
    }

    #[test]
    fn unconfirmed_publishes_complete_immediately() {
        let pending = NoConfirm::track(&(), "logs", "k");
        assert_eq!(pending.now_or_never(), Some(Unconfirmed));
    }
}
