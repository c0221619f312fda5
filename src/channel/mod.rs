// src/channel/mod.rs
//
// One logical AMQP channel multiplexed over a shared connection.

mod consumers;
mod dispatch;
mod returns;

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lapin::types::FieldTable;
use lapin::BasicProperties;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::ChannelConfig;
use crate::confirm::{self, ConfirmMode, NoConfirm, WithConfirm};
use crate::errors::{ChannelError, Result};
use crate::method::{Delivery, Method, MethodKind};
use crate::transport::{ChannelId, Transport};

pub use consumers::DeliveryHandler;
pub use returns::Returns;

use consumers::ConsumerRegistry;
use returns::ReturnBroadcast;

const CLOSE_REPLY_CODE: u16 = 200;
const CLOSE_REPLY_TEXT: &str = "Closing channel";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Opening,
    Open,
    Closing,
    Closed,
    Failed(ChannelError),
}

impl ChannelStatus {
    pub fn connected(&self) -> bool {
        matches!(self, ChannelStatus::Open)
    }
}

/// Prefetch window for `basic.qos`. Zero means no limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefetch {
    pub count: u16,
    pub size: u32,
}

impl Prefetch {
    pub fn count(count: u16) -> Self {
        Self { count, size: 0 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub mandatory: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
}

type Waiters = HashMap<MethodKind, VecDeque<oneshot::Sender<Method>>>;

/// State shared by every handle of a channel and its dispatcher task. Nothing
/// here depends on the confirm mode.
pub(crate) struct Core {
    id: ChannelId,
    identity: String,
    transport: Arc<dyn Transport>,
    span: Span,
    counter: AtomicU64,
    flow: AtomicBool,
    status: watch::Sender<ChannelStatus>,
    waiters: Mutex<Waiters>,
    rpc_serial: tokio::sync::Mutex<()>,
    publish_serial: tokio::sync::Mutex<()>,
    consumers: Mutex<ConsumerRegistry>,
    returns: Mutex<ReturnBroadcast>,
}

impl Core {
    fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    fn set_status(&self, status: ChannelStatus) {
        self.status.send_replace(status);
    }

    fn consumers(&self) -> MutexGuard<'_, ConsumerRegistry> {
        lock(&self.consumers)
    }

    fn returns(&self) -> MutexGuard<'_, ReturnBroadcast> {
        lock(&self.returns)
    }

    fn take_waiter(&self, kind: MethodKind) -> Option<oneshot::Sender<Method>> {
        lock(&self.waiters)
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
    }

    /// Error for an operation attempted once the channel stopped being usable.
    fn failure(&self) -> ChannelError {
        match self.status() {
            ChannelStatus::Failed(err) => err,
            _ => ChannelError::Closed(self.id),
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.status() {
            ChannelStatus::Opening | ChannelStatus::Open => Ok(()),
            _ => Err(self.failure()),
        }
    }

    fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn send(&self, method: Method) -> Result<()> {
        self.transport.send(self.id, method).await?;
        Ok(())
    }

    /// Send `method` and, unless it is asynchronous or `nowait`, wait for the
    /// broker's reply. Requests are serialized per channel.
    async fn request(&self, method: Method) -> Result<()> {
        self.roundtrip(method, false).await
    }

    /// Like [`Core::request`], for a channel that must still be open.
    pub(crate) async fn call(&self, method: Method) -> Result<()> {
        self.ensure_open()?;
        self.roundtrip(method, true).await
    }

    async fn roundtrip(&self, method: Method, require_open: bool) -> Result<()> {
        let Some(expected) = method.expected_reply() else {
            return self.send(method).await;
        };

        let _serial = self.rpc_serial.lock().await;
        // The channel may have started closing while this request queued.
        if require_open {
            self.ensure_open()?;
        }
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).entry(expected).or_default().push_back(tx);

        if let Err(err) = self.send(method).await {
            if let Some(queue) = lock(&self.waiters).get_mut(&expected) {
                queue.pop_back();
            }
            return Err(err);
        }

        // A dropped waiter means the dispatcher tore the channel down.
        rx.await.map(|_| ()).map_err(|_| self.failure())
    }

    fn shutdown(&self) {
        lock(&self.waiters).clear();
        self.consumers().clear();
        self.returns().close();
    }

    fn fail(&self, err: ChannelError) {
        self.set_status(ChannelStatus::Failed(err));
        self.shutdown();
    }
}

/// A logical channel. `M` fixes at the type level whether publishes wait for
/// publisher confirms ([`WithConfirm`]) or complete once written
/// ([`NoConfirm`]).
///
/// Handles are cheap to clone and share the same channel. Only [`Channel::close`]
/// releases the channel number; dropping the last handle just stops local
/// processing.
pub struct Channel<M: ConfirmMode = NoConfirm> {
    core: Arc<Core>,
    ledger: Arc<M::Ledger>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
    _mode: PhantomData<M>,
}

impl<M: ConfirmMode> Clone for Channel<M> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            ledger: self.ledger.clone(),
            dispatcher: self.dispatcher.clone(),
            _mode: PhantomData,
        }
    }
}

impl<M: ConfirmMode> Drop for Channel<M> {
    fn drop(&mut self) {
        if Arc::strong_count(&self.dispatcher) > 1 {
            return;
        }
        let Some(dispatcher) = lock(self.dispatcher.as_ref()).take() else {
            return;
        };
        if self.core.ensure_open().is_ok() {
            warn!(parent: &self.core.span, "Channel dropped without close");
            self.core.set_status(ChannelStatus::Closed);
            self.core.shutdown();
            M::abandon(&self.ledger);
        }
        dispatcher.abort();
    }
}

impl<M: ConfirmMode> Channel<M> {
    /// Allocate `channel_id` on the transport, perform the `channel.open`
    /// handshake and, for confirmed channels, `confirm.select`.
    pub async fn open<T: Transport>(
        label: &str,
        transport: Arc<T>,
        channel_id: ChannelId,
    ) -> Result<Self> {
        if channel_id == 0 {
            return Err(ChannelError::Open {
                channel: channel_id,
                reason: "channel 0 is reserved for the connection".to_string(),
            });
        }
        let transport: Arc<dyn Transport> = transport;
        let identity = format!("{}.{}.{}", transport.identity(), channel_id, label);
        let span = info_span!("channel", channel = channel_id, identity = %identity);

        let incoming = transport
            .open_channel(channel_id)
            .await
            .map_err(|err| ChannelError::Open {
                channel: channel_id,
                reason: err.to_string(),
            })?;

        let (status, _) = watch::channel(ChannelStatus::Opening);
        let core = Arc::new(Core {
            id: channel_id,
            identity,
            transport,
            span: span.clone(),
            counter: AtomicU64::new(0),
            flow: AtomicBool::new(true),
            status,
            waiters: Mutex::new(HashMap::new()),
            rpc_serial: tokio::sync::Mutex::new(()),
            publish_serial: tokio::sync::Mutex::new(()),
            consumers: Mutex::new(ConsumerRegistry::default()),
            returns: Mutex::new(ReturnBroadcast::default()),
        });
        let ledger = Arc::new(M::ledger());

        let dispatcher = tokio::spawn(
            dispatch::run::<M>(core.clone(), ledger.clone(), incoming).instrument(span.clone()),
        );
        let channel = Self {
            core,
            ledger,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
            _mode: PhantomData,
        };

        if let Err(err) = channel.handshake().await {
            channel.teardown().await;
            return Err(ChannelError::Open {
                channel: channel_id,
                reason: err.to_string(),
            });
        }

        channel.core.set_status(ChannelStatus::Open);
        info!(parent: &span, confirm = M::SELECT, "Channel opened");
        Ok(channel)
    }

    /// Open a channel labelled and prefetch-limited as `config` says.
    pub async fn open_with_config<T: Transport>(
        config: &ChannelConfig,
        transport: Arc<T>,
        channel_id: ChannelId,
    ) -> Result<Self> {
        let channel = Self::open(&config.label, transport, channel_id).await?;
        if let Some(prefetch) = config.prefetch() {
            if config.global_prefetch {
                channel.set_global_prefetch(prefetch).await?;
            } else {
                channel.set_prefetch(prefetch).await?;
            }
        }
        Ok(channel)
    }

    async fn handshake(&self) -> Result<()> {
        self.core.request(Method::ChannelOpen).await?;
        if M::SELECT {
            debug!(parent: &self.core.span, "Enabling publisher confirms");
            self.core
                .request(Method::ConfirmSelect { nowait: false })
                .await?;
        }
        Ok(())
    }

    /// Release everything without talking to the broker.
    async fn teardown(&self) {
        if let Err(err) = self.core.transport.close_channel(self.core.id).await {
            debug!(parent: &self.core.span, error = %err, "Channel already released");
        }
        self.core.shutdown();
        M::abandon(&self.ledger);
        if let Some(dispatcher) = lock(self.dispatcher.as_ref()).take() {
            dispatcher.abort();
        }
    }

    /// Close the channel. Outstanding publisher confirms fail with
    /// `ChannelClosed` and every [`Returns`] stream ends.
    ///
    /// On a channel that already failed this only releases what is left and
    /// reports the fault.
    pub async fn close(&self) -> Result<()> {
        if let ChannelStatus::Failed(err) = self.core.status() {
            self.teardown().await;
            return Err(err);
        }
        self.core.ensure_open()?;
        self.core.set_status(ChannelStatus::Closing);
        info!(parent: &self.core.span, "Closing channel");

        let result = self
            .core
            .request(Method::ChannelClose {
                reply_code: CLOSE_REPLY_CODE,
                reply_text: CLOSE_REPLY_TEXT.to_string(),
                class_id: 0,
                method_id: 0,
            })
            .await;
        self.teardown().await;

        match result {
            Ok(()) => {
                self.core.set_status(ChannelStatus::Closed);
                Ok(())
            }
            Err(err) => {
                if !matches!(self.core.status(), ChannelStatus::Failed(_)) {
                    self.core.set_status(ChannelStatus::Failed(err.clone()));
                }
                Err(err)
            }
        }
    }

    pub fn id(&self) -> ChannelId {
        self.core.id
    }

    /// `<connection identity>.<channel number>.<label>`
    pub fn identity(&self) -> &str {
        &self.core.identity
    }

    pub fn status(&self) -> ChannelStatus {
        self.core.status()
    }

    /// Whether the broker currently allows publishing (`channel.flow`).
    pub fn flow_active(&self) -> bool {
        self.core.flow.load(Ordering::SeqCst)
    }

    /// Resolves once the channel stops: `Ok` after [`Channel::close`], the
    /// fault otherwise.
    pub async fn terminated(&self) -> Result<()> {
        let mut status = self.core.status.subscribe();
        loop {
            let current = status.borrow_and_update().clone();
            match current {
                ChannelStatus::Closed => return Ok(()),
                ChannelStatus::Failed(err) => return Err(err),
                _ => {}
            }
            if status.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub async fn set_prefetch(&self, prefetch: Prefetch) -> Result<()> {
        self.qos(prefetch, false).await
    }

    pub async fn set_global_prefetch(&self, prefetch: Prefetch) -> Result<()> {
        self.qos(prefetch, true).await
    }

    async fn qos(&self, prefetch: Prefetch, global: bool) -> Result<()> {
        debug!(parent: &self.core.span, count = prefetch.count, size = prefetch.size, global, "Setting prefetch");
        self.core
            .call(Method::BasicQos {
                prefetch_size: prefetch.size,
                prefetch_count: prefetch.count,
                global,
            })
            .await
    }

    /// Write a `basic.publish`. The returned future settles separately: at
    /// once on an unconfirmed channel, on the broker's ack/nack/return on a
    /// confirmed one. Properties without an app id are stamped with the
    /// channel identity.
    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<M::Pending> {
        self.core.ensure_open()?;
        let properties = if properties.app_id().is_none() {
            properties.with_app_id(self.core.identity.clone().into())
        } else {
            properties
        };

        // Tags are assigned in wire order, so tracking and sending happen together.
        let _serial = self.core.publish_serial.lock().await;
        self.core.ensure_open()?;
        let pending = M::track(&self.ledger, exchange, routing_key);
        let publish = Method::BasicPublish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory: options.mandatory,
            immediate: false,
            properties,
            body,
        };
        if let Err(err) = self.core.send(publish).await {
            M::untrack(&self.ledger, &pending);
            return Err(err);
        }
        Ok(pending)
    }

    /// Subscribe to messages the broker returns as unroutable.
    pub fn returns(&self) -> Returns {
        self.core.returns().subscribe()
    }

    /// A consumer tag unique on this channel.
    pub fn next_consumer_tag(&self) -> String {
        format!("{}.{}", self.core.identity, self.core.next_counter())
    }

    /// Route deliveries for `consumer_tag` to `handler` without talking to the
    /// broker.
    pub fn register_consumer<F>(&self, consumer_tag: &str, handler: F) -> Result<()>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.core
            .consumers()
            .register(consumer_tag, Arc::new(handler))
    }

    pub fn deregister_consumer(&self, consumer_tag: &str) -> bool {
        self.core.consumers().deregister(consumer_tag)
    }

    /// Start consuming `queue`. Without an explicit tag one is generated. The
    /// handler is registered before `basic.consume` is sent so no delivery
    /// can race past it.
    pub async fn basic_consume<F>(
        &self,
        queue: &str,
        consumer_tag: Option<&str>,
        options: ConsumeOptions,
        handler: F,
    ) -> Result<String>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.core.ensure_open()?;
        let consumer_tag = match consumer_tag {
            Some(tag) => tag.to_string(),
            None => self.next_consumer_tag(),
        };
        self.register_consumer(&consumer_tag, handler)?;

        let consume = Method::BasicConsume {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.clone(),
            no_local: options.no_local,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            nowait: false,
            arguments: FieldTable::default(),
        };
        if let Err(err) = self.core.call(consume).await {
            self.deregister_consumer(&consumer_tag);
            return Err(err);
        }
        info!(parent: &self.core.span, %consumer_tag, queue, "Consumer started");
        Ok(consumer_tag)
    }

    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.core
            .call(Method::BasicCancel {
                consumer_tag: consumer_tag.to_string(),
                nowait: false,
            })
            .await?;
        self.deregister_consumer(consumer_tag);
        Ok(())
    }

    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.core
            .call(Method::BasicAck {
                delivery_tag,
                multiple,
            })
            .await
    }

    pub async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.core
            .call(Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            })
            .await
    }

    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.core
            .call(Method::BasicReject {
                delivery_tag,
                requeue,
            })
            .await
    }
}

impl Channel<WithConfirm> {
    /// Published messages the broker has not acked or nacked yet. A returned
    /// message counts until its ack/nack arrives.
    pub fn unconfirmed_count(&self) -> usize {
        confirm::lock(&self.ledger).len()
    }

    pub fn is_unconfirmed(&self, delivery_tag: u64) -> bool {
        confirm::lock(&self.ledger).contains(delivery_tag)
    }
}
