// src/channel/dispatch.rs
//
// One task per channel drains the transport's incoming stream. Handlers run
// here one at a time, in the order the broker sent the methods.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{ChannelStatus, Core};
use crate::confirm::ConfirmMode;
use crate::errors::{ChannelError, Result, TransportError};
use crate::method::Method;
use crate::transport::IncomingMethods;

const UNEXPECTED_FRAME: u16 = 505;

pub(super) async fn run<M: ConfirmMode>(
    core: Arc<Core>,
    ledger: Arc<M::Ledger>,
    mut incoming: IncomingMethods,
) {
    while let Some(method) = incoming.recv().await {
        if let Err(err) = handle::<M>(&core, &ledger, method).await {
            error!(error = %err, "Channel terminated");
            if !matches!(err, ChannelError::ClosedByBroker { .. }) {
                release(&core).await;
            }
            core.fail(err);
            M::abandon(&ledger);
            return;
        }
    }

    match core.status() {
        ChannelStatus::Closing | ChannelStatus::Closed | ChannelStatus::Failed(_) => {
            debug!("Incoming stream ended")
        }
        _ => {
            error!("Transport dropped the channel");
            core.fail(TransportError::Disconnected.into());
        }
    }
    M::abandon(&ledger);
}

/// Close a channel the client gave up on: tell the broker, then free the
/// channel number on the connection.
async fn release(core: &Core) {
    let close = Method::ChannelClose {
        reply_code: UNEXPECTED_FRAME,
        reply_text: "UNEXPECTED_FRAME".to_string(),
        class_id: 0,
        method_id: 0,
    };
    if let Err(err) = core.send(close).await {
        debug!(error = %err, "Could not send channel close");
    }
    if let Err(err) = core.transport.close_channel(core.id).await {
        debug!(error = %err, "Could not release channel");
    }
}

async fn handle<M: ConfirmMode>(core: &Core, ledger: &M::Ledger, method: Method) -> Result<()> {
    match method {
        Method::ChannelClose {
            reply_code,
            reply_text,
            ..
        } => {
            warn!(reply_code, %reply_text, "Broker closed the channel");
            if let Err(err) = core.send(Method::ChannelCloseOk).await {
                debug!(error = %err, "Could not acknowledge channel close");
            }
            if let Err(err) = core.transport.close_channel(core.id).await {
                debug!(error = %err, "Could not release channel");
            }
            Err(ChannelError::ClosedByBroker {
                channel: core.id,
                reply_code,
                reply_text,
            })
        }
        Method::ChannelFlow { active } => {
            core.flow.store(active, Ordering::SeqCst);
            info!(active, "Flow control changed");
            core.send(Method::ChannelFlowOk { active }).await
        }
        Method::BasicDeliver {
            consumer_tag,
            delivery,
        } => {
            let handler = core.consumers().get(&consumer_tag);
            match handler {
                Some(handler) => {
                    handler(delivery);
                    Ok(())
                }
                None => Err(ChannelError::UnknownConsumer {
                    channel: core.id,
                    consumer_tag,
                }),
            }
        }
        Method::BasicAck {
            delivery_tag,
            multiple,
        } => {
            M::on_ack(ledger, delivery_tag, multiple);
            Ok(())
        }
        Method::BasicNack {
            delivery_tag,
            multiple,
            ..
        } => {
            M::on_nack(ledger, delivery_tag, multiple);
            Ok(())
        }
        Method::BasicReturn(returned) => {
            M::on_return(ledger, &returned);
            let listeners = core.returns().broadcast(&returned);
            debug!(
                exchange = %returned.exchange,
                routing_key = %returned.routing_key,
                listeners,
                "Message returned"
            );
            Ok(())
        }
        Method::BasicCancel {
            consumer_tag,
            nowait,
        } => {
            let remaining = {
                let mut consumers = core.consumers();
                consumers.deregister(&consumer_tag);
                consumers.len()
            };
            info!(%consumer_tag, remaining, "Broker cancelled consumer");
            if nowait {
                Ok(())
            } else {
                core.send(Method::BasicCancelOk { consumer_tag }).await
            }
        }
        reply => {
            let kind = reply.kind();
            match core.take_waiter(kind) {
                Some(waiter) => {
                    // The requester may have given up; nothing to do then.
                    let _ = waiter.send(reply);
                }
                None => warn!(?kind, "Unsolicited method from broker"),
            }
            Ok(())
        }
    }
}
