use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::BasicProperties;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rabbit_channel::config::find_config_file;
use rabbit_channel::{
    Channel, ChannelConfig, ConsumeOptions, DeclareOptions, Delivery, Exchange, MemoryTransport,
    Method, PublishOptions, ReturnedMessage, Topic, WithConfirm,
};

const CHANNEL_ID: u16 = 1;

fn load_config() -> Result<ChannelConfig> {
    match find_config_file() {
        Some(path) => ChannelConfig::load(&path),
        None => ChannelConfig::from_env(),
    }
}

/// Drives a confirmed channel against the in-memory transport, playing the
/// broker's acks, returns and deliveries by hand.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = load_config().context("Failed to load channel configuration")?;
    let broker = Arc::new(MemoryTransport::new("demo-connection"));
    let channel =
        Channel::<WithConfirm>::open_with_config(&config, broker.clone(), CHANNEL_ID).await?;
    info!(identity = channel.identity(), "Channel ready");

    let logs = Exchange::<Topic>::declare(&channel, "logs", DeclareOptions::default()).await?;
    logs.bind_queue(&channel, "q1", "*.error".to_string()).await?;

    let consumer_tag = channel
        .basic_consume("q1", None, ConsumeOptions::default(), |delivery: Delivery| {
            info!(
                delivery_tag = delivery.delivery_tag,
                body = %String::from_utf8_lossy(&delivery.body),
                "Consumed"
            );
        })
        .await?;
    let mut returns = channel.returns();

    // Routed publish: the broker acks it.
    let routed = logs
        .publish(
            &channel,
            PublishOptions::default(),
            "app.error",
            BasicProperties::default(),
            b"disk full".to_vec(),
        )
        .await?;
    broker.inject(
        CHANNEL_ID,
        Method::BasicAck {
            delivery_tag: routed.delivery_tag(),
            multiple: false,
        },
    )?;
    let outcome = routed.await;
    info!(?outcome, "Routed publish settled");

    // Mandatory publish nobody is bound for: returned, then acked.
    let unroutable = logs
        .publish(
            &channel,
            PublishOptions { mandatory: true },
            "app.debug",
            BasicProperties::default(),
            b"nobody listens".to_vec(),
        )
        .await?;
    let delivery_tag = unroutable.delivery_tag();
    broker.inject(
        CHANNEL_ID,
        Method::BasicReturn(ReturnedMessage {
            reply_code: 312,
            reply_text: "NO_ROUTE".to_string(),
            exchange: logs.name().to_string(),
            routing_key: "app.debug".to_string(),
            properties: BasicProperties::default(),
            body: b"nobody listens".to_vec(),
        }),
    )?;
    broker.inject(
        CHANNEL_ID,
        Method::BasicAck {
            delivery_tag,
            multiple: false,
        },
    )?;
    let outcome = unroutable.await;
    info!(?outcome, "Unroutable publish settled");
    if let Some(returned) = returns.next().await {
        info!(routing_key = %returned.routing_key, reply = %returned.reply_text, "Returned");
    }

    broker.inject(
        CHANNEL_ID,
        Method::BasicDeliver {
            consumer_tag: consumer_tag.clone(),
            delivery: Delivery {
                delivery_tag: 1,
                redelivered: false,
                exchange: logs.name().to_string(),
                routing_key: "app.error".to_string(),
                properties: BasicProperties::default(),
                body: b"disk full".to_vec(),
            },
        },
    )?;
    channel.basic_ack(1, false).await?;

    channel.basic_cancel(&consumer_tag).await?;
    logs.delete(&channel, false).await?;
    channel.close().await?;
    info!("Channel closed");
    Ok(())
}
