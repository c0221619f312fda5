// Exchange declaration, kind-specific binding arguments and transactions.

use std::sync::Arc;

use lapin::types::{AMQPValue, FieldTable};

use rabbit_channel::{
    Channel, ChannelError, DeclareOptions, Direct, Exchange, ExchangeType, Fanout, Headers,
    MemoryTransport, Method, MethodKind, NoConfirm, Topic, Transaction, WithConfirm,
};

const CH: u16 = 1;

async fn channel(transport: &Arc<MemoryTransport>) -> Channel<NoConfirm> {
    Channel::<NoConfirm>::open("test", transport.clone(), CH)
        .await
        .unwrap()
}

fn queue_bind(exchange: &str, routing_key: &str, arguments: FieldTable) -> Method {
    Method::QueueBind {
        queue: "q1".to_string(),
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        nowait: false,
        arguments,
    }
}

fn match_all() -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert("x-match".into(), AMQPValue::LongString("all".to_string().into()));
    arguments.insert("format".into(), AMQPValue::LongString("pdf".to_string().into()));
    arguments
}

#[tokio::test]
async fn declare_sends_the_kind_and_options() {
    let transport = Arc::new(MemoryTransport::new("conn"));
    let channel = channel(&transport).await;
    let options = DeclareOptions {
        durable: true,
        auto_delete: true,
        ..DeclareOptions::default()
    };

    let logs = Exchange::<Topic>::declare(&channel, "logs", options)
        .await
        .unwrap();

    assert_eq!(logs.name(), "logs");
    assert_eq!(logs.kind(), ExchangeType::Topic);
    assert_eq!(
        transport.sent_of(CH, MethodKind::ExchangeDeclare),
        vec![Method::ExchangeDeclare {
            exchange: "logs".to_string(),
            kind: "topic".to_string(),
            passive: false,
            durable: true,
            auto_delete: true,
            internal: false,
            nowait: false,
            arguments: FieldTable::default(),
        }]
    );
}

#[tokio::test]
async fn bindings_carry_the_kind_specific_argument() {
    let transport = Arc::new(MemoryTransport::new("conn"));
    let channel = channel(&transport).await;
    let options = DeclareOptions::default();

    let direct = Exchange::<Direct>::declare(&channel, "d", options).await.unwrap();
    let fanout = Exchange::<Fanout>::declare(&channel, "f", options).await.unwrap();
    let topic = Exchange::<Topic>::declare(&channel, "t", options).await.unwrap();
    let headers = Exchange::<Headers>::declare(&channel, "h", options).await.unwrap();

    direct.bind_queue(&channel, "q1", ()).await.unwrap();
    fanout.bind_queue(&channel, "q1", ()).await.unwrap();
    topic
        .bind_queue(&channel, "q1", "*.error".to_string())
        .await
        .unwrap();
    headers.bind_queue(&channel, "q1", match_all()).await.unwrap();

    assert_eq!(
        transport.sent_of(CH, MethodKind::QueueBind),
        vec![
            queue_bind("d", "", FieldTable::default()),
            queue_bind("f", "", FieldTable::default()),
            queue_bind("t", "*.error", FieldTable::default()),
            queue_bind("h", "", match_all()),
        ]
    );
    let kinds: Vec<String> = transport
        .sent_of(CH, MethodKind::ExchangeDeclare)
        .into_iter()
        .filter_map(|method| match method {
            Method::ExchangeDeclare { kind, .. } => Some(kind),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec!["direct", "fanout", "topic", "headers"]);
}

#[tokio::test]
async fn unbind_mirrors_bind() {
    let transport = Arc::new(MemoryTransport::new("conn"));
    let channel = channel(&transport).await;
    let topic = Exchange::<Topic>::declare(&channel, "t", DeclareOptions::default())
        .await
        .unwrap();

    topic
        .unbind_queue(&channel, "q1", "*.error".to_string())
        .await
        .unwrap();

    assert_eq!(
        transport.sent_of(CH, MethodKind::QueueUnbind),
        vec![Method::QueueUnbind {
            queue: "q1".to_string(),
            exchange: "t".to_string(),
            routing_key: "*.error".to_string(),
            arguments: FieldTable::default(),
        }]
    );
}

#[tokio::test]
async fn exchange_to_exchange_binding_follows_the_source_kind() {
    let transport = Arc::new(MemoryTransport::new("conn"));
    let channel = channel(&transport).await;
    let source = Exchange::<Headers>::declare(&channel, "h", DeclareOptions::default())
        .await
        .unwrap();

    source
        .bind_exchange(&channel, "archive", match_all())
        .await
        .unwrap();
    source
        .unbind_exchange(&channel, "archive", match_all())
        .await
        .unwrap();

    assert_eq!(
        transport.sent_of(CH, MethodKind::ExchangeBind),
        vec![Method::ExchangeBind {
            destination: "archive".to_string(),
            source: "h".to_string(),
            routing_key: String::new(),
            nowait: false,
            arguments: match_all(),
        }]
    );
    assert_eq!(transport.sent_of(CH, MethodKind::ExchangeUnbind).len(), 1);
}

#[tokio::test]
async fn delete_sends_if_unused() {
    let transport = Arc::new(MemoryTransport::new("conn"));
    let channel = channel(&transport).await;
    let fanout = Exchange::<Fanout>::declare(&channel, "f", DeclareOptions::default())
        .await
        .unwrap();

    fanout.delete(&channel, true).await.unwrap();

    assert_eq!(
        transport.sent_of(CH, MethodKind::ExchangeDelete),
        vec![Method::ExchangeDelete {
            exchange: "f".to_string(),
            if_unused: true,
            nowait: false,
        }]
    );
}

#[tokio::test]
async fn refused_declare_closes_the_channel() {
    let transport = Arc::new(MemoryTransport::new("conn"));
    let channel = channel(&transport).await;
    transport.fail_next(MethodKind::ExchangeDeclare, 406, "PRECONDITION_FAILED");

    let result = Exchange::<Direct>::declare(&channel, "d", DeclareOptions::default()).await;

    let expected = ChannelError::ClosedByBroker {
        channel: CH,
        reply_code: 406,
        reply_text: "PRECONDITION_FAILED".to_string(),
    };
    assert_eq!(result.err(), Some(expected.clone()));
    assert_eq!(channel.terminated().await, Err(expected));
}

#[tokio::test]
async fn transactions_select_commit_and_roll_back() {
    let transport = Arc::new(MemoryTransport::new("conn"));
    let channel = Channel::<WithConfirm>::open("test", transport.clone(), CH)
        .await
        .unwrap();

    let tx = Transaction::start(&channel).await.unwrap();
    tx.commit().await.unwrap();
    tx.rollback().await.unwrap();

    let tx_methods: Vec<Method> = transport
        .sent(CH)
        .into_iter()
        .filter(|method| {
            matches!(
                method.kind(),
                MethodKind::TxSelect | MethodKind::TxCommit | MethodKind::TxRollback
            )
        })
        .collect();
    assert_eq!(
        tx_methods,
        vec![Method::TxSelect, Method::TxCommit, Method::TxRollback]
    );
}

#[tokio::test]
async fn transaction_fails_once_the_channel_is_closed() {
    let transport = Arc::new(MemoryTransport::new("conn"));
    let channel = channel(&transport).await;
    let tx = Transaction::start(&channel).await.unwrap();

    channel.close().await.unwrap();

    assert_eq!(tx.commit().await, Err(ChannelError::Closed(CH)));
}
