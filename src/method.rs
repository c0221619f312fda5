// src/method.rs
//
// Method records exchanged with the transport. Wire layout belongs to the
// framing layer; these only carry the fields the channel layer reads or sets.

use lapin::types::FieldTable;
use lapin::BasicProperties;

/// A message handed to a consumer by `basic.deliver`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// A mandatory message the broker could not route, handed back by `basic.return`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,

    ExchangeDeclare {
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        nowait: bool,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,
    ExchangeDelete {
        exchange: String,
        if_unused: bool,
        nowait: bool,
    },
    ExchangeDeleteOk,
    ExchangeBind {
        destination: String,
        source: String,
        routing_key: String,
        nowait: bool,
        arguments: FieldTable,
    },
    ExchangeBindOk,
    ExchangeUnbind {
        destination: String,
        source: String,
        routing_key: String,
        nowait: bool,
        arguments: FieldTable,
    },
    ExchangeUnbindOk,

    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        nowait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueUnbindOk,

    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        nowait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        nowait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
        properties: BasicProperties,
        body: Vec<u8>,
    },
    BasicReturn(ReturnedMessage),
    BasicDeliver {
        consumer_tag: String,
        delivery: Delivery,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },

    ConfirmSelect {
        nowait: bool,
    },
    ConfirmSelectOk,

    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,
}

/// Discriminant of a [`Method`], used to key reply subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow,
    ChannelFlowOk,
    ChannelClose,
    ChannelCloseOk,
    ExchangeDeclare,
    ExchangeDeclareOk,
    ExchangeDelete,
    ExchangeDeleteOk,
    ExchangeBind,
    ExchangeBindOk,
    ExchangeUnbind,
    ExchangeUnbindOk,
    QueueBind,
    QueueBindOk,
    QueueUnbind,
    QueueUnbindOk,
    BasicQos,
    BasicQosOk,
    BasicConsume,
    BasicConsumeOk,
    BasicCancel,
    BasicCancelOk,
    BasicPublish,
    BasicReturn,
    BasicDeliver,
    BasicAck,
    BasicNack,
    BasicReject,
    ConfirmSelect,
    ConfirmSelectOk,
    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,
}

impl Method {
    pub fn kind(&self) -> MethodKind {
        match self {
            Method::ChannelOpen => MethodKind::ChannelOpen,
            Method::ChannelOpenOk => MethodKind::ChannelOpenOk,
            Method::ChannelFlow { .. } => MethodKind::ChannelFlow,
            Method::ChannelFlowOk { .. } => MethodKind::ChannelFlowOk,
            Method::ChannelClose { .. } => MethodKind::ChannelClose,
            Method::ChannelCloseOk => MethodKind::ChannelCloseOk,
            Method::ExchangeDeclare { .. } => MethodKind::ExchangeDeclare,
            Method::ExchangeDeclareOk => MethodKind::ExchangeDeclareOk,
            Method::ExchangeDelete { .. } => MethodKind::ExchangeDelete,
            Method::ExchangeDeleteOk => MethodKind::ExchangeDeleteOk,
            Method::ExchangeBind { .. } => MethodKind::ExchangeBind,
            Method::ExchangeBindOk => MethodKind::ExchangeBindOk,
            Method::ExchangeUnbind { .. } => MethodKind::ExchangeUnbind,
            Method::ExchangeUnbindOk => MethodKind::ExchangeUnbindOk,
            Method::QueueBind { .. } => MethodKind::QueueBind,
            Method::QueueBindOk => MethodKind::QueueBindOk,
            Method::QueueUnbind { .. } => MethodKind::QueueUnbind,
            Method::QueueUnbindOk => MethodKind::QueueUnbindOk,
            Method::BasicQos { .. } => MethodKind::BasicQos,
            Method::BasicQosOk => MethodKind::BasicQosOk,
            Method::BasicConsume { .. } => MethodKind::BasicConsume,
            Method::BasicConsumeOk { .. } => MethodKind::BasicConsumeOk,
            Method::BasicCancel { .. } => MethodKind::BasicCancel,
            Method::BasicCancelOk { .. } => MethodKind::BasicCancelOk,
            Method::BasicPublish { .. } => MethodKind::BasicPublish,
            Method::BasicReturn(_) => MethodKind::BasicReturn,
            Method::BasicDeliver { .. } => MethodKind::BasicDeliver,
            Method::BasicAck { .. } => MethodKind::BasicAck,
            Method::BasicNack { .. } => MethodKind::BasicNack,
            Method::BasicReject { .. } => MethodKind::BasicReject,
            Method::ConfirmSelect { .. } => MethodKind::ConfirmSelect,
            Method::ConfirmSelectOk => MethodKind::ConfirmSelectOk,
            Method::TxSelect => MethodKind::TxSelect,
            Method::TxSelectOk => MethodKind::TxSelectOk,
            Method::TxCommit => MethodKind::TxCommit,
            Method::TxCommitOk => MethodKind::TxCommitOk,
            Method::TxRollback => MethodKind::TxRollback,
            Method::TxRollbackOk => MethodKind::TxRollbackOk,
        }
    }

    /// The reply a client-sent synchronous method waits for, or `None` for
    /// asynchronous methods and requests sent with `nowait`.
    pub fn expected_reply(&self) -> Option<MethodKind> {
        match self {
            Method::ChannelOpen => Some(MethodKind::ChannelOpenOk),
            Method::ChannelFlow { .. } => Some(MethodKind::ChannelFlowOk),
            Method::ChannelClose { .. } => Some(MethodKind::ChannelCloseOk),
            Method::ExchangeDeclare { nowait, .. } => {
                (!nowait).then_some(MethodKind::ExchangeDeclareOk)
            }
            Method::ExchangeDelete { nowait, .. } => {
                (!nowait).then_some(MethodKind::ExchangeDeleteOk)
            }
            Method::ExchangeBind { nowait, .. } => (!nowait).then_some(MethodKind::ExchangeBindOk),
            Method::ExchangeUnbind { nowait, .. } => {
                (!nowait).then_some(MethodKind::ExchangeUnbindOk)
            }
            Method::QueueBind { nowait, .. } => (!nowait).then_some(MethodKind::QueueBindOk),
            Method::QueueUnbind { .. } => Some(MethodKind::QueueUnbindOk),
            Method::BasicQos { .. } => Some(MethodKind::BasicQosOk),
            Method::BasicConsume { nowait, .. } => {
                (!nowait).then_some(MethodKind::BasicConsumeOk)
            }
            Method::BasicCancel { nowait, .. } => (!nowait).then_some(MethodKind::BasicCancelOk),
            Method::ConfirmSelect { nowait } => (!nowait).then_some(MethodKind::ConfirmSelectOk),
            Method::TxSelect => Some(MethodKind::TxSelectOk),
            Method::TxCommit => Some(MethodKind::TxCommitOk),
            Method::TxRollback => Some(MethodKind::TxRollbackOk),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nowait_requests_expect_no_reply() {
        let declare = |nowait| Method::ExchangeDeclare {
            exchange: "logs".into(),
            kind: "topic".into(),
            passive: false,
            durable: false,
            auto_delete: false,
            internal: false,
            nowait,
            arguments: FieldTable::default(),
        };
        assert_eq!(
            declare(false).expected_reply(),
            Some(MethodKind::ExchangeDeclareOk)
        );
        assert_eq!(declare(true).expected_reply(), None);
    }

    #[test]
    fn asynchronous_methods_expect_no_reply() {
        let ack = Method::BasicAck {
            delivery_tag: 1,
            multiple: false,
        };
        assert_eq!(ack.kind(), MethodKind::BasicAck);
        assert_eq!(ack.expected_reply(), None);
        assert_eq!(
            Method::TxCommit.expected_reply(),
            Some(MethodKind::TxCommitOk)
        );
    }
}
