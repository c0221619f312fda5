// src/exchange.rs
//
// Exchanges carry their routing discipline in their type, which fixes the
// shape of the argument every bind/unbind call must supply.

use std::marker::PhantomData;

use lapin::types::FieldTable;
use lapin::BasicProperties;
use tracing::debug;

use crate::channel::{Channel, PublishOptions};
use crate::confirm::ConfirmMode;
use crate::errors::Result;
use crate::method::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    /// The `type` field of `exchange.declare`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

/// What a binding puts on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingArgs {
    Empty,
    RoutingKey(String),
    Headers(FieldTable),
}

impl BindingArgs {
    /// `(routing_key, arguments)` of a bind/unbind request.
    fn into_fields(self) -> (String, FieldTable) {
        match self {
            BindingArgs::Empty => (String::new(), FieldTable::default()),
            BindingArgs::RoutingKey(routing_key) => (routing_key, FieldTable::default()),
            BindingArgs::Headers(arguments) => (String::new(), arguments),
        }
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Direct {}
    impl Sealed for super::Fanout {}
    impl Sealed for super::Topic {}
    impl Sealed for super::Headers {}
}

pub trait ExchangeKind: private::Sealed + Send + Sync + 'static {
    /// The argument a binding on this kind of exchange requires.
    type Binding;

    const TYPE: ExchangeType;

    fn binding_args(binding: Self::Binding) -> BindingArgs;
}

#[derive(Debug, Clone, Copy)]
pub struct Direct;

#[derive(Debug, Clone, Copy)]
pub struct Fanout;

#[derive(Debug, Clone, Copy)]
pub struct Topic;

#[derive(Debug, Clone, Copy)]
pub struct Headers;

impl ExchangeKind for Direct {
    type Binding = ();
    const TYPE: ExchangeType = ExchangeType::Direct;

    fn binding_args(_: ()) -> BindingArgs {
        BindingArgs::Empty
    }
}

impl ExchangeKind for Fanout {
    type Binding = ();
    const TYPE: ExchangeType = ExchangeType::Fanout;

    fn binding_args(_: ()) -> BindingArgs {
        BindingArgs::Empty
    }
}

impl ExchangeKind for Topic {
    /// Binding pattern, e.g. `*.error`.
    type Binding = String;
    const TYPE: ExchangeType = ExchangeType::Topic;

    fn binding_args(routing_key: String) -> BindingArgs {
        BindingArgs::RoutingKey(routing_key)
    }
}

impl ExchangeKind for Headers {
    /// Header match arguments, including `x-match` when wanted.
    type Binding = FieldTable;
    const TYPE: ExchangeType = ExchangeType::Headers;

    fn binding_args(arguments: FieldTable) -> BindingArgs {
        BindingArgs::Headers(arguments)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
}

/// A declared exchange of kind `K`.
#[derive(Debug, Clone)]
pub struct Exchange<K: ExchangeKind> {
    name: String,
    _kind: PhantomData<K>,
}

impl<K: ExchangeKind> Exchange<K> {
    pub async fn declare<M: ConfirmMode>(
        channel: &Channel<M>,
        name: &str,
        options: DeclareOptions,
    ) -> Result<Self> {
        debug!(channel = channel.id(), exchange = name, kind = K::TYPE.as_str(), "Declaring exchange");
        channel
            .core()
            .call(Method::ExchangeDeclare {
                exchange: name.to_string(),
                kind: K::TYPE.as_str().to_string(),
                passive: options.passive,
                durable: options.durable,
                auto_delete: options.auto_delete,
                internal: false,
                nowait: false,
                arguments: FieldTable::default(),
            })
            .await?;
        Ok(Self {
            name: name.to_string(),
            _kind: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeType {
        K::TYPE
    }

    pub async fn delete<M: ConfirmMode>(self, channel: &Channel<M>, if_unused: bool) -> Result<()> {
        debug!(channel = channel.id(), exchange = %self.name, if_unused, "Deleting exchange");
        channel
            .core()
            .call(Method::ExchangeDelete {
                exchange: self.name,
                if_unused,
                nowait: false,
            })
            .await
    }

    pub async fn bind_queue<M: ConfirmMode>(
        &self,
        channel: &Channel<M>,
        queue: &str,
        binding: K::Binding,
    ) -> Result<()> {
        let (routing_key, arguments) = K::binding_args(binding).into_fields();
        debug!(channel = channel.id(), exchange = %self.name, queue, %routing_key, "Binding queue");
        channel
            .core()
            .call(Method::QueueBind {
                queue: queue.to_string(),
                exchange: self.name.clone(),
                routing_key,
                nowait: false,
                arguments,
            })
            .await
    }

    pub async fn unbind_queue<M: ConfirmMode>(
        &self,
        channel: &Channel<M>,
        queue: &str,
        binding: K::Binding,
    ) -> Result<()> {
        let (routing_key, arguments) = K::binding_args(binding).into_fields();
        debug!(channel = channel.id(), exchange = %self.name, queue, %routing_key, "Unbinding queue");
        channel
            .core()
            .call(Method::QueueUnbind {
                queue: queue.to_string(),
                exchange: self.name.clone(),
                routing_key,
                arguments,
            })
            .await
    }

    /// Bind `destination` to this exchange; the binding follows this
    /// (source) exchange's kind.
    pub async fn bind_exchange<M: ConfirmMode>(
        &self,
        channel: &Channel<M>,
        destination: &str,
        binding: K::Binding,
    ) -> Result<()> {
        let (routing_key, arguments) = K::binding_args(binding).into_fields();
        debug!(channel = channel.id(), source = %self.name, destination, "Binding exchange");
        channel
            .core()
            .call(Method::ExchangeBind {
                destination: destination.to_string(),
                source: self.name.clone(),
                routing_key,
                nowait: false,
                arguments,
            })
            .await
    }

    pub async fn unbind_exchange<M: ConfirmMode>(
        &self,
        channel: &Channel<M>,
        destination: &str,
        binding: K::Binding,
    ) -> Result<()> {
        let (routing_key, arguments) = K::binding_args(binding).into_fields();
        debug!(channel = channel.id(), source = %self.name, destination, "Unbinding exchange");
        channel
            .core()
            .call(Method::ExchangeUnbind {
                destination: destination.to_string(),
                source: self.name.clone(),
                routing_key,
                nowait: false,
                arguments,
            })
            .await
    }

    /// Publish to this exchange. Sending and awaiting the confirmation are two
    /// steps: this returns once the message is written.
    pub async fn publish<M: ConfirmMode>(
        &self,
        channel: &Channel<M>,
        options: PublishOptions,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<M::Pending> {
        channel
            .basic_publish(&self.name, routing_key, options, properties, body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::AMQPValue;

    #[test]
    fn type_names_match_the_protocol() {
        assert_eq!(Direct::TYPE.as_str(), "direct");
        assert_eq!(Fanout::TYPE.as_str(), "fanout");
        assert_eq!(Topic::TYPE.as_str(), "topic");
        assert_eq!(Headers::TYPE.as_str(), "headers");
    }

    #[test]
    fn binding_fields_follow_the_kind() {
        let (key, args) = Direct::binding_args(()).into_fields();
        assert!(key.is_empty());
        assert_eq!(args, FieldTable::default());

        let (key, args) = Fanout::binding_args(()).into_fields();
        assert!(key.is_empty());
        assert_eq!(args, FieldTable::default());

        let (key, args) = Topic::binding_args("*.error".to_string()).into_fields();
        assert_eq!(key, "*.error");
        assert_eq!(args, FieldTable::default());

        let mut headers = FieldTable::default();
        headers.insert("x-match".into(), AMQPValue::LongString("all".to_string().into()));
        let (key, args) = Headers::binding_args(headers.clone()).into_fields();
        assert!(key.is_empty());
        assert_eq!(args, headers);
    }
}
