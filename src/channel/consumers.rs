// src/channel/consumers.rs

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{ChannelError, Result};
use crate::method::Delivery;

/// Callback invoked for every delivery to one consumer tag, in arrival order.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    handlers: HashMap<String, DeliveryHandler>,
}

impl ConsumerRegistry {
    pub fn register(&mut self, consumer_tag: &str, handler: DeliveryHandler) -> Result<()> {
        if self.handlers.contains_key(consumer_tag) {
            return Err(ChannelError::DuplicateConsumer(consumer_tag.to_string()));
        }
        self.handlers.insert(consumer_tag.to_string(), handler);
        Ok(())
    }

    pub fn deregister(&mut self, consumer_tag: &str) -> bool {
        self.handlers.remove(consumer_tag).is_some()
    }

    pub fn get(&self, consumer_tag: &str) -> Option<DeliveryHandler> {
        self.handlers.get(consumer_tag).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}
