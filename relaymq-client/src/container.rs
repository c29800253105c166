//! Container owning a set of running consumers

use crate::client::ClientContext;
use crate::config::{is_blank, ClientConfig, ConsumerConfig, Subscription};
use crate::consumer::Consumer;
use crate::error::RelaymqClientError;
use crate::protocol::{MessageExt, MessageQueue};
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Default)]
struct Registry {
    closed: bool,
    consumers: Vec<Arc<Consumer>>,
}

/// Starts consumers on demand and closes all of them together.
///
/// Consumers created here resume from the last committed offset and never
/// skip stored backlog unless the configure hook says otherwise.
pub struct ConsumerContainer {
    name_server_address: String,
    context: ClientContext,
    registry: Mutex<Registry>,
}

impl ConsumerContainer {
    /// Create a new container whose consumers talk TCP to `name_server_address`
    pub fn new<S: Into<String>>(name_server_address: S) -> Result<Self> {
        let name_server_address = name_server_address.into();
        if is_blank(&name_server_address) {
            return Err(RelaymqClientError::invalid_argument("name_server_address"));
        }
        let context = ClientContext::tcp(&ClientConfig {
            name_server_address: name_server_address.clone(),
            ..ClientConfig::default()
        });
        Self::with_context(name_server_address, context)
    }

    /// Container on an explicit transport and route source
    pub fn with_context<S: Into<String>>(name_server_address: S, context: ClientContext) -> Result<Self> {
        let name_server_address = name_server_address.into();
        if is_blank(&name_server_address) {
            return Err(RelaymqClientError::invalid_argument("name_server_address"));
        }
        Ok(Self {
            name_server_address,
            context,
            registry: Mutex::new(Registry::default()),
        })
    }

    /// Start a consumer of `group` on `topic`, filtered to `tags` (empty for
    /// all), delivering batches to `consume_fn`
    pub async fn add_topic_consumer<F, I, S>(
        &self,
        group: &str,
        topic: &str,
        consume_fn: F,
        tags: I,
    ) -> Result<()>
    where
        F: Fn(&MessageQueue, &[MessageExt]) -> bool + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_topic_consumer_with(group, topic, |_| {}, consume_fn, tags)
            .await
    }

    /// Like [`ConsumerContainer::add_topic_consumer`]; `configure` sees the
    /// consumer configuration before the consumer starts
    pub async fn add_topic_consumer_with<C, F, I, S>(
        &self,
        group: &str,
        topic: &str,
        configure: C,
        consume_fn: F,
        tags: I,
    ) -> Result<()>
    where
        C: FnOnce(&mut ConsumerConfig),
        F: Fn(&MessageQueue, &[MessageExt]) -> bool + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if is_blank(group) {
            return Err(RelaymqClientError::invalid_argument("group"));
        }
        if is_blank(topic) {
            return Err(RelaymqClientError::invalid_argument("topic"));
        }
        if self.registry.lock().closed {
            return Err(RelaymqClientError::Closed);
        }

        let mut config = ConsumerConfig {
            client_config: ClientConfig {
                name_server_address: self.name_server_address.clone(),
                group: group.to_string(),
                topic: topic.to_string(),
                ..ClientConfig::default()
            },
            subscription: Some(Subscription::new(topic, tags)),
            from_last_offset: true,
            skip_over_stored_msg_count: 0,
            ..ConsumerConfig::default()
        };
        configure(&mut config);

        let consumer = Consumer::with_context(config, self.context.clone());
        consumer.on_consume(consume_fn);
        if let Err(e) = consumer.start().await {
            if let Err(close_error) = consumer.close().await {
                warn!("Failed to close consumer {} on {}: {}", group, topic, close_error);
            }
            return Err(e);
        }
        let consumer = Arc::new(consumer);

        let accepted = {
            let mut registry = self.registry.lock();
            if registry.closed {
                false
            } else {
                registry.consumers.push(consumer.clone());
                true
            }
        };

        if !accepted {
            if let Err(e) = consumer.close().await {
                warn!("Failed to close consumer {} on {}: {}", group, topic, e);
            }
            return Err(RelaymqClientError::Closed);
        }

        info!("Added consumer {} for topic {}", group, topic);
        Ok(())
    }

    /// Get the number of running consumers
    pub fn len(&self) -> usize {
        self.registry.lock().consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every consumer. Further additions are refused; a failed close is
    /// logged and the rest still run.
    pub async fn close(&self) -> Result<()> {
        let consumers = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            std::mem::take(&mut registry.consumers)
        };

        let total = consumers.len();
        let mut errors = Vec::new();
        for consumer in consumers {
            if let Err(e) = consumer.close().await {
                warn!(
                    "Failed to close consumer {} on {}: {}",
                    consumer.group(),
                    consumer.topic(),
                    e
                );
                errors.push(format!("{}/{}: {}", consumer.group(), consumer.topic(), e));
            }
        }

        if let Err(e) = self.context.close().await {
            warn!("Failed to close name server connection: {}", e);
        }

        info!("Consumer container closed ({} consumers)", total);
        RelaymqClientError::from_dispose_failures(total, errors)
    }
}

impl std::fmt::Debug for ConsumerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerContainer")
            .field("name_server_address", &self.name_server_address)
            .field("consumers", &self.len())
            .finish()
    }
}
