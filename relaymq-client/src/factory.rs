//! Per-topic producer factory

use crate::cache::OnceMap;
use crate::client::ClientContext;
use crate::config::{is_blank, ClientConfig, ProducerConfig, ProducerFactoryConfig};
use crate::error::RelaymqClientError;
use crate::producer::Producer;
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Hands out one started producer per topic.
///
/// A master producer, started on the default topic, provisions each new
/// topic on every broker before the topic's own producer is created. The
/// master is used only for that and is not exposed.
pub struct ProducerFactory {
    name_server_address: String,
    topic_queue_num: u32,
    context: ClientContext,
    master: Producer,
    producers: OnceMap<Arc<Producer>>,
}

impl ProducerFactory {
    /// Factory with the default queue count for new topics
    pub async fn new<S: Into<String>>(name_server_address: S) -> Result<Self> {
        Self::from_config(ProducerFactoryConfig::new(name_server_address)).await
    }

    /// Factory provisioning topics with `topic_queue_num` queues; values below
    /// 1 use the default
    pub async fn with_queue_num<S: Into<String>>(
        name_server_address: S,
        topic_queue_num: u32,
    ) -> Result<Self> {
        let mut config = ProducerFactoryConfig::new(name_server_address);
        config.topic_queue_num = topic_queue_num;
        Self::from_config(config).await
    }

    pub async fn from_config(config: ProducerFactoryConfig) -> Result<Self> {
        if is_blank(&config.name_server_address) {
            return Err(RelaymqClientError::invalid_argument("name_server_address"));
        }
        let context = ClientContext::tcp(&Self::client_config(&config.name_server_address));
        Self::with_context(config, context).await
    }

    /// Factory on an explicit transport and route source
    pub async fn with_context(config: ProducerFactoryConfig, context: ClientContext) -> Result<Self> {
        if is_blank(&config.name_server_address) {
            return Err(RelaymqClientError::invalid_argument("name_server_address"));
        }

        let master_config = ProducerConfig {
            client_config: Self::client_config(&config.name_server_address),
            ..ProducerConfig::default()
        };
        let master = Producer::with_context(master_config, context.clone());
        master.start().await?;

        let topic_queue_num = config.effective_queue_num();
        info!(
            "Producer factory started on {} ({} queues per topic)",
            config.name_server_address, topic_queue_num
        );

        Ok(Self {
            name_server_address: config.name_server_address,
            topic_queue_num,
            context,
            master,
            producers: OnceMap::new(),
        })
    }

    fn client_config(name_server_address: &str) -> ClientConfig {
        ClientConfig {
            name_server_address: name_server_address.to_string(),
            ..ClientConfig::default()
        }
    }

    /// Get the queue count used when provisioning topics
    pub fn topic_queue_num(&self) -> u32 {
        self.topic_queue_num
    }

    /// Started producer for `topic`, created and provisioned on first request
    pub async fn get_topic_producer(&self, topic: &str) -> Result<Arc<Producer>> {
        self.get_topic_producer_with(topic, |_| {}).await
    }

    /// Like [`ProducerFactory::get_topic_producer`]; `configure` runs only when
    /// the producer is actually created, before it starts
    pub async fn get_topic_producer_with<F>(&self, topic: &str, configure: F) -> Result<Arc<Producer>>
    where
        F: FnOnce(&mut ProducerConfig),
    {
        if is_blank(topic) {
            return Err(RelaymqClientError::invalid_argument("topic"));
        }

        self.producers
            .get_or_try_init(topic, || self.create_producer(topic, configure))
            .await
    }

    async fn create_producer<F>(&self, topic: &str, configure: F) -> Result<Arc<Producer>>
    where
        F: FnOnce(&mut ProducerConfig),
    {
        self.master
            .create_or_update_topic(topic, self.topic_queue_num, 0)
            .await?;

        let mut config = ProducerConfig {
            client_config: ClientConfig {
                topic: topic.to_string(),
                ..Self::client_config(&self.name_server_address)
            },
            ..ProducerConfig::default()
        };
        configure(&mut config);

        let producer = Producer::with_context(config, self.context.clone());
        producer.start().await?;
        info!("Created producer for topic {}", topic);
        Ok(Arc::new(producer))
    }

    /// Number of topic producers created so far
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Close the master and every topic producer. Every producer gets its
    /// close call even if earlier ones fail; the failures are reported
    /// together afterwards.
    pub async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.master.close().await {
            warn!("Failed to close master producer: {}", e);
            errors.push(format!("master: {}", e));
        }

        let producers = self.producers.drain().await;
        let total = producers.len() + 1;
        for producer in producers {
            if let Err(e) = producer.close().await {
                warn!("Failed to close producer for topic {}: {}", producer.topic(), e);
                errors.push(format!("{}: {}", producer.topic(), e));
            }
        }

        if let Err(e) = self.context.close().await {
            warn!("Failed to close name server connection: {}", e);
        }

        info!(
            "Producer factory closed ({} of {} producers failed)",
            errors.len(),
            total
        );
        RelaymqClientError::from_dispose_failures(total, errors)
    }
}

impl std::fmt::Debug for ProducerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerFactory")
            .field("name_server_address", &self.name_server_address)
            .field("topic_queue_num", &self.topic_queue_num)
            .field("producers", &self.producers.len())
            .finish()
    }
}
