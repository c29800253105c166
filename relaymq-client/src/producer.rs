//! Producer client for publishing messages to a topic

use crate::client::{ClientBase, ClientContext};
use crate::config::ProducerConfig;
use crate::error::RelaymqClientError;
use crate::metrics::{global_metrics, ClientMetrics};
use crate::protocol::{request_code, Message, MessageQueue, RemotingCommand, SendResult};
use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Publishes messages to the topic named in its configuration
pub struct Producer {
    base: ClientBase,
    config: ProducerConfig,
    next_queue: AtomicUsize,
    metrics: Arc<ClientMetrics>,
}

impl Producer {
    /// Create a producer that talks TCP to the configured name server
    pub fn new(config: ProducerConfig) -> Self {
        let context = ClientContext::tcp(&config.client_config);
        Self::with_context(config, context)
    }

    /// Create a new producer on an existing transport and route source
    pub fn with_context(config: ProducerConfig, context: ClientContext) -> Self {
        Self {
            base: ClientBase::new(config.client_config.clone(), context),
            config,
            next_queue: AtomicUsize::new(0),
            metrics: global_metrics(),
        }
    }

    /// Discover the brokers of the configured topic
    pub async fn start(&self) -> Result<()> {
        self.base.start().await?;
        info!(
            "Producer {} started for topic {}",
            self.base.group(),
            self.base.topic()
        );
        Ok(())
    }

    /// Get the underlying client
    pub fn client(&self) -> &ClientBase {
        &self.base
    }

    /// Get the producer configuration
    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Get the topic this producer publishes to
    pub fn topic(&self) -> &str {
        self.base.topic()
    }

    /// Create or update a topic on every known broker
    pub async fn create_or_update_topic(
        &self,
        topic: &str,
        queue_num: u32,
        topic_sys_flag: u32,
    ) -> Result<()> {
        self.base
            .create_or_update_topic(topic, queue_num, topic_sys_flag)
            .await
    }

    /// Next write queue, round-robin over every writable broker's queues
    pub fn select_queue(&self) -> Result<MessageQueue> {
        let queues: Vec<MessageQueue> = self
            .base
            .brokers()
            .into_iter()
            .filter(|b| b.is_writable())
            .flat_map(|b| {
                let topic = self.topic().to_string();
                (0..b.write_queue_nums).map(move |id| MessageQueue::new(topic.clone(), b.name.clone(), id))
            })
            .collect();

        if queues.is_empty() {
            return Err(RelaymqClientError::RouteNotFound {
                topic: self.topic().to_string(),
            });
        }

        let index = self.next_queue.fetch_add(1, Ordering::Relaxed) % queues.len();
        Ok(queues[index].clone())
    }

    /// Publish one message and wait for the broker's answer
    pub async fn publish(&self, message: Message) -> Result<SendResult> {
        if !self.base.is_active() {
            return Err(RelaymqClientError::NotStarted);
        }
        if message.body.len() > self.config.max_message_size {
            return Err(RelaymqClientError::MessageTooLarge {
                size: message.body.len(),
                max_size: self.config.max_message_size,
            });
        }

        let queue = self.select_queue()?;
        let size = message.body.len() as u64;
        let started = Instant::now();

        match self.send_to(&queue, message).await {
            Ok(result) => {
                self.metrics.record_send(size, started.elapsed());
                debug!(
                    "Sent message {} to {} at offset {}",
                    result.msg_id, result.queue, result.queue_offset
                );
                Ok(result)
            }
            Err(e) => {
                self.metrics.record_send_error();
                Err(e)
            }
        }
    }

    async fn send_to(&self, queue: &MessageQueue, message: Message) -> Result<SendResult> {
        let session = self.base.require_broker(&queue.broker_name).await?;
        let born_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        let request = RemotingCommand::request(request_code::SEND_MESSAGE)
            .with_ext_field("producerGroup", self.base.group())
            .with_ext_field("topic", &queue.topic)
            .with_ext_field("defaultTopic", crate::config::DEFAULT_TOPIC)
            .with_ext_field("defaultTopicQueueNums", self.config.default_topic_queue_nums)
            .with_ext_field("queueId", queue.queue_id)
            .with_ext_field("sysFlag", 0)
            .with_ext_field("bornTimestamp", born_timestamp)
            .with_ext_field("flag", 0)
            .with_ext_field("properties", message.encode_properties())
            .with_ext_field("reconsumeTimes", 0)
            .with_ext_field("unitMode", self.base.config().unit_mode)
            .with_ext_field("batch", false)
            .with_body(message.body);

        let response = session
            .invoke_with_timeout(request, self.config.send_timeout)
            .await?;
        SendResult::from_response(response, queue.clone())
    }

    /// Close every broker session of this producer
    pub async fn close(&self) -> Result<()> {
        self.base.close().await?;
        info!("Producer {} for topic {} closed", self.base.group(), self.topic());
        Ok(())
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}
