//! Consumer client: pulls a subscribed topic and hands batches to a callback

use crate::client::{ClientBase, ClientContext};
use crate::config::ConsumerConfig;
use crate::error::{RelaymqClientError, ResponseCode};
use crate::metrics::{global_metrics, ClientMetrics};
use crate::protocol::{request_code, MessageExt, MessageQueue, Offset, RemotingCommand};
use crate::session::BrokerSession;
use crate::transport::ReceiveHook;
use crate::Result;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Consume callback. Returning `false` leaves the batch unacknowledged so it
/// is delivered again on the next pass.
pub type ConsumeFn = Arc<dyn Fn(&MessageQueue, &[MessageExt]) -> bool + Send + Sync>;

/// Push-style consumer driven by a background pull task
pub struct Consumer {
    inner: Arc<ConsumerInner>,
    shutdown: watch::Sender<bool>,
    /// Held for the whole start sequence so concurrent starts spawn one pull task
    starting: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct ConsumerInner {
    base: ClientBase,
    config: ConsumerConfig,
    handler: RwLock<Option<ConsumeFn>>,
    offsets: Mutex<HashMap<MessageQueue, Offset>>,
    metrics: Arc<ClientMetrics>,
}

impl Consumer {
    /// Create a consumer that talks TCP to the configured name server
    pub fn new(config: ConsumerConfig) -> Self {
        let context = ClientContext::tcp(&config.client_config);
        Self::with_context(config, context)
    }

    /// Create a new consumer on an existing transport and route source
    pub fn with_context(mut config: ConsumerConfig, context: ClientContext) -> Self {
        if let Some(subscription) = &config.subscription {
            config.client_config.topic = subscription.topic.clone();
        }

        let metrics = global_metrics();
        let base = ClientBase::new(config.client_config.clone(), context).with_receive_hook(
            notification_hook(config.client_config.group.clone(), metrics.clone()),
        );

        Self {
            inner: Arc::new(ConsumerInner {
                base,
                config,
                handler: RwLock::new(None),
                offsets: Mutex::new(HashMap::new()),
                metrics,
            }),
            shutdown: watch::channel(false).0,
            starting: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    /// Install the consume callback; must happen before [`Consumer::start`]
    pub fn set_handler(&self, handler: ConsumeFn) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Install a closure as the consume callback
    pub fn on_consume<F>(&self, handler: F)
    where
        F: Fn(&MessageQueue, &[MessageExt]) -> bool + Send + Sync + 'static,
    {
        self.set_handler(Arc::new(handler));
    }

    /// Get the underlying client
    pub fn client(&self) -> &ClientBase {
        &self.inner.base
    }

    /// Get the consumer configuration
    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    /// Get the consumer group
    pub fn group(&self) -> &str {
        self.inner.base.group()
    }

    /// Get the subscribed topic
    pub fn topic(&self) -> &str {
        self.inner.base.topic()
    }

    /// Discover brokers, register with each of them and begin pulling
    pub async fn start(&self) -> Result<()> {
        if self.inner.handler.read().is_none() {
            return Err(RelaymqClientError::invalid_argument("consume handler"));
        }
        if self.inner.config.subscription.is_none() {
            return Err(RelaymqClientError::invalid_argument("subscription"));
        }

        let _starting = self.starting.lock().await;
        if self.task.lock().is_some() {
            return Ok(());
        }

        self.inner.base.start().await?;
        self.inner.base.heartbeat(self.inner.heartbeat_body()?).await;

        let inner = self.inner.clone();
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move { inner.run(shutdown).await });
        *self.task.lock() = Some(handle);

        info!(
            "Consumer {} started for topic {} ({})",
            self.group(),
            self.topic(),
            self.inner.subscription_expression()
        );
        Ok(())
    }

    /// Committed position of a queue, if one is known locally
    pub fn offset(&self, queue: &MessageQueue) -> Option<Offset> {
        self.inner.offsets.lock().get(queue).copied()
    }

    /// Stop pulling and close every broker session
    pub async fn close(&self) -> Result<()> {
        let _starting = self.starting.lock().await;
        self.shutdown.send_replace(true);

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Pull task of consumer {} failed: {}", self.group(), e);
            }
        }

        self.inner.base.close().await?;
        info!("Consumer {} for topic {} closed", self.group(), self.topic());
        Ok(())
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("base", &self.inner.base)
            .finish_non_exhaustive()
    }
}

/// Resolves once shutdown is signalled or the signalling side is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn notification_hook(group: String, metrics: Arc<ClientMetrics>) -> ReceiveHook {
    Arc::new(move |command: RemotingCommand| {
        if command.code == request_code::NOTIFY_CONSUMER_IDS_CHANGED {
            metrics.record_membership_change();
            info!("[{}] Consumer membership changed", group);
        } else {
            debug!("[{}] Ignoring broker command {}", group, command.code);
        }
        None
    })
}

impl ConsumerInner {
    fn subscription_expression(&self) -> String {
        self.config
            .subscription
            .as_ref()
            .map(|s| s.expression())
            .unwrap_or_else(|| "*".to_string())
    }

    fn heartbeat_body(&self) -> Result<Bytes> {
        let subscription = self.config.subscription.as_ref();
        let consume_from = if self.config.from_last_offset {
            "CONSUME_FROM_LAST_OFFSET"
        } else {
            "CONSUME_FROM_FIRST_OFFSET"
        };
        let body = json!({
            "clientID": self.base.client_id(),
            "producerDataSet": [],
            "consumerDataSet": [{
                "groupName": self.base.group(),
                "consumeType": "CONSUME_PASSIVELY",
                "messageModel": "CLUSTERING",
                "consumeFromWhere": consume_from,
                "subscriptionDataSet": [{
                    "topic": self.base.topic(),
                    "subString": self.subscription_expression(),
                    "tagsSet": subscription.map(|s| s.tags.clone()).unwrap_or_default(),
                }],
                "unitMode": self.base.config().unit_mode,
            }],
        });
        Ok(Bytes::from(serde_json::to_vec(&body)?))
    }

    /// Readable queues of the subscribed topic across all brokers
    fn queues(&self) -> Vec<MessageQueue> {
        self.base
            .brokers()
            .into_iter()
            .filter(|b| b.is_readable())
            .flat_map(|b| {
                let topic = self.base.topic().to_string();
                (0..b.read_queue_nums).map(move |id| MessageQueue::new(topic.clone(), b.name.clone(), id))
            })
            .collect()
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let queues = self.queues();
        debug!("[{}] Pulling {} queue(s)", self.base.group(), queues.len());

        loop {
            for queue in &queues {
                tokio::select! {
                    _ = stopped(&mut shutdown) => return,
                    result = self.pull_once(queue) => {
                        match result {
                            Err(e) if e.is_timeout() => {
                                debug!("[{}] Pull from {} timed out", self.base.group(), queue)
                            }
                            Err(e) => warn!("[{}] Pull from {} failed: {}", self.base.group(), queue, e),
                            Ok(()) => {}
                        }
                    }
                }
            }

            tokio::select! {
                _ = stopped(&mut shutdown) => return,
                _ = tokio::time::sleep(self.config.pull_interval) => {}
            }
        }
    }

    async fn pull_once(&self, queue: &MessageQueue) -> Result<()> {
        let session = self.base.require_broker(&queue.broker_name).await?;
        let offset = self.resolve_offset(&session, queue).await?;

        let request = RemotingCommand::request(request_code::PULL_MESSAGE)
            .with_ext_field("consumerGroup", self.base.group())
            .with_ext_field("topic", &queue.topic)
            .with_ext_field("queueId", queue.queue_id)
            .with_ext_field("queueOffset", offset)
            .with_ext_field("maxMsgNums", self.config.batch_size)
            .with_ext_field("sysFlag", 0)
            .with_ext_field("commitOffset", offset)
            .with_ext_field("suspendTimeoutMillis", 0)
            .with_ext_field("subscription", self.subscription_expression())
            .with_ext_field("subVersion", 0)
            .with_ext_field("expressionType", "TAG");

        let response = session.invoke_command(request).await?;
        match response.response_code() {
            ResponseCode::Success => {
                let messages: Vec<MessageExt> = if response.body.is_empty() {
                    Vec::new()
                } else {
                    serde_json::from_slice(&response.body)?
                };
                let next_offset = response
                    .parse_ext_field::<Offset>("nextBeginOffset")
                    .unwrap_or(offset + messages.len() as Offset);

                if !self.deliver(queue, messages) {
                    return Ok(());
                }
                self.commit(&session, queue, next_offset).await;
            }
            ResponseCode::PullNotFound | ResponseCode::PullRetryImmediately => {}
            ResponseCode::PullOffsetMoved => {
                if let Ok(next_offset) = response.parse_ext_field::<Offset>("nextBeginOffset") {
                    warn!(
                        "[{}] Offset of {} moved from {} to {}",
                        self.base.group(),
                        queue,
                        offset,
                        next_offset
                    );
                    self.commit(&session, queue, next_offset).await;
                }
            }
            _ => {
                response.into_result()?;
            }
        }
        Ok(())
    }

    /// Hand the matching messages to the callback; `false` means retry the batch
    fn deliver(&self, queue: &MessageQueue, messages: Vec<MessageExt>) -> bool {
        let messages: Vec<MessageExt> = match &self.config.subscription {
            Some(subscription) => messages
                .into_iter()
                .filter(|m| subscription.matches(m.tags.as_deref()))
                .collect(),
            None => messages,
        };
        if messages.is_empty() {
            return true;
        }

        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            return false;
        };

        if handler(queue, &messages) {
            self.metrics.record_consume(messages.len() as u64);
            true
        } else {
            self.metrics.record_consume_failure();
            warn!(
                "[{}] Handler rejected {} message(s) from {}",
                self.base.group(),
                messages.len(),
                queue
            );
            false
        }
    }

    /// Starting offset of a queue: the local position, else the broker's
    /// committed offset, else head or tail per configuration
    async fn resolve_offset(&self, session: &BrokerSession, queue: &MessageQueue) -> Result<Offset> {
        if let Some(offset) = self.offsets.lock().get(queue).copied() {
            return Ok(offset);
        }

        let committed = self.query_committed_offset(session, queue).await?;
        let skip = self.config.skip_over_stored_msg_count;

        let offset = match committed {
            Some(committed) if skip > 0 => {
                let max = self.query_max_offset(session, queue).await?;
                if max.saturating_sub(committed) > skip {
                    info!(
                        "[{}] Skipping {} stored message(s) on {}",
                        self.base.group(),
                        max - committed,
                        queue
                    );
                    max
                } else {
                    committed
                }
            }
            Some(committed) => committed,
            None if self.config.from_last_offset => self.query_max_offset(session, queue).await?,
            None => 0,
        };

        self.offsets.lock().insert(queue.clone(), offset);
        debug!("[{}] Starting {} at offset {}", self.base.group(), queue, offset);
        Ok(offset)
    }

    async fn query_committed_offset(
        &self,
        session: &BrokerSession,
        queue: &MessageQueue,
    ) -> Result<Option<Offset>> {
        let request = RemotingCommand::request(request_code::QUERY_CONSUMER_OFFSET)
            .with_ext_field("consumerGroup", self.base.group())
            .with_ext_field("topic", &queue.topic)
            .with_ext_field("queueId", queue.queue_id);

        let response = session.invoke_command(request).await?;
        if response.response_code() == ResponseCode::QueryNotFound {
            return Ok(None);
        }
        let response = response.into_result()?;
        Ok(Some(response.parse_ext_field("offset")?))
    }

    async fn query_max_offset(&self, session: &BrokerSession, queue: &MessageQueue) -> Result<Offset> {
        let request = RemotingCommand::request(request_code::GET_MAX_OFFSET)
            .with_ext_field("topic", &queue.topic)
            .with_ext_field("queueId", queue.queue_id);

        let response = session.invoke_command(request).await?.into_result()?;
        response.parse_ext_field("offset")
    }

    /// Record the new position locally and report it to the broker
    async fn commit(&self, session: &BrokerSession, queue: &MessageQueue, offset: Offset) {
        self.offsets.lock().insert(queue.clone(), offset);

        let request = RemotingCommand::request(request_code::UPDATE_CONSUMER_OFFSET)
            .with_ext_field("consumerGroup", self.base.group())
            .with_ext_field("topic", &queue.topic)
            .with_ext_field("queueId", queue.queue_id)
            .with_ext_field("commitOffset", offset);

        if let Err(e) = session
            .invoke_command(request)
            .await
            .and_then(|response| response.into_result())
        {
            debug!(
                "[{}] Failed to commit offset {} for {}: {}",
                self.base.group(),
                offset,
                queue,
                e
            );
        }
    }
}
