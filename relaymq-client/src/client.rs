//! Shared client base: route discovery, broker sessions and topic provisioning

use crate::cache::OnceMap;
use crate::config::{is_blank, ClientConfig};
use crate::error::RelaymqClientError;
use crate::metrics::{global_metrics, ClientMetrics};
use crate::protocol::{perm, request_code, BrokerInfo};
use crate::route::{NameServerClient, RouteSource};
use crate::session::BrokerSession;
use crate::transport::{ignore_inbound, ReceiveHook, TcpTransport, Transport};
use crate::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Transport and route source a client runs on.
///
/// Cloning is cheap; a factory or container hands one context to every
/// client it creates so they share the name server connection.
#[derive(Clone)]
pub struct ClientContext {
    pub transport: Arc<dyn Transport>,
    pub routes: Arc<dyn RouteSource>,
}

impl ClientContext {
    /// Create a new context from a transport and a route source
    pub fn new(transport: Arc<dyn Transport>, routes: Arc<dyn RouteSource>) -> Self {
        Self { transport, routes }
    }

    /// TCP transport plus a name server route source, both from `config`
    pub fn tcp(config: &ClientConfig) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(config.connection_timeout));
        let routes = Arc::new(NameServerClient::new(
            config.name_server_addresses(),
            transport.clone(),
            config.request_timeout,
        ));
        Self::new(transport, routes)
    }

    /// Close the route source connection
    pub async fn close(&self) -> Result<()> {
        self.routes.close().await
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext").finish_non_exhaustive()
    }
}

/// State common to producers and consumers.
///
/// Holds the broker list discovered at start and a lazily populated cache of
/// broker sessions. Each session is opened at most once for the lifetime of
/// the client, however many tasks ask for it concurrently.
pub struct ClientBase {
    config: ClientConfig,
    context: ClientContext,
    brokers: RwLock<Vec<BrokerInfo>>,
    sessions: OnceMap<Arc<BrokerSession>>,
    active: AtomicBool,
    on_received: ReceiveHook,
    metrics: Arc<ClientMetrics>,
}

impl ClientBase {
    /// Create a new client base; call `start` before using it
    pub fn new(config: ClientConfig, context: ClientContext) -> Self {
        Self {
            config,
            context,
            brokers: RwLock::new(Vec::new()),
            sessions: OnceMap::new(),
            active: AtomicBool::new(false),
            on_received: ignore_inbound(),
            metrics: global_metrics(),
        }
    }

    /// Handler for commands brokers push to this client
    pub fn with_receive_hook(mut self, hook: ReceiveHook) -> Self {
        self.on_received = hook;
        self
    }

    /// Get the client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get the transport and route source
    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    /// Get the producer or consumer group
    pub fn group(&self) -> &str {
        &self.config.group
    }

    /// Get the topic whose route this client follows
    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Get the client id reported to brokers
    pub fn client_id(&self) -> String {
        self.config.client_id()
    }

    /// Check if the client has started and not closed
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Discover the brokers serving the configured topic
    pub async fn start(&self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        if self.sessions.is_closed().await {
            return Err(RelaymqClientError::Closed);
        }
        self.config.validate()?;

        let brokers = self.context.routes.route_info(&self.config.topic).await?;
        if brokers.is_empty() {
            return Err(RelaymqClientError::RouteNotFound {
                topic: self.config.topic.clone(),
            });
        }

        for broker in &brokers {
            info!(
                "[{}] Discovered broker {} at {}",
                self.config.group,
                broker.name,
                broker.addresses.join(",")
            );
        }
        *self.brokers.write() = brokers;
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Brokers known from the last route lookup
    pub fn brokers(&self) -> Vec<BrokerInfo> {
        self.brokers.read().clone()
    }

    /// Session for the named broker, opened on first use.
    ///
    /// Returns `Ok(None)` when the name is not in the broker list. A failed
    /// open is returned to every caller waiting on it and is not cached, so
    /// the next call retries.
    pub async fn get_broker(&self, name: &str) -> Result<Option<Arc<BrokerSession>>> {
        if let Some(session) = self.sessions.get(name) {
            return Ok(Some(session));
        }

        let info = match self.brokers.read().iter().find(|b| b.name == name).cloned() {
            Some(info) => info,
            None => return Ok(None),
        };

        let session = self
            .sessions
            .get_or_try_init(name, || self.open_session(info))
            .await?;
        Ok(Some(session))
    }

    /// Like [`ClientBase::get_broker`] but an unknown name is an error
    pub async fn require_broker(&self, name: &str) -> Result<Arc<BrokerSession>> {
        self.get_broker(name)
            .await?
            .ok_or_else(|| RelaymqClientError::BrokerNotFound {
                name: name.to_string(),
            })
    }

    async fn open_session(&self, info: BrokerInfo) -> Result<Arc<BrokerSession>> {
        let session = BrokerSession::new(&info, self.config.request_timeout);
        match session
            .start(self.context.transport.as_ref(), self.on_received.clone())
            .await
        {
            Ok(()) => {
                self.metrics.record_session_created();
                info!(
                    "[{}] Opened session to broker {}",
                    self.config.group, info.name
                );
                Ok(Arc::new(session))
            }
            Err(e) => {
                self.metrics.record_session_failure();
                warn!(
                    "[{}] Failed to open session to broker {}: {}",
                    self.config.group, info.name, e
                );
                Err(e)
            }
        }
    }

    /// Sessions opened so far
    pub fn sessions(&self) -> Vec<Arc<BrokerSession>> {
        self.sessions.values()
    }

    /// Ask every known broker to create or update `topic`.
    ///
    /// Brokers are visited one after another. A broker that fails is logged
    /// and skipped; the call itself still succeeds.
    pub async fn create_or_update_topic(
        &self,
        topic: &str,
        queue_num: u32,
        topic_sys_flag: u32,
    ) -> Result<()> {
        if !self.is_active() {
            return Err(RelaymqClientError::NotStarted);
        }
        if is_blank(topic) {
            return Err(RelaymqClientError::invalid_argument("topic"));
        }

        let header: HashMap<String, String> = [
            ("topic", topic.to_string()),
            ("defaultTopic", self.config.topic.clone()),
            ("readQueueNums", queue_num.to_string()),
            ("writeQueueNums", queue_num.to_string()),
            ("perm", perm::READ_WRITE.to_string()),
            ("topicFilterType", "SINGLE_TAG".to_string()),
            ("topicSysFlag", topic_sys_flag.to_string()),
            ("order", "false".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        for broker in self.brokers() {
            info!(
                "[{}] Creating topic {} on broker {} ({} queues)",
                self.config.group, topic, broker.name, queue_num
            );
            match self.provision_on(&broker.name, header.clone()).await {
                Ok(()) => self.metrics.record_topic_provisioned(),
                Err(e) => {
                    self.metrics.record_provision_failure();
                    warn!(
                        "[{}] Failed to create topic {} on broker {}: {}",
                        self.config.group, topic, broker.name, e
                    );
                }
            }
        }

        Ok(())
    }

    async fn provision_on(&self, broker: &str, header: HashMap<String, String>) -> Result<()> {
        let session = self.require_broker(broker).await?;
        session
            .invoke(request_code::UPDATE_AND_CREATE_TOPIC, Some(header), None)
            .await?
            .into_result()?;
        Ok(())
    }

    /// Send a heartbeat to every known broker, opening sessions as needed.
    /// Returns how many brokers acknowledged it.
    pub async fn heartbeat(&self, body: Bytes) -> usize {
        let mut acknowledged = 0;
        for broker in self.brokers() {
            let result = match self.require_broker(&broker.name).await {
                Ok(session) => session
                    .invoke(request_code::HEART_BEAT, None, Some(body.clone()))
                    .await
                    .and_then(|response| response.into_result()),
                Err(e) => Err(e),
            };

            match result {
                Ok(_) => acknowledged += 1,
                Err(e) => warn!(
                    "[{}] Heartbeat to broker {} failed: {}",
                    self.config.group, broker.name, e
                ),
            }
        }
        debug!(
            "[{}] Heartbeat acknowledged by {} broker(s)",
            self.config.group, acknowledged
        );
        acknowledged
    }

    /// Close every open session. Later session requests fail with
    /// [`RelaymqClientError::Closed`].
    pub async fn close(&self) -> Result<()> {
        self.active.store(false, Ordering::Release);

        let sessions = self.sessions.drain().await;
        let total = sessions.len();
        let mut errors = Vec::new();

        for session in sessions {
            if let Err(e) = session.close().await {
                self.metrics.record_dispose_failure();
                warn!(
                    "[{}] Failed to close session {}: {}",
                    self.config.group,
                    session.name(),
                    e
                );
                errors.push(format!("{}: {}", session.name(), e));
            }
        }

        RelaymqClientError::from_dispose_failures(total, errors)
    }
}

impl std::fmt::Debug for ClientBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBase")
            .field("group", &self.config.group)
            .field("topic", &self.config.topic)
            .field("active", &self.is_active())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
