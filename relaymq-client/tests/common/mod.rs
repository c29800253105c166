#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use relaymq_client::error::ResponseCode;
use relaymq_client::protocol::{request_code, RemotingCommand};
use relaymq_client::{
    BrokerInfo, Channel, ClientContext, MessageExt, ReceiveHook, RelaymqClientError, Result,
    RouteSource, Transport,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A command as a broker received it
#[derive(Debug, Clone)]
pub struct Received {
    pub broker: String,
    pub code: i32,
    pub fields: HashMap<String, String>,
}

#[derive(Default)]
pub struct ClusterState {
    pub received: Mutex<Vec<Received>>,
    pub route_lookups: AtomicUsize,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub next_offset: AtomicU64,
    /// Brokers that reject topic creation
    pub failing_admin: Mutex<HashSet<String>>,
    /// Brokers whose connect fails
    pub unreachable: Mutex<HashSet<String>>,
    /// Topics without a route
    pub missing_routes: Mutex<HashSet<String>>,
    /// 1-based connect ordinal whose channel fails to close
    pub fail_close_on: Mutex<Option<usize>>,
    pub connect_delay: Mutex<Duration>,
    /// Delivered by the first pull that reaches the cluster
    pub backlog: Mutex<Vec<MessageExt>>,
    /// Receive hook handed over by each connect, with the broker name
    pub hooks: Mutex<Vec<(String, ReceiveHook)>>,
}

/// In-memory brokers and name server
#[derive(Clone)]
pub struct MockCluster {
    brokers: Vec<BrokerInfo>,
    pub state: Arc<ClusterState>,
}

impl MockCluster {
    pub fn new(broker_names: &[&str]) -> Self {
        let brokers = broker_names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                BrokerInfo::new(*name, [format!("10.0.0.{}:10911", i + 1)]).with_queues(4, 4)
            })
            .collect();
        Self {
            brokers,
            state: Arc::new(ClusterState::default()),
        }
    }

    pub fn context(&self) -> ClientContext {
        ClientContext::new(Arc::new(self.clone()), Arc::new(self.clone()))
    }

    pub fn fail_admin_on(&self, broker: &str) {
        self.state.failing_admin.lock().insert(broker.to_string());
    }

    pub fn make_unreachable(&self, broker: &str) {
        self.state.unreachable.lock().insert(broker.to_string());
    }

    pub fn fail_close_on(&self, ordinal: usize) {
        *self.state.fail_close_on.lock() = Some(ordinal);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn route_lookups(&self) -> usize {
        self.state.route_lookups.load(Ordering::SeqCst)
    }

    /// Hooks wired to connections opened to `broker`
    pub fn hooks_for(&self, broker: &str) -> Vec<ReceiveHook> {
        self.state
            .hooks
            .lock()
            .iter()
            .filter(|(name, _)| name == broker)
            .map(|(_, hook)| hook.clone())
            .collect()
    }

    pub fn received(&self, code: i32) -> Vec<Received> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|r| r.code == code)
            .cloned()
            .collect()
    }

    /// Brokers that received a create-topic command for `topic`
    pub fn provisioned(&self, topic: &str) -> Vec<Received> {
        self.received(request_code::UPDATE_AND_CREATE_TOPIC)
            .into_iter()
            .filter(|r| r.fields.get("topic").map(String::as_str) == Some(topic))
            .collect()
    }
}

#[async_trait]
impl RouteSource for MockCluster {
    async fn route_info(&self, topic: &str) -> Result<Vec<BrokerInfo>> {
        self.state.route_lookups.fetch_add(1, Ordering::SeqCst);
        if self.state.missing_routes.lock().contains(topic) {
            return Err(RelaymqClientError::RouteNotFound {
                topic: topic.to_string(),
            });
        }
        Ok(self.brokers.clone())
    }
}

#[async_trait]
impl Transport for MockCluster {
    async fn connect(
        &self,
        name: &str,
        _addresses: &[String],
        on_received: ReceiveHook,
    ) -> Result<Arc<dyn Channel>> {
        let ordinal = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.hooks.lock().push((name.to_string(), on_received));
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.unreachable.lock().contains(name) {
            return Err(RelaymqClientError::connection(format!(
                "{} is unreachable",
                name
            )));
        }
        Ok(Arc::new(MockChannel {
            broker: name.to_string(),
            ordinal,
            state: self.state.clone(),
        }))
    }
}

struct MockChannel {
    broker: String,
    ordinal: usize,
    state: Arc<ClusterState>,
}

impl MockChannel {
    fn success() -> RemotingCommand {
        RemotingCommand::response(ResponseCode::Success, None)
    }

    fn pull(&self, request: &RemotingCommand) -> Result<RemotingCommand> {
        let messages = std::mem::take(&mut *self.state.backlog.lock());
        if messages.is_empty() {
            return Ok(RemotingCommand::response(ResponseCode::PullNotFound, None));
        }
        let offset: u64 = request.parse_ext_field("queueOffset")?;
        let next = offset + messages.len() as u64;
        Ok(Self::success()
            .with_ext_field("nextBeginOffset", next)
            .with_body(serde_json::to_vec(&messages)?))
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn invoke(&self, request: RemotingCommand, _timeout: Duration) -> Result<RemotingCommand> {
        self.state.received.lock().push(Received {
            broker: self.broker.clone(),
            code: request.code,
            fields: request.ext_fields.clone(),
        });

        match request.code {
            request_code::UPDATE_AND_CREATE_TOPIC => {
                if self.state.failing_admin.lock().contains(&self.broker) {
                    Ok(RemotingCommand::response(
                        ResponseCode::SystemError,
                        Some("create topic rejected".to_string()),
                    ))
                } else {
                    Ok(Self::success())
                }
            }
            request_code::SEND_MESSAGE => {
                let offset = self.state.next_offset.fetch_add(1, Ordering::SeqCst);
                Ok(Self::success()
                    .with_ext_field("msgId", format!("{}-{}", self.broker, offset))
                    .with_ext_field("queueId", request.ext_field("queueId").unwrap_or("0"))
                    .with_ext_field("queueOffset", offset))
            }
            request_code::PULL_MESSAGE => self.pull(&request),
            request_code::QUERY_CONSUMER_OFFSET | request_code::GET_MAX_OFFSET => {
                Ok(Self::success().with_ext_field("offset", 0))
            }
            _ => Ok(Self::success()),
        }
    }

    async fn close(&self) -> Result<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        if *self.state.fail_close_on.lock() == Some(self.ordinal) {
            return Err(RelaymqClientError::connection(format!(
                "{} refused to close",
                self.broker
            )));
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
