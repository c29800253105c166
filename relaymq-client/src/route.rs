//! Route discovery: which brokers serve a topic

use crate::error::{RelaymqClientError, ResponseCode};
use crate::protocol::{request_code, BrokerInfo, RemotingCommand, TopicRouteData};
use crate::transport::{ignore_inbound, Channel, Transport};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Maps a topic to the brokers currently serving it
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// Get the brokers serving `topic`
    async fn route_info(&self, topic: &str) -> Result<Vec<BrokerInfo>>;

    /// Release any connection held by the source
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Route source backed by a name server
pub struct NameServerClient {
    addresses: Vec<String>,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    channel: Mutex<Option<Arc<dyn Channel>>>,
}

impl NameServerClient {
    /// Create a new name server client; the first lookup connects
    pub fn new(
        addresses: Vec<String>,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            addresses,
            transport,
            request_timeout,
            channel: Mutex::new(None),
        }
    }

    async fn channel(&self) -> Result<Arc<dyn Channel>> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref().filter(|c| c.is_healthy()) {
            return Ok(channel.clone());
        }

        let channel = self
            .transport
            .connect("name-server", &self.addresses, ignore_inbound())
            .await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl RouteSource for NameServerClient {
    async fn route_info(&self, topic: &str) -> Result<Vec<BrokerInfo>> {
        let channel = self.channel().await?;
        let request =
            RemotingCommand::request(request_code::GET_ROUTEINFO_BY_TOPIC).with_ext_field("topic", topic);

        let response = channel.invoke(request, self.request_timeout).await?;
        if response.response_code() == ResponseCode::TopicNotExist {
            return Err(RelaymqClientError::RouteNotFound {
                topic: topic.to_string(),
            });
        }
        let response = response.into_result()?;

        let brokers = TopicRouteData::decode(&response.body)?.into_brokers();
        debug!("Route for {}: {} broker(s)", topic, brokers.len());
        Ok(brokers)
    }

    async fn close(&self) -> Result<()> {
        let channel = self.channel.lock().await.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("Failed to close name server connection: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }
}
