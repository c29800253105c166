//! Configuration types for RelayMQ client

use crate::error::RelaymqClientError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Topic every broker auto-creates; clients without a topic route through it
pub const DEFAULT_TOPIC: &str = "TBW102";
pub const DEFAULT_PRODUCER_GROUP: &str = "DEFAULT_PRODUCER";
pub const DEFAULT_CONSUMER_GROUP: &str = "DEFAULT_CONSUMER";
/// Queue count used when provisioning topics through a factory
pub const DEFAULT_TOPIC_QUEUE_NUM: u32 = 4;

pub(crate) fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Who this client is, as reported to brokers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_ip: String,
    pub instance_name: String,
    pub unit_name: Option<String>,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            client_ip: local_ip(),
            instance_name: std::process::id().to_string(),
            unit_name: None,
        }
    }
}

impl ClientIdentity {
    /// `ip@instance`, with `@unit` appended when a unit name is set
    pub fn client_id(&self) -> String {
        let mut id = format!("{}@{}", self.client_ip, self.instance_name);
        if let Some(unit) = self.unit_name.as_deref().filter(|u| !u.is_empty()) {
            id.push('@');
            id.push_str(unit);
        }
        id
    }
}

fn local_ip() -> String {
    // Connecting a UDP socket only selects a route; nothing is sent
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Settings shared by producers and consumers
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name server address list, separated by `;`
    pub name_server_address: String,
    /// Producer or consumer group
    pub group: String,
    /// Topic whose route determines the broker set of this client
    pub topic: String,
    /// Client identity
    pub identity: ClientIdentity,
    pub unit_mode: bool,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name_server_address: String::new(),
            group: DEFAULT_PRODUCER_GROUP.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            identity: ClientIdentity::default(),
            unit_mode: false,
            connection_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(3),
        }
    }
}

impl ClientConfig {
    pub fn client_id(&self) -> String {
        self.identity.client_id()
    }

    /// Individual name server addresses, in configured order
    pub fn name_server_addresses(&self) -> Vec<String> {
        self.name_server_address
            .split(';')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(String::from)
            .collect()
    }

    /// Reject blank identifiers before any resource is allocated
    pub fn validate(&self) -> Result<(), RelaymqClientError> {
        if is_blank(&self.name_server_address) {
            return Err(RelaymqClientError::invalid_argument("name_server_address"));
        }
        if is_blank(&self.group) {
            return Err(RelaymqClientError::invalid_argument("group"));
        }
        if is_blank(&self.topic) {
            return Err(RelaymqClientError::invalid_argument("topic"));
        }
        Ok(())
    }

    /// Overlay the non-empty fields of a settings object
    pub fn apply_setting(&mut self, setting: &MqSetting) {
        if !is_blank(&setting.name_server) {
            self.name_server_address = setting.name_server.clone();
        }
        if let Some(topic) = setting.topic.as_ref().filter(|t| !is_blank(t)) {
            self.topic = topic.clone();
        }
        if let Some(group) = setting.group.as_ref().filter(|g| !is_blank(g)) {
            self.group = group.clone();
        }
    }
}

/// Externally supplied connection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqSetting {
    pub name_server: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

/// Producer-specific configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Base client configuration
    pub client_config: ClientConfig,
    /// Queue count asked for when a broker auto-creates a topic on send
    pub default_topic_queue_nums: u32,
    /// Maximum message size
    pub max_message_size: usize,
    /// Send timeout
    pub send_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_config: ClientConfig::default(),
            default_topic_queue_nums: DEFAULT_TOPIC_QUEUE_NUM,
            max_message_size: 4 * 1024 * 1024, // 4MB
            send_timeout: Duration::from_secs(3),
        }
    }
}

/// Topic plus tag filter a consumer subscribes with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    /// Empty means all tags
    pub tags: Vec<String>,
}

impl Subscription {
    pub fn new<T, I, S>(topic: T, tags: I) -> Self
    where
        T: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topic: topic.into(),
            tags: tags
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !is_blank(t))
                .collect(),
        }
    }

    /// Wire filter expression: `*` or `a || b`
    pub fn expression(&self) -> String {
        if self.tags.is_empty() {
            "*".to_string()
        } else {
            self.tags.join(" || ")
        }
    }

    pub fn matches(&self, tag: Option<&str>) -> bool {
        self.tags.is_empty() || tag.map_or(false, |t| self.tags.iter().any(|s| s == t))
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Base client configuration
    pub client_config: ClientConfig,
    pub subscription: Option<Subscription>,
    /// Start from the last committed offset rather than the queue head
    pub from_last_offset: bool,
    /// Jump to the queue tail when the stored backlog exceeds this; 0 never skips
    pub skip_over_stored_msg_count: u64,
    /// Maximum messages per pull
    pub batch_size: u32,
    /// Delay between pull passes over all queues
    pub pull_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client_config: ClientConfig {
                group: DEFAULT_CONSUMER_GROUP.to_string(),
                ..ClientConfig::default()
            },
            subscription: None,
            from_last_offset: false,
            skip_over_stored_msg_count: 10_000,
            batch_size: 32,
            pull_interval: Duration::from_secs(1),
        }
    }
}

/// Boundary configuration of a producer factory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerFactoryConfig {
    pub name_server_address: String,
    #[serde(default)]
    pub topic_queue_num: u32,
}

impl ProducerFactoryConfig {
    pub fn new<S: Into<String>>(name_server_address: S) -> Self {
        Self {
            name_server_address: name_server_address.into(),
            topic_queue_num: DEFAULT_TOPIC_QUEUE_NUM,
        }
    }

    /// Queue count for provisioned topics; values below 1 fall back to the default
    pub fn effective_queue_num(&self) -> u32 {
        if self.topic_queue_num < 1 {
            DEFAULT_TOPIC_QUEUE_NUM
        } else {
            self.topic_queue_num
        }
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name_server_address<S: Into<String>>(mut self, address: S) -> Self {
        self.config.name_server_address = address.into();
        self
    }

    pub fn group<S: Into<String>>(mut self, group: S) -> Self {
        self.config.group = group.into();
        self
    }

    pub fn topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn instance_name<S: Into<String>>(mut self, instance_name: S) -> Self {
        self.config.identity.instance_name = instance_name.into();
        self
    }

    pub fn unit_name<S: Into<String>>(mut self, unit_name: S) -> Self {
        self.config.identity.unit_name = Some(unit_name.into());
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Builder for ProducerConfig
#[derive(Debug, Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_config(mut self, client_config: ClientConfig) -> Self {
        self.config.client_config = client_config;
        self
    }

    pub fn name_server_address<S: Into<String>>(mut self, address: S) -> Self {
        self.config.client_config.name_server_address = address.into();
        self
    }

    pub fn topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.config.client_config.topic = topic.into();
        self
    }

    pub fn group<S: Into<String>>(mut self, group: S) -> Self {
        self.config.client_config.group = group.into();
        self
    }

    pub fn default_topic_queue_nums(mut self, queue_nums: u32) -> Self {
        self.config.default_topic_queue_nums = queue_nums;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    pub fn build(self) -> ProducerConfig {
        self.config
    }
}

/// Builder for ConsumerConfig
#[derive(Debug, Default)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_config(mut self, client_config: ClientConfig) -> Self {
        self.config.client_config = client_config;
        self
    }

    pub fn name_server_address<S: Into<String>>(mut self, address: S) -> Self {
        self.config.client_config.name_server_address = address.into();
        self
    }

    pub fn group<S: Into<String>>(mut self, group: S) -> Self {
        self.config.client_config.group = group.into();
        self
    }

    /// Subscribe to `topic`; the subscribed topic also drives route discovery
    pub fn subscribe<T, I, S>(mut self, topic: T, tags: I) -> Self
    where
        T: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subscription = Subscription::new(topic, tags);
        self.config.client_config.topic = subscription.topic.clone();
        self.config.subscription = Some(subscription);
        self
    }

    pub fn from_last_offset(mut self, from_last_offset: bool) -> Self {
        self.config.from_last_offset = from_last_offset;
        self
    }

    pub fn skip_over_stored_msg_count(mut self, count: u64) -> Self {
        self.config.skip_over_stored_msg_count = count;
        self
    }

    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn pull_interval(mut self, interval: Duration) -> Self {
        self.config.pull_interval = interval;
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id() {
        let mut identity = ClientIdentity {
            client_ip: "10.0.0.8".to_string(),
            instance_name: "4242".to_string(),
            unit_name: None,
        };
        assert_eq!(identity.client_id(), "10.0.0.8@4242");

        identity.unit_name = Some(String::new());
        assert_eq!(identity.client_id(), "10.0.0.8@4242");

        identity.unit_name = Some("unit-a".to_string());
        assert_eq!(identity.client_id(), "10.0.0.8@4242@unit-a");
    }

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfigBuilder::new()
            .name_server_address("ns1:9876; ns2:9876;")
            .group("orders-producer")
            .connection_timeout(Duration::from_secs(10))
            .build();

        assert_eq!(config.name_server_addresses(), vec!["ns1:9876", "ns2:9876"]);
        assert_eq!(config.group, "orders-producer");
        assert_eq!(config.topic, DEFAULT_TOPIC);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_blank_name_server() {
        let config = ClientConfigBuilder::new().name_server_address("  ").build();
        match config.validate() {
            Err(RelaymqClientError::InvalidArgument { name }) => {
                assert_eq!(name, "name_server_address")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_apply_setting() {
        let setting: MqSetting = serde_json::from_str(
            r#"{"nameServer":"10.1.1.1:9876","topic":"orders","group":""}"#,
        )
        .unwrap();

        let mut config = ClientConfig::default();
        config.apply_setting(&setting);
        assert_eq!(config.name_server_address, "10.1.1.1:9876");
        assert_eq!(config.topic, "orders");
        assert_eq!(config.group, DEFAULT_PRODUCER_GROUP);
    }

    #[test]
    fn test_subscription_expression() {
        let all = Subscription::new("orders", Vec::<String>::new());
        assert_eq!(all.expression(), "*");
        assert!(all.matches(None));

        let some = Subscription::new("orders", ["create", "", "refund"]);
        assert_eq!(some.expression(), "create || refund");
        assert!(some.matches(Some("refund")));
        assert!(!some.matches(Some("commit")));
        assert!(!some.matches(None));
    }

    #[test]
    fn test_consumer_config_builder() {
        let config = ConsumerConfigBuilder::new()
            .name_server_address("localhost:9876")
            .group("analytics")
            .subscribe("orders", ["create"])
            .batch_size(64)
            .build();

        assert_eq!(config.client_config.topic, "orders");
        assert_eq!(config.client_config.group, "analytics");
        assert_eq!(config.batch_size, 64);
        assert!(!config.from_last_offset);
    }

    #[test]
    fn test_producer_config_builder() {
        let config = ProducerConfigBuilder::new()
            .name_server_address("ns:9876")
            .topic("orders")
            .max_message_size(1024)
            .send_timeout(Duration::from_millis(500))
            .build();

        assert_eq!(config.client_config.topic, "orders");
        assert_eq!(config.client_config.group, DEFAULT_PRODUCER_GROUP);
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.send_timeout, Duration::from_millis(500));
        assert_eq!(config.default_topic_queue_nums, DEFAULT_TOPIC_QUEUE_NUM);
    }

    #[test]
    fn test_factory_queue_num_default() {
        let config: ProducerFactoryConfig =
            serde_json::from_str(r#"{"nameServerAddress":"ns:9876"}"#).unwrap();
        assert_eq!(config.topic_queue_num, 0);
        assert_eq!(config.effective_queue_num(), DEFAULT_TOPIC_QUEUE_NUM);
        assert_eq!(ProducerFactoryConfig::new("ns:9876").effective_queue_num(), 4);
    }
}
