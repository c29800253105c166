//! Protocol types and utilities for RelayMQ client communication
//!
//! Every exchange with a name server or broker is a [`RemotingCommand`]:
//! a JSON header (code, opaque id, flag, ext fields) followed by an opaque
//! body, framed as `[total len][header len][header][body]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::{RelaymqClientError, ResponseCode};

pub type QueueId = u32;
pub type Offset = u64;

/// Request codes understood by name servers and brokers
pub mod request_code {
    pub const SEND_MESSAGE: i32 = 10;
    pub const PULL_MESSAGE: i32 = 11;
    pub const QUERY_CONSUMER_OFFSET: i32 = 14;
    pub const UPDATE_CONSUMER_OFFSET: i32 = 15;
    pub const UPDATE_AND_CREATE_TOPIC: i32 = 17;
    pub const GET_MAX_OFFSET: i32 = 30;
    pub const HEART_BEAT: i32 = 34;
    pub const NOTIFY_CONSUMER_IDS_CHANGED: i32 = 40;
    pub const GET_ROUTEINFO_BY_TOPIC: i32 = 105;
}

/// Permission bits carried in route data
pub mod perm {
    pub const WRITE: u32 = 2;
    pub const READ: u32 = 4;
    pub const READ_WRITE: u32 = READ | WRITE;
}

const RESPONSE_FLAG: i32 = 0b01;
const ONEWAY_FLAG: i32 = 0b10;
const LANGUAGE: &str = "RUST";
const PROTOCOL_VERSION: i32 = 1;

fn default_language() -> String {
    LANGUAGE.to_string()
}

/// A single request or response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotingCommand {
    pub code: i32,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub opaque: i32,
    #[serde(default)]
    pub flag: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ext_fields: HashMap<String, String>,
    #[serde(skip)]
    pub body: Bytes,
}

impl RemotingCommand {
    /// Create a request with the given code; the opaque id is assigned by the channel
    pub fn request(code: i32) -> Self {
        Self {
            code,
            language: default_language(),
            version: PROTOCOL_VERSION,
            opaque: 0,
            flag: 0,
            remark: None,
            ext_fields: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// Create a response frame
    pub fn response(code: ResponseCode, remark: Option<String>) -> Self {
        let mut cmd = Self::request(code as i32);
        cmd.remark = remark;
        cmd.mark_response();
        cmd
    }

    pub fn with_ext_fields(mut self, fields: HashMap<String, String>) -> Self {
        self.ext_fields = fields;
        self
    }

    pub fn with_ext_field<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.ext_fields.insert(key.into(), value.to_string());
        self
    }

    pub fn with_body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_response(&self) -> bool {
        self.flag & RESPONSE_FLAG != 0
    }

    pub fn is_oneway(&self) -> bool {
        self.flag & ONEWAY_FLAG != 0
    }

    pub fn mark_response(&mut self) {
        self.flag |= RESPONSE_FLAG;
    }

    pub fn response_code(&self) -> ResponseCode {
        ResponseCode::from(self.code)
    }

    pub fn ext_field(&self, key: &str) -> Option<&str> {
        self.ext_fields.get(key).map(String::as_str)
    }

    /// Parse a required ext field
    pub fn parse_ext_field<T: FromStr>(&self, key: &str) -> Result<T, RelaymqClientError> {
        let raw = self.ext_field(key).ok_or_else(|| {
            RelaymqClientError::protocol(format!("Missing header field '{}'", key))
        })?;
        raw.parse().map_err(|_| {
            RelaymqClientError::protocol(format!("Invalid header field '{}': {}", key, raw))
        })
    }

    /// Turn a non-success response into a broker error
    pub fn into_result(self) -> Result<Self, RelaymqClientError> {
        if self.response_code().is_success() {
            Ok(self)
        } else {
            Err(RelaymqClientError::broker(
                self.code,
                self.remark.unwrap_or_default(),
            ))
        }
    }
}

/// Length-delimited codec for [`RemotingCommand`] frames
#[derive(Debug, Clone)]
pub struct RemotingCodec {
    max_frame_len: usize,
}

impl RemotingCodec {
    pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            max_frame_len: Self::DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for RemotingCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl tokio_util::codec::Encoder<RemotingCommand> for RemotingCodec {
    type Error = RelaymqClientError;

    fn encode(&mut self, item: RemotingCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = serde_json::to_vec(&item)?;
        if header.len() > 0x00FF_FFFF {
            return Err(RelaymqClientError::protocol("Header too large"));
        }

        let total_len = 4 + header.len() + item.body.len();
        if total_len > self.max_frame_len {
            return Err(RelaymqClientError::protocol(format!(
                "Frame of {} bytes exceeds maximum {}",
                total_len, self.max_frame_len
            )));
        }

        dst.reserve(4 + total_len);
        dst.put_u32(total_len as u32);
        // High byte is the serialize type, 0 = JSON
        dst.put_u32(header.len() as u32);
        dst.put_slice(&header);
        dst.put_slice(&item.body);
        Ok(())
    }
}

impl tokio_util::codec::Decoder for RemotingCodec {
    type Item = RemotingCommand;
    type Error = RelaymqClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let total_len = (&src[0..4]).get_u32() as usize;
        if total_len > self.max_frame_len {
            return Err(RelaymqClientError::protocol(format!(
                "Frame of {} bytes exceeds maximum {}",
                total_len, self.max_frame_len
            )));
        }
        if total_len < 4 {
            return Err(RelaymqClientError::protocol("Frame too short"));
        }
        if src.len() < 4 + total_len {
            src.reserve(4 + total_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(total_len);
        let header_word = frame.get_u32();
        let serialize_type = header_word >> 24;
        let header_len = (header_word & 0x00FF_FFFF) as usize;

        if serialize_type != 0 {
            return Err(RelaymqClientError::protocol(format!(
                "Unsupported serialize type {}",
                serialize_type
            )));
        }
        if header_len > frame.len() {
            return Err(RelaymqClientError::protocol("Header length exceeds frame"));
        }

        let header = frame.split_to(header_len);
        let mut command: RemotingCommand = serde_json::from_slice(&header)?;
        command.body = frame.freeze();
        Ok(Some(command))
    }
}

/// A broker serving a topic, as reported by the route source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub name: String,
    pub addresses: Vec<String>,
    pub read_queue_nums: u32,
    pub write_queue_nums: u32,
    pub perm: u32,
}

impl BrokerInfo {
    pub fn new<N, I, S>(name: N, addresses: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            addresses: addresses.into_iter().map(Into::into).collect(),
            read_queue_nums: 0,
            write_queue_nums: 0,
            perm: perm::READ_WRITE,
        }
    }

    pub fn with_queues(mut self, read_queue_nums: u32, write_queue_nums: u32) -> Self {
        self.read_queue_nums = read_queue_nums;
        self.write_queue_nums = write_queue_nums;
        self
    }

    pub fn is_writable(&self) -> bool {
        self.perm & perm::WRITE != 0
    }

    pub fn is_readable(&self) -> bool {
        self.perm & perm::READ != 0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrokerData {
    broker_name: String,
    #[serde(default)]
    broker_addrs: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueData {
    broker_name: String,
    #[serde(default)]
    read_queue_nums: u32,
    #[serde(default)]
    write_queue_nums: u32,
    #[serde(default)]
    perm: u32,
}

/// Route payload returned by the name server for one topic
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRouteData {
    #[serde(default)]
    broker_datas: Vec<BrokerData>,
    #[serde(default)]
    queue_datas: Vec<QueueData>,
}

impl TopicRouteData {
    /// Parse a route payload, tolerating bare integer object keys
    pub fn decode(body: &[u8]) -> Result<Self, RelaymqClientError> {
        let raw = std::str::from_utf8(body)
            .map_err(|_| RelaymqClientError::protocol("Route payload is not UTF-8"))?;
        Ok(serde_json::from_str(&quote_numeric_keys(raw))?)
    }

    /// Flatten into one [`BrokerInfo`] per broker, master address first
    pub fn into_brokers(self) -> Vec<BrokerInfo> {
        let queues: HashMap<String, QueueData> = self
            .queue_datas
            .into_iter()
            .map(|q| (q.broker_name.clone(), q))
            .collect();

        self.broker_datas
            .into_iter()
            .map(|data| {
                let ordered: BTreeMap<u64, String> = data
                    .broker_addrs
                    .into_iter()
                    .filter_map(|(id, addr)| id.parse::<u64>().ok().map(|id| (id, addr)))
                    .collect();

                let mut info = BrokerInfo::new(data.broker_name, ordered.into_values());
                if let Some(queue) = queues.get(&info.name) {
                    info.read_queue_nums = queue.read_queue_nums;
                    info.write_queue_nums = queue.write_queue_nums;
                    info.perm = queue.perm;
                }
                info
            })
            .collect()
    }
}

/// Quote object keys that were emitted as bare numbers (`{0:"a"}` → `{"0":"a"}`)
fn quote_numeric_keys(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    let mut chars = raw.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
        } else if c.is_ascii_digit() || c == '-' {
            let mut token = String::from(c);
            while let Some(&next) = chars.peek() {
                if next.is_ascii_digit() || matches!(next, '.' | 'e' | 'E' | '+' | '-') {
                    token.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            let mut spacing = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_whitespace() {
                    spacing.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if chars.peek() == Some(&':') {
                out.push('"');
                out.push_str(&token);
                out.push('"');
            } else {
                out.push_str(&token);
            }
            out.push_str(&spacing);
        } else {
            out.push(c);
        }
    }

    out
}

/// One queue of a topic, hosted by exactly one broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageQueue {
    pub topic: String,
    pub broker_name: String,
    pub queue_id: QueueId,
}

impl MessageQueue {
    pub fn new<T: Into<String>, B: Into<String>>(topic: T, broker_name: B, queue_id: QueueId) -> Self {
        Self {
            topic: topic.into(),
            broker_name: broker_name.into(),
            queue_id,
        }
    }
}

impl fmt::Display for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.broker_name, self.queue_id)
    }
}

const NAME_VALUE_SEPARATOR: char = '\u{1}';
const PROPERTY_SEPARATOR: char = '\u{2}';

pub const PROPERTY_TAGS: &str = "TAGS";
pub const PROPERTY_KEYS: &str = "KEYS";
pub const PROPERTY_DELAY_TIME_LEVEL: &str = "DELAY";
pub const PROPERTY_WAIT_STORE_MSG_OK: &str = "WAIT";

/// Outgoing message
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub body: Bytes,
    pub tags: Option<String>,
    pub keys: Option<String>,
    pub delay_time_level: u32,
    pub properties: HashMap<String, String>,
}

impl Message {
    pub fn new<B: Into<Bytes>>(body: B) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<S: Into<String>>(mut self, tags: S) -> Self {
        self.tags = Some(tags.into());
        self
    }

    pub fn with_keys<S: Into<String>>(mut self, keys: S) -> Self {
        self.keys = Some(keys.into());
        self
    }

    pub fn with_delay_time_level(mut self, level: u32) -> Self {
        self.delay_time_level = level;
        self
    }

    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Encode tags, keys, delay level and user properties into the wire string
    pub fn encode_properties(&self) -> String {
        let mut all: BTreeMap<&str, String> = self
            .properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();

        if let Some(tags) = &self.tags {
            all.insert(PROPERTY_TAGS, tags.clone());
        }
        if let Some(keys) = &self.keys {
            all.insert(PROPERTY_KEYS, keys.clone());
        }
        if self.delay_time_level > 0 {
            all.insert(PROPERTY_DELAY_TIME_LEVEL, self.delay_time_level.to_string());
        }
        all.entry(PROPERTY_WAIT_STORE_MSG_OK)
            .or_insert_with(|| "true".to_string());

        let mut out = String::new();
        for (key, value) in all {
            out.push_str(key);
            out.push(NAME_VALUE_SEPARATOR);
            out.push_str(&value);
            out.push(PROPERTY_SEPARATOR);
        }
        out
    }
}

/// A message delivered to a consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageExt {
    pub topic: String,
    pub queue_id: QueueId,
    pub queue_offset: Offset,
    pub msg_id: String,
    pub body: Bytes,
    pub tags: Option<String>,
    pub keys: Option<String>,
    pub born_timestamp: u64,
    pub reconsume_times: u32,
    pub properties: HashMap<String, String>,
}

/// Broker-side outcome of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    SendOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
}

/// Result of [`Producer::publish`](crate::Producer::publish)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub status: SendStatus,
    pub msg_id: String,
    pub queue: MessageQueue,
    pub queue_offset: Offset,
}

impl SendResult {
    pub fn from_response(
        response: RemotingCommand,
        mut queue: MessageQueue,
    ) -> Result<Self, RelaymqClientError> {
        let status = match response.response_code() {
            ResponseCode::Success => SendStatus::SendOk,
            ResponseCode::FlushDiskTimeout => SendStatus::FlushDiskTimeout,
            ResponseCode::FlushSlaveTimeout => SendStatus::FlushSlaveTimeout,
            ResponseCode::SlaveNotAvailable => SendStatus::SlaveNotAvailable,
            _ => {
                return Err(RelaymqClientError::broker(
                    response.code,
                    response.remark.unwrap_or_default(),
                ))
            }
        };

        if let Ok(queue_id) = response.parse_ext_field::<QueueId>("queueId") {
            queue.queue_id = queue_id;
        }

        Ok(Self {
            status,
            msg_id: response.ext_field("msgId").unwrap_or_default().to_string(),
            queue_offset: response.parse_ext_field("queueOffset").unwrap_or(0),
            queue,
        })
    }
}
