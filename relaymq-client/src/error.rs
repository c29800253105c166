//! Error types for the RelayMQ client library

/// Main error type for RelayMQ client operations
#[derive(Debug, thiserror::Error)]
pub enum RelaymqClientError {
    /// A required identifier was missing or blank
    #[error("Invalid argument: {name} must not be empty")]
    InvalidArgument { name: &'static str },

    /// Connection-related errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Protocol-related errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// JSON header or payload errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Message exceeds the configured size limit
    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    /// The broker answered with a non-success response code
    #[error("Broker returned code {code}: {remark}")]
    Broker { code: i32, remark: String },

    /// No broker with this name in the route list
    #[error("Broker '{name}' is not known for this client")]
    BrokerNotFound { name: String },

    /// The name server has no route for the topic
    #[error("No route found for topic '{topic}'")]
    RouteNotFound { topic: String },

    /// The client has not been started yet
    #[error("Client is not started")]
    NotStarted,

    /// The owning client, factory or container has been closed
    #[error("Client is closed")]
    Closed,

    /// One or more members failed while being disposed
    #[error("{failed} of {total} members failed to close: {}", .errors.join("; "))]
    Dispose {
        failed: usize,
        total: usize,
        errors: Vec<String>,
    },
}

impl RelaymqClientError {
    /// Create a new invalid argument error
    pub fn invalid_argument(name: &'static str) -> Self {
        Self::InvalidArgument { name }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a broker error from a response code and remark
    pub fn broker<S: Into<String>>(code: i32, remark: S) -> Self {
        Self::Broker {
            code,
            remark: remark.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Collapse per-member close failures into a single error, if any
    pub fn from_dispose_failures(total: usize, errors: Vec<String>) -> Result<(), Self> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::Dispose {
                failed: errors.len(),
                total,
                errors,
            })
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Io(_) => true,
            Self::Broker { code, .. } => ResponseCode::from(*code) == ResponseCode::SystemBusy,
            _ => false,
        }
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Response codes carried in remoting command headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success = 0,
    SystemError = 1,
    SystemBusy = 2,
    RequestCodeNotSupported = 3,
    FlushDiskTimeout = 10,
    SlaveNotAvailable = 11,
    FlushSlaveTimeout = 12,
    TopicNotExist = 17,
    PullNotFound = 19,
    PullRetryImmediately = 20,
    PullOffsetMoved = 21,
    QueryNotFound = 22,
    Unknown = -1,
}

impl ResponseCode {
    pub fn is_success(self) -> bool {
        self == ResponseCode::Success
    }
}

impl From<i32> for ResponseCode {
    fn from(code: i32) -> Self {
        match code {
            0 => ResponseCode::Success,
            1 => ResponseCode::SystemError,
            2 => ResponseCode::SystemBusy,
            3 => ResponseCode::RequestCodeNotSupported,
            10 => ResponseCode::FlushDiskTimeout,
            11 => ResponseCode::SlaveNotAvailable,
            12 => ResponseCode::FlushSlaveTimeout,
            17 => ResponseCode::TopicNotExist,
            19 => ResponseCode::PullNotFound,
            20 => ResponseCode::PullRetryImmediately,
            21 => ResponseCode::PullOffsetMoved,
            22 => ResponseCode::QueryNotFound,
            _ => ResponseCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispose_failures_collapse() {
        assert!(RelaymqClientError::from_dispose_failures(3, Vec::new()).is_ok());

        let err = RelaymqClientError::from_dispose_failures(3, vec!["c2: boom".to_string()])
            .unwrap_err();
        match err {
            RelaymqClientError::Dispose { failed, total, .. } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_retryable() {
        assert!(RelaymqClientError::connection("reset").is_retryable());
        assert!(RelaymqClientError::broker(2, "busy").is_retryable());
        assert!(!RelaymqClientError::broker(17, "no topic").is_retryable());
        assert!(!RelaymqClientError::invalid_argument("topic").is_retryable());
    }

    #[test]
    fn test_response_code_mapping() {
        assert!(ResponseCode::from(0).is_success());
        assert_eq!(ResponseCode::from(19), ResponseCode::PullNotFound);
        assert_eq!(ResponseCode::from(999), ResponseCode::Unknown);
    }
}
