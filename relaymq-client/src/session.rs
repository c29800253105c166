//! Session with a single broker

use crate::error::RelaymqClientError;
use crate::protocol::{BrokerInfo, RemotingCommand};
use crate::transport::{Channel, ReceiveHook, Transport};
use crate::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

/// Lifecycle of a [`BrokerSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Started = 1,
    Disposed = 2,
}

impl From<u8> for SessionState {
    fn from(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Started,
            _ => SessionState::Disposed,
        }
    }
}

/// A started connection to one named broker, shared by every caller of the
/// owning client
pub struct BrokerSession {
    name: String,
    addresses: Vec<String>,
    request_timeout: Duration,
    state: AtomicU8,
    channel: OnceLock<Arc<dyn Channel>>,
}

impl BrokerSession {
    /// Create a new session for a broker; nothing is connected until `start`
    pub fn new(info: &BrokerInfo, request_timeout: Duration) -> Self {
        Self {
            name: info.name.clone(),
            addresses: info.addresses.clone(),
            request_timeout,
            state: AtomicU8::new(SessionState::Created as u8),
            channel: OnceLock::new(),
        }
    }

    /// Get the broker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the broker addresses, in connect order
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> SessionState {
        SessionState::from(self.state.load(Ordering::Acquire))
    }

    /// Open the connection; only a `Created` session can be started
    pub async fn start(&self, transport: &dyn Transport, on_received: ReceiveHook) -> Result<()> {
        if self.state() != SessionState::Created {
            return Err(RelaymqClientError::protocol(format!(
                "Session {} cannot be started from state {:?}",
                self.name,
                self.state()
            )));
        }

        let channel = transport
            .connect(&self.name, &self.addresses, on_received)
            .await?;
        if self.channel.set(channel).is_err() {
            return Err(RelaymqClientError::protocol(format!(
                "Session {} was started twice",
                self.name
            )));
        }

        if self
            .state
            .compare_exchange(
                SessionState::Created as u8,
                SessionState::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Closed while connecting
            self.close_channel().await?;
            return Err(RelaymqClientError::Closed);
        }

        debug!("Session {} started", self.name);
        Ok(())
    }

    /// Send a request built from a code, header fields and body
    pub async fn invoke(
        &self,
        code: i32,
        header: Option<HashMap<String, String>>,
        body: Option<Bytes>,
    ) -> Result<RemotingCommand> {
        let mut request = RemotingCommand::request(code);
        if let Some(header) = header {
            request = request.with_ext_fields(header);
        }
        if let Some(body) = body {
            request = request.with_body(body);
        }
        self.invoke_command(request).await
    }

    /// Send a prepared request with the session's request timeout
    pub async fn invoke_command(&self, request: RemotingCommand) -> Result<RemotingCommand> {
        self.invoke_with_timeout(request, self.request_timeout).await
    }

    /// Send a prepared request, waiting at most `request_timeout` for the reply
    pub async fn invoke_with_timeout(
        &self,
        request: RemotingCommand,
        timeout: Duration,
    ) -> Result<RemotingCommand> {
        match self.state() {
            SessionState::Started => {}
            SessionState::Created => return Err(RelaymqClientError::NotStarted),
            SessionState::Disposed => return Err(RelaymqClientError::Closed),
        }

        let channel = self.channel.get().ok_or(RelaymqClientError::NotStarted)?;
        channel.invoke(request, timeout).await
    }

    /// Dispose the session; closing twice is a no-op
    pub async fn close(&self) -> Result<()> {
        let previous = self.state.swap(SessionState::Disposed as u8, Ordering::AcqRel);
        if SessionState::from(previous) != SessionState::Started {
            return Ok(());
        }

        self.close_channel().await?;
        debug!("Session {} closed", self.name);
        Ok(())
    }

    async fn close_channel(&self) -> Result<()> {
        match self.channel.get() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSession")
            .field("name", &self.name)
            .field("addresses", &self.addresses)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResponseCode;
    use crate::transport::ignore_inbound;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingChannel {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl Channel for CountingChannel {
        async fn invoke(
            &self,
            request: RemotingCommand,
            _timeout: Duration,
        ) -> Result<RemotingCommand> {
            Ok(RemotingCommand::response(ResponseCode::Success, None)
                .with_ext_field("code", request.code))
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_healthy(&self) -> bool {
            true
        }
    }

    struct FixedTransport(Arc<CountingChannel>);

    #[async_trait]
    impl Transport for FixedTransport {
        async fn connect(
            &self,
            _name: &str,
            _addresses: &[String],
            _on_received: ReceiveHook,
        ) -> Result<Arc<dyn Channel>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let channel = Arc::new(CountingChannel::default());
        let transport = FixedTransport(channel.clone());
        let info = BrokerInfo::new("broker-a", ["10.0.0.1:10911"]);
        let session = BrokerSession::new(&info, Duration::from_secs(1));

        assert_eq!(session.state(), SessionState::Created);
        assert!(matches!(
            session.invoke(34, None, None).await,
            Err(RelaymqClientError::NotStarted)
        ));

        session.start(&transport, ignore_inbound()).await.unwrap();
        assert_eq!(session.state(), SessionState::Started);
        let response = session.invoke(34, None, None).await.unwrap();
        assert_eq!(response.ext_field("code"), Some("34"));

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Disposed);
        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            session.invoke(34, None, None).await,
            Err(RelaymqClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_session_cannot_restart() {
        let transport = FixedTransport(Arc::new(CountingChannel::default()));
        let info = BrokerInfo::new("broker-a", ["10.0.0.1:10911"]);
        let session = BrokerSession::new(&info, Duration::from_secs(1));

        session.start(&transport, ignore_inbound()).await.unwrap();
        assert!(session.start(&transport, ignore_inbound()).await.is_err());
    }
}
