//! Transport layer: how a broker or name server connection is opened and driven

use crate::error::RelaymqClientError;
use crate::protocol::{RemotingCodec, RemotingCommand};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Callback for commands the remote side initiates; the returned command is sent back as the reply
pub type ReceiveHook = Arc<dyn Fn(RemotingCommand) -> Option<RemotingCommand> + Send + Sync>;

/// Hook that ignores inbound requests
pub fn ignore_inbound() -> ReceiveHook {
    Arc::new(|_| None)
}

/// A live, multiplexed connection to one remote endpoint
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a request and wait for the matching response
    async fn invoke(
        &self,
        request: RemotingCommand,
        timeout: Duration,
    ) -> Result<RemotingCommand, RelaymqClientError>;

    /// Close the connection and stop its background task
    async fn close(&self) -> Result<(), RelaymqClientError>;

    /// Check if requests can still be sent
    fn is_healthy(&self) -> bool;
}

/// Opens channels; `addresses` are candidates tried in order
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the first reachable address of broker `name`
    async fn connect(
        &self,
        name: &str,
        addresses: &[String],
        on_received: ReceiveHook,
    ) -> Result<Arc<dyn Channel>, RelaymqClientError>;
}

/// TCP transport speaking remoting frames
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connection_timeout: Duration,
}

impl TcpTransport {
    /// Create a new TCP transport with a per-address connect timeout
    pub fn new(connection_timeout: Duration) -> Self {
        Self { connection_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        name: &str,
        addresses: &[String],
        on_received: ReceiveHook,
    ) -> Result<Arc<dyn Channel>, RelaymqClientError> {
        let mut last_error = None;

        for address in addresses {
            debug!("Connecting to {} at {}", name, address);
            match timeout(self.connection_timeout, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    let channel = TcpChannel::spawn(name, stream, on_received);
                    info!("Connected to {} at {}", name, address);
                    return Ok(Arc::new(channel));
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to {} at {}: {}", name, address, e);
                    last_error = Some(RelaymqClientError::connection(format!(
                        "Failed to connect to {} at {}: {}",
                        name, address, e
                    )));
                }
                Err(_) => {
                    warn!("Timed out connecting to {} at {}", name, address);
                    last_error = Some(RelaymqClientError::timeout(
                        self.connection_timeout.as_millis() as u64,
                    ));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RelaymqClientError::connection(format!("No address configured for {}", name))
        }))
    }
}

type PendingMap = Arc<Mutex<HashMap<i32, oneshot::Sender<RemotingCommand>>>>;

/// Removes a request's reply slot when its `invoke` finishes or is dropped
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    opaque: i32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.opaque);
    }
}

/// Channel over one TCP connection, correlating responses by opaque id
#[derive(Debug)]
pub struct TcpChannel {
    name: String,
    next_opaque: AtomicI32,
    pending: PendingMap,
    outbound: mpsc::UnboundedSender<RemotingCommand>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TcpChannel {
    fn spawn(name: &str, stream: TcpStream, on_received: ReceiveHook) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let framed = Framed::new(stream, RemotingCodec::new());

        let handle = tokio::spawn(Self::connection_loop(
            name.to_string(),
            framed,
            outbound_rx,
            pending.clone(),
            on_received,
            shutdown_rx,
        ));

        Self {
            name: name.to_string(),
            next_opaque: AtomicI32::new(1),
            pending,
            outbound,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    async fn connection_loop(
        name: String,
        mut framed: Framed<TcpStream, RemotingCodec>,
        mut outbound_rx: mpsc::UnboundedReceiver<RemotingCommand>,
        pending: PendingMap,
        on_received: ReceiveHook,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown requested for {}", name);
                        break;
                    }
                }

                // Outgoing requests
                request = outbound_rx.recv() => {
                    match request {
                        Some(cmd) => {
                            debug!("Sending command {} (opaque {}) to {}", cmd.code, cmd.opaque, name);
                            if let Err(e) = framed.send(cmd).await {
                                error!("Failed to send to {}: {}", name, e);
                                break;
                            }
                        }
                        None => {
                            debug!("Request channel closed for {}", name);
                            break;
                        }
                    }
                }

                // Responses and broker-initiated requests
                inbound = framed.next() => {
                    match inbound {
                        Some(Ok(cmd)) if cmd.is_response() => {
                            match pending.lock().remove(&cmd.opaque) {
                                Some(waiter) => {
                                    let _ = waiter.send(cmd);
                                }
                                None => warn!(
                                    "Received response with no pending request from {} (opaque {})",
                                    name, cmd.opaque
                                ),
                            }
                        }
                        Some(Ok(cmd)) => {
                            let opaque = cmd.opaque;
                            let oneway = cmd.is_oneway();
                            debug!("Received command {} from {}", cmd.code, name);
                            if let Some(mut reply) = on_received(cmd) {
                                if !oneway {
                                    reply.opaque = opaque;
                                    reply.mark_response();
                                    if let Err(e) = framed.send(reply).await {
                                        error!("Failed to reply to {}: {}", name, e);
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!("Error receiving from {}: {}", name, e);
                            break;
                        }
                        None => {
                            debug!("Stream closed by {}", name);
                            break;
                        }
                    }
                }
            }
        }

        // Dropping the senders fails every waiter with a closed channel
        pending.lock().clear();
        info!("Connection to {} closed", name);
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn invoke(
        &self,
        mut request: RemotingCommand,
        request_timeout: Duration,
    ) -> Result<RemotingCommand, RelaymqClientError> {
        let opaque = self.next_opaque.fetch_add(1, Ordering::SeqCst);
        request.opaque = opaque;

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.lock().insert(opaque, response_tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            opaque,
        };

        if self.outbound.send(request).is_err() {
            return Err(RelaymqClientError::connection(format!(
                "Connection to {} closed",
                self.name
            )));
        }

        match timeout(request_timeout, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RelaymqClientError::connection(format!(
                "Connection to {} dropped before responding",
                self.name
            ))),
            Err(_) => Err(RelaymqClientError::timeout(
                request_timeout.as_millis() as u64,
            )),
        }
    }

    async fn close(&self) -> Result<(), RelaymqClientError> {
        self.shutdown.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.await.map_err(|e| {
                RelaymqClientError::connection(format!(
                    "Connection task for {} failed: {}",
                    self.name, e
                ))
            })?;
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        !*self.shutdown.borrow() && !self.outbound.is_closed()
    }
}
