//! # RelayMQ Client Library
//!
//! Async Rust client for RelayMQ brokers.
//!
//! What the crate gives you on top of the raw remoting protocol:
//!
//! - **Session Reuse**: one connection per broker per client, opened on first use
//! - **Producer Factory**: one started producer per topic, with the topic
//!   provisioned on every broker before first use
//! - **Consumer Container**: owns a set of running consumers and shuts them
//!   all down together
//! - **Runtime**: every network call is a tokio future
//! - **Observability**: `tracing` logs and built-in metrics
//!
//! ## Publishing
//!
//! ```rust,no_run
//! use relaymq_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let factory = ProducerFactory::new("127.0.0.1:9876").await?;
//!     let producer = factory.get_topic_producer("orders").await?;
//!
//!     let result = producer
//!         .publish(Message::new("order #1").with_tags("order_create"))
//!         .await?;
//!     println!("Sent {} to {}", result.msg_id, result.queue);
//!
//!     factory.close().await
//! }
//! ```
//!
//! ## Consuming
//!
//! ```rust,no_run
//! use relaymq_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let container = ConsumerContainer::new("127.0.0.1:9876")?;
//!     container
//!         .add_topic_consumer(
//!             "order-service",
//!             "orders",
//!             |queue, messages| {
//!                 for message in messages {
//!                     println!("{}: {}", queue, String::from_utf8_lossy(&message.body));
//!                 }
//!                 true
//!             },
//!             ["order_create", "order_commit"],
//!         )
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     container.close().await
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod consumer;
pub mod container;
pub mod error;
pub mod factory;
pub mod metrics;
pub mod producer;
pub mod protocol;
pub mod route;
pub mod session;
pub mod transport;

pub use client::*;
pub use config::*;
pub use consumer::*;
pub use container::*;
pub use error::*;
pub use factory::*;
pub use producer::*;
pub use protocol::{BrokerInfo, Message, MessageExt, MessageQueue, SendResult, SendStatus};
pub use route::{NameServerClient, RouteSource};
pub use session::{BrokerSession, SessionState};
pub use transport::{Channel, ReceiveHook, TcpTransport, Transport};

/// Result carrying a [`RelaymqClientError`]
pub type Result<T> = std::result::Result<T, RelaymqClientError>;

/// Crate version from Cargo metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
