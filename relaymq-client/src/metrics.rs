//! Process-wide counters for sessions, provisioning, sends and consumption

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Counters shared by every client in the process
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub sessions_opened: AtomicU64,
    pub session_open_failures: AtomicU64,

    /// Brokers that accepted a create/update topic command
    pub topic_provisions: AtomicU64,
    pub topic_provision_failures: AtomicU64,

    pub messages_sent: AtomicU64,
    pub payload_bytes_sent: AtomicU64,
    pub send_failures: AtomicU64,
    send_micros_total: AtomicU64,

    pub messages_consumed: AtomicU64,
    pub batches_rejected: AtomicU64,
    /// Consumer group membership notifications pushed by brokers
    pub membership_changes: AtomicU64,

    pub close_failures: AtomicU64,
}

impl ClientMetrics {
    /// Record a broker session that connected
    pub fn record_session_created(&self) {
        self.sessions_opened.fetch_add(1, Relaxed);
    }

    /// Record a broker session that failed to connect
    pub fn record_session_failure(&self) {
        self.session_open_failures.fetch_add(1, Relaxed);
    }

    /// Record a broker that accepted a topic
    pub fn record_topic_provisioned(&self) {
        self.topic_provisions.fetch_add(1, Relaxed);
    }

    /// Record a broker that rejected or missed a topic
    pub fn record_provision_failure(&self) {
        self.topic_provision_failures.fetch_add(1, Relaxed);
    }

    /// Record a successful send
    pub fn record_send(&self, payload_bytes: u64, took: Duration) {
        self.messages_sent.fetch_add(1, Relaxed);
        self.payload_bytes_sent.fetch_add(payload_bytes, Relaxed);
        self.send_micros_total
            .fetch_add(took.as_micros() as u64, Relaxed);
    }

    /// Record a failed send
    pub fn record_send_error(&self) {
        self.send_failures.fetch_add(1, Relaxed);
    }

    /// Record messages the consume callback accepted
    pub fn record_consume(&self, message_count: u64) {
        self.messages_consumed.fetch_add(message_count, Relaxed);
    }

    /// A batch the consume callback refused
    pub fn record_consume_failure(&self) {
        self.batches_rejected.fetch_add(1, Relaxed);
    }

    /// Record a membership notification from a broker
    pub fn record_membership_change(&self) {
        self.membership_changes.fetch_add(1, Relaxed);
    }

    /// Record a child that failed to close
    pub fn record_dispose_failure(&self) {
        self.close_failures.fetch_add(1, Relaxed);
    }

    /// Mean time per successful send; zero before the first one
    pub fn mean_send_latency(&self) -> Duration {
        match self.messages_sent.load(Relaxed) {
            0 => Duration::ZERO,
            sent => Duration::from_micros(self.send_micros_total.load(Relaxed) / sent),
        }
    }

    /// Get a snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Relaxed),
            session_open_failures: self.session_open_failures.load(Relaxed),
            topic_provisions: self.topic_provisions.load(Relaxed),
            topic_provision_failures: self.topic_provision_failures.load(Relaxed),
            messages_sent: self.messages_sent.load(Relaxed),
            payload_bytes_sent: self.payload_bytes_sent.load(Relaxed),
            send_failures: self.send_failures.load(Relaxed),
            mean_send_latency: self.mean_send_latency(),
            messages_consumed: self.messages_consumed.load(Relaxed),
            batches_rejected: self.batches_rejected.load(Relaxed),
            membership_changes: self.membership_changes.load(Relaxed),
            close_failures: self.close_failures.load(Relaxed),
        }
    }
}

/// Point-in-time copy of [`ClientMetrics`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub session_open_failures: u64,
    pub topic_provisions: u64,
    pub topic_provision_failures: u64,
    pub messages_sent: u64,
    pub payload_bytes_sent: u64,
    pub send_failures: u64,
    pub mean_send_latency: Duration,
    pub messages_consumed: u64,
    pub batches_rejected: u64,
    pub membership_changes: u64,
    pub close_failures: u64,
}

static METRICS: Lazy<Arc<ClientMetrics>> = Lazy::new(|| Arc::new(ClientMetrics::default()));

/// Get the process-wide metrics instance
pub fn global_metrics() -> Arc<ClientMetrics> {
    Arc::clone(&METRICS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_send_latency() {
        let metrics = ClientMetrics::default();
        assert_eq!(metrics.mean_send_latency(), Duration::ZERO);

        metrics.record_send(100, Duration::from_micros(10));
        metrics.record_send(50, Duration::from_micros(30));
        metrics.record_send_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.payload_bytes_sent, 150);
        assert_eq!(snapshot.send_failures, 1);
        assert_eq!(snapshot.mean_send_latency, Duration::from_micros(20));
    }
}
