//! Broker-level error types shared across broker implementations.
//!
//! These errors describe failures of the queue backend itself (connectivity,
//! publish, consume). Job-level failures are classified separately by the
//! delivery crate; broker errors never surface as job failures.

use thiserror::Error;

/// Result type alias using `BrokerError`.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors produced by the broker backend and the connection manager.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker is unreachable or the connection was lost.
    #[error("broker connection failed: {message}")]
    Connection {
        /// Description of the connectivity failure.
        message: String,
    },

    /// The named queue has not been declared.
    #[error("queue not declared: {queue}")]
    QueueNotFound {
        /// Name of the missing queue.
        queue: String,
    },

    /// Publishing a message failed after the connection was established.
    #[error("publish failed on queue {queue}: {message}")]
    Publish {
        /// Queue the publish was directed at.
        queue: String,
        /// Description of the failure.
        message: String,
    },

    /// Acknowledging a delivery failed, typically because the delivery tag
    /// is no longer held (lease expired or connection was recycled).
    #[error("acknowledgement failed for delivery {tag}: {message}")]
    Ack {
        /// The delivery tag that could not be acknowledged.
        tag: String,
        /// Description of the failure.
        message: String,
    },

    /// The manager or broker has been stopped.
    #[error("broker connection is closed")]
    Closed,
}

impl BrokerError {
    /// Creates a connection error from a message.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Creates a missing-queue error.
    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound { queue: queue.into() }
    }

    /// Creates a publish error.
    pub fn publish(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish { queue: queue.into(), message: message.into() }
    }

    /// Creates an acknowledgement error.
    pub fn ack(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Ack { tag: tag.into(), message: message.into() }
    }

    /// Returns true when the error indicates lost connectivity rather than a
    /// per-message problem. Connectivity errors are handled by the
    /// reconnect loop, not by job-failure classification.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_errors_identified() {
        assert!(BrokerError::connection("refused").is_connectivity());
        assert!(BrokerError::Closed.is_connectivity());
        assert!(!BrokerError::queue_not_found("courier.outbound").is_connectivity());
        assert!(!BrokerError::publish("courier.outbound", "full").is_connectivity());
    }

    #[test]
    fn display_includes_queue_name() {
        let err = BrokerError::publish("courier.webhook", "serialization");
        assert_eq!(err.to_string(), "publish failed on queue courier.webhook: serialization");
    }
}
