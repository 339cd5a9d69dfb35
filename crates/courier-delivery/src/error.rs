//! Error types for delivery operations.
//!
//! Defines the failure taxonomy the workers classify against: broker
//! connectivity, malformed payloads, retryable gateway/downstream failures,
//! and permanent rejections. Classification drives the retry-or-dead-letter
//! decision tree, so every variant carries an explicit retryability.

use courier_core::BrokerError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failure taxonomy for the delivery pipeline.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Broker-level connectivity failure. Handled by the reconnect loop,
    /// never treated as a job failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Queue payload could not be deserialized. A parse failure will never
    /// succeed on retry, so these dead-letter immediately.
    #[error("malformed job payload: {reason}")]
    MalformedJob {
        /// Description of the parse failure.
        reason: String,
    },

    /// The gateway call exceeded its bounded timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Seconds before the request timed out.
        timeout_seconds: u64,
    },

    /// Network-level failure reaching the gateway.
    #[error("network error: {message}")]
    Network {
        /// Description of the network failure.
        message: String,
    },

    /// Gateway responded with a server error (5xx-equivalent).
    #[error("gateway server error: HTTP {status}")]
    GatewayServer {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Gateway rate-limited the request.
    #[error("rate limited by gateway")]
    RateLimited {
        /// Seconds to wait, from the Retry-After header when present.
        retry_after_seconds: Option<u64>,
    },

    /// Gateway permanently rejected the message (4xx-equivalent, e.g. an
    /// invalid recipient). Never retried.
    #[error("gateway rejected message: HTTP {status}: {reason}")]
    GatewayRejected {
        /// HTTP status code.
        status: u16,
        /// Rejection reason, truncated.
        reason: String,
    },

    /// Inbound event carries an event type the pipeline cannot apply.
    /// Never retried; the type will not become known on redelivery.
    #[error("unknown event type: {event_type}")]
    UnknownEventType {
        /// The unrecognized type, verbatim.
        event_type: String,
    },

    /// Downstream apply failed; retryability is tagged by the collaborator.
    #[error("downstream apply failed: {reason}")]
    ApplyFailed {
        /// Description of the apply failure.
        reason: String,
        /// Whether the collaborator tagged the failure as retryable.
        retryable: bool,
    },

    /// Worker shutdown was requested mid-drain.
    #[error("worker shutdown requested")]
    ShutdownRequested,

    /// Worker pool failed to drain within the shutdown timeout.
    #[error("worker shutdown timed out after {seconds}s")]
    ShutdownTimeout {
        /// The timeout that was exceeded, in seconds.
        seconds: u64,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Description of the internal failure.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a malformed-payload error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedJob { reason: reason.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a gateway server error from an HTTP response.
    pub fn gateway_server(status: u16, body: impl Into<String>) -> Self {
        Self::GatewayServer { status, body: body.into() }
    }

    /// Creates a permanent gateway rejection from an HTTP response.
    pub fn gateway_rejected(status: u16, reason: impl Into<String>) -> Self {
        Self::GatewayRejected { status, reason: reason.into() }
    }

    /// Creates an unknown-event-type error.
    pub fn unknown_event_type(event_type: impl Into<String>) -> Self {
        Self::UnknownEventType { event_type: event_type.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether this failure should go through the retry coordinator.
    ///
    /// Timeouts, network errors, 5xx responses, rate limits, and
    /// retryable-tagged apply failures retry. Malformed payloads, permanent
    /// rejections, and unknown event types dead-letter immediately. Broker
    /// errors are connectivity, not job failures, and retry by definition
    /// (the message stays on the queue).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker(_)
            | Self::Timeout { .. }
            | Self::Network { .. }
            | Self::GatewayServer { .. }
            | Self::RateLimited { .. } => true,

            Self::ApplyFailed { retryable, .. } => *retryable,

            Self::MalformedJob { .. }
            | Self::GatewayRejected { .. }
            | Self::UnknownEventType { .. }
            | Self::ShutdownRequested
            | Self::ShutdownTimeout { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Suggested delay override for rate-limited failures.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified() {
        assert!(DeliveryError::timeout(15).is_retryable());
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::gateway_server(503, "unavailable").is_retryable());
        assert!(DeliveryError::RateLimited { retry_after_seconds: Some(30) }.is_retryable());
        assert!(DeliveryError::ApplyFailed { reason: "lock".into(), retryable: true }
            .is_retryable());
    }

    #[test]
    fn permanent_errors_identified() {
        assert!(!DeliveryError::malformed("truncated json").is_retryable());
        assert!(!DeliveryError::gateway_rejected(422, "invalid recipient").is_retryable());
        assert!(!DeliveryError::unknown_event_type("presence-update").is_retryable());
        assert!(!DeliveryError::ApplyFailed { reason: "conflict".into(), retryable: false }
            .is_retryable());
        assert!(!DeliveryError::ShutdownRequested.is_retryable());
    }

    #[test]
    fn retry_after_only_set_for_rate_limits() {
        assert_eq!(
            DeliveryError::RateLimited { retry_after_seconds: Some(120) }.retry_after_seconds(),
            Some(120)
        );
        assert_eq!(DeliveryError::timeout(15).retry_after_seconds(), None);
    }
}
