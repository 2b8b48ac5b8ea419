use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::WebhookName;

/// Result type for channel and webhook operations.
pub type Result<T, E = HubError> = std::result::Result<T, E>;

/// Errors surfaced by the channel store, registry, cursor tracker and dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// Malformed channel or webhook definition.
    /// Rejected synchronously, never enters delivery.
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("channel not found: {name}")]
    ChannelNotFound { name: String },

    #[error("item {sequence} not found in channel {channel}")]
    ItemNotFound { channel: String, sequence: u64 },

    #[error("webhook not found: {name}")]
    WebhookNotFound { name: String },

    /// Attempted cursor regression. Fatal to the worker instance that hit it.
    #[error("cursor for webhook {webhook} cannot move from {current} to {attempted}")]
    OutOfOrder {
        webhook: WebhookName,
        current: u64,
        attempted: u64,
    },

    /// Transient callback failure. Contained inside the delivery worker.
    #[error("delivery failed: {0}")]
    Delivery(FailureReason),

    /// Webhook exceeded its failure threshold and needs a manual reset.
    #[error("webhook {name} is suspended after repeated delivery failures")]
    WebhookSuspended { name: WebhookName },

    #[error("dispatcher is shut down")]
    Shutdown,

    #[error("storage error: {message}")]
    Storage { message: String },
}

impl HubError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        HubError::Validation {
            message: message.into(),
        }
    }

    #[cfg(feature = "redis")]
    pub(crate) fn storage(message: impl fmt::Display) -> Self {
        HubError::Storage {
            message: message.to_string(),
        }
    }

    /// HTTP status a transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            HubError::Validation { .. } => 400,
            HubError::ChannelNotFound { .. }
            | HubError::ItemNotFound { .. }
            | HubError::WebhookNotFound { .. } => 404,
            HubError::WebhookSuspended { .. } => 409,
            HubError::Shutdown => 503,
            HubError::OutOfOrder { .. } | HubError::Delivery(_) | HubError::Storage { .. } => 500,
        }
    }
}

/// Reasons why a callback attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Timeout,
    Network,
    /// 5xx and other non-success responses.
    RemoteError(u16),
    /// 4xx responses. Still retried: skipping would break ordering.
    ClientError(u16),
    /// The callback body could not be built.
    Encoding,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Network =>
                write!(f, "network error"),
            FailureReason::RemoteError(status) =>
                write!(f, "remote endpoint returned {}", status),
            FailureReason::ClientError(status) =>
                write!(f, "client error {}", status),
            FailureReason::Encoding =>
                write!(f, "failed to encode callback body"),
        }
    }
}

impl From<FailureReason> for HubError {
    fn from(reason: FailureReason) -> Self {
        HubError::Delivery(reason)
    }
}
