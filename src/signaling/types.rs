use thiserror::Error;

/// Signaling errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("subscription to {topic} rejected: {reason}")]
    SubscriptionRejected { topic: String, reason: String },

    #[error("cannot reach broadcast fabric: {0}")]
    Connect(String),

    #[error("not connected to signaling channel")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("invalid signaling message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
