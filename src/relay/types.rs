use std::collections::HashMap;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;

/// Topic names longer than this are refused
pub const MAX_TOPIC_LEN: usize = 128;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("topic name too long ({0} bytes)")]
    TopicTooLong(usize),

    #[error("not subscribed to {0}")]
    NotSubscribed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Relay-assigned id of one WebSocket connection
pub type ConnId = u64;

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    /// Create a new outbound message from any string type
    pub fn new(s: impl Into<Utf8Bytes>) -> Self {
        Self(s.into())
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

#[derive(Debug)]
pub(crate) struct Subscriber {
    pub addr: SocketAddr,
    /// Channel for outbound messages to this connection.
    /// Uses OutboundMessage (Arc<str>) for O(1) broadcast cloning.
    pub tx: mpsc::UnboundedSender<OutboundMessage>,
}

#[derive(Debug, Default)]
pub(crate) struct Topic {
    pub subscribers: HashMap<ConnId, Subscriber>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_message_from_string() {
        let msg = OutboundMessage::from("payload".to_string());
        assert_eq!(msg.into_inner().as_str(), "payload");
    }

    #[test]
    fn outbound_message_is_cheap_to_clone() {
        let msg = OutboundMessage::new("shared");
        let copy = msg.clone();
        assert_eq!(copy.into_inner().as_str(), msg.into_inner().as_str());
    }

    #[test]
    fn relay_error_display() {
        let err = RelayError::TopicTooLong(200);
        assert_eq!(err.to_string(), "topic name too long (200 bytes)");
    }
}
