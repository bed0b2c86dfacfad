use serde::{Deserialize, Serialize};

/// Messages sent from client to relay
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Start receiving publications on a topic
    #[serde(rename = "subscribe")]
    Subscribe { topic: String },

    /// Fan a payload out to every other subscriber of the topic
    #[serde(rename = "publish")]
    Publish { topic: String, payload: String },

    /// Stop receiving publications on a topic
    #[serde(rename = "unsubscribe")]
    Unsubscribe { topic: String },
}

/// Messages sent from relay to client
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Subscription accepted
    #[serde(rename = "subscribed")]
    Subscribed { topic: String },

    /// A publication from another subscriber
    #[serde(rename = "broadcast")]
    Broadcast { topic: String, payload: String },

    /// Error response
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        message: String,
    },
}
