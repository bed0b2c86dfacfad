use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::PeerId;

/// Label of the single data channel opened per peer connection
pub const DATA_CHANNEL_LABEL: &str = "location";

/// Milliseconds since the Unix epoch, the timestamp unit on every wire format
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged through signaling (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A possible network path offered by a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Offer or answer payload: the description plus the whole gathered batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Negotiation {
    pub description: SessionDescription,
    pub candidates: Vec<IceCandidate>,
}

/// Signaling payloads, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Signal {
    Join {
        nickname: String,
    },
    Offer(Negotiation),
    Answer(Negotiation),
    Ice {
        candidate: IceCandidate,
    },
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Join { .. } => "join",
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::Ice { .. } => "ice",
            Signal::Leave { .. } => "leave",
        }
    }
}

/// Signaling envelope published on the group's broadcast topic.
/// `to_peer_id == None` addresses every member of the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(flatten)]
    pub signal: Signal,
    pub from_peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_peer_id: Option<PeerId>,
    pub timestamp: u64,
}

impl SignalingMessage {
    /// Whether a member with `peer_id` should see this message
    pub fn is_for(&self, peer_id: &PeerId) -> bool {
        match &self.to_peer_id {
            None => true,
            Some(to) => to == peer_id,
        }
    }
}

/// Location update carried over the data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationMessage {
    pub id: PeerId,
    pub nickname: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    pub ts: u64,
}

/// Messages on the data channel, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelMessage {
    Location(LocationMessage),
}

/// Latest known position of one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiderLocation {
    pub peer_id: PeerId,
    pub nickname: String,
    pub lat: f64,
    pub lng: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub timestamp: u64,
}

impl From<&LocationMessage> for RiderLocation {
    fn from(msg: &LocationMessage) -> Self {
        Self {
            peer_id: msg.id,
            nickname: msg.nickname.clone(),
            lat: msg.lat,
            lng: msg.lng,
            heading: msg.heading,
            speed: msg.speed,
            timestamp: msg.ts,
        }
    }
}

/// One sample from the geolocation source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub timestamp: u64,
}

impl LocationSample {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            heading: None,
            speed: None,
            timestamp: now_millis(),
        }
    }
}
