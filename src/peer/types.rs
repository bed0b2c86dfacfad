use thiserror::Error;

use super::state::ConnectionState;
use crate::protocol::{IceCandidate, LocationMessage};
use crate::transport::TransportError;
use crate::types::PeerId;

/// Per-peer errors. None of these ever leave the peer's own flow.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("{op} not valid in state {state}")]
    NegotiationState {
        op: &'static str,
        state: ConnectionState,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed data-channel payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("peer connection closed")]
    Closed,
}

/// Generation number telling apart successive connections to one peer id
pub type ConnectionId = u64;

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// Entered `CONNECTED`
    Connected,
    /// Entered a terminal state
    Disconnected(ConnectionState),
    Location(LocationMessage),
    /// Locally gathered candidate, for observability only
    IceCandidate(IceCandidate),
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer: PeerId,
    pub conn: ConnectionId,
    pub kind: PeerEventKind,
}
