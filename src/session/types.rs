use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::protocol::RiderLocation;
use crate::signaling::SignalingError;
use crate::types::PeerId;

/// Nickname shown for the leader when the group lookup did not provide one
pub const DEFAULT_LEADER_NICKNAME: &str = "Leader";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),

    #[error("session closed")]
    Closed,
}

/// One roster entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiderInfo {
    pub nickname: String,
    pub is_leader: bool,
    pub is_connected: bool,
}

/// Full roster as of one event. Always replaced whole, never patched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RosterSnapshot {
    pub riders: BTreeMap<PeerId, RiderInfo>,
    /// At least one direct peer connection is up
    pub connected: bool,
}

impl RosterSnapshot {
    pub fn get(&self, peer: &PeerId) -> Option<&RiderInfo> {
        self.riders.get(peer)
    }

    pub fn len(&self) -> usize {
        self.riders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.riders.is_empty()
    }
}

/// Latest location per participant
pub type LocationMap = BTreeMap<PeerId, RiderLocation>;
