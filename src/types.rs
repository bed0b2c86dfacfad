use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

const INVITE_CODE_CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const INVITE_CODE_LEN: usize = 6;
const PEER_ID_PREFIX: &[u8] = b"peer_";
const PEER_ID_GENERATED_LEN: usize = 13;
const PEER_ID_CAP: usize = 40;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("invite code {0:?} is not 6 characters from the invite alphabet")]
    InviteCode(String),

    #[error("peer id must be 1 to 40 bytes, got {0}")]
    PeerIdLength(usize),
}

/// Invite code: 6 upper-case characters, also the signaling topic scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InviteCode([u8; INVITE_CODE_LEN]);

impl InviteCode {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; INVITE_CODE_LEN];
        for byte in &mut bytes {
            *byte = INVITE_CODE_CHARS[rng.random_range(0..INVITE_CODE_CHARS.len())];
        }
        Self(bytes)
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("")
    }

    /// Broadcast topic carrying this group's signaling traffic
    pub fn signaling_topic(&self) -> String {
        format!("group:{}:signaling", self.as_str())
    }
}

impl fmt::Display for InviteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lookups are case-insensitive, so codes are normalized to upper case.
/// Anything else that is not exactly 6 alphabet characters is rejected.
impl FromStr for InviteCode {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let src = s.trim().as_bytes();
        if src.len() != INVITE_CODE_LEN {
            return Err(IdError::InviteCode(s.to_string()));
        }

        let mut bytes = [0u8; INVITE_CODE_LEN];
        for (byte, &c) in bytes.iter_mut().zip(src) {
            let c = c.to_ascii_uppercase();
            if !INVITE_CODE_CHARS.contains(&c) {
                return Err(IdError::InviteCode(s.to_string()));
            }
            *byte = c;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<&str> for InviteCode {
    type Error = IdError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl Serialize for InviteCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for InviteCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Peer ID: fixed-capacity inline string.
///
/// Generated ids look like `peer_` + 8 hex; ids read off the wire are kept
/// verbatim up to 40 bytes, which fits a UUID. Longer ids are rejected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    bytes: [u8; PEER_ID_CAP],
    len: u8,
}

impl PeerId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; PEER_ID_CAP];
        bytes[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);

        let mut rng = rand::rng();
        let value: u32 = rng.random();

        for i in 0..8 {
            let nibble = ((value >> (28 - i * 4)) & 0xF) as usize;
            bytes[PEER_ID_PREFIX.len() + i] = HEX_CHARS[nibble];
        }
        Self {
            bytes,
            len: PEER_ID_GENERATED_LEN as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.as_str())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let src = s.as_bytes();
        if src.is_empty() || src.len() > PEER_ID_CAP {
            return Err(IdError::PeerIdLength(src.len()));
        }

        let mut bytes = [0u8; PEER_ID_CAP];
        bytes[..src.len()].copy_from_slice(src);
        Ok(Self {
            bytes,
            len: src.len() as u8,
        })
    }
}

impl TryFrom<&str> for PeerId {
    type Error = IdError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Rider,
}

impl Role {
    pub fn is_leader(self) -> bool {
        self == Role::Leader
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => f.write_str("leader"),
            Role::Rider => f.write_str("rider"),
        }
    }
}

/// Who we are for the lifetime of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupIdentity {
    pub invite_code: InviteCode,
    pub peer_id: PeerId,
    pub nickname: String,
    pub role: Role,
}

impl GroupIdentity {
    pub fn new(invite_code: InviteCode, nickname: impl Into<String>, role: Role) -> Self {
        Self {
            invite_code,
            peer_id: PeerId::generate(),
            nickname: nickname.into(),
            role,
        }
    }

    pub fn leader(invite_code: InviteCode, nickname: impl Into<String>) -> Self {
        Self::new(invite_code, nickname, Role::Leader)
    }

    pub fn rider(invite_code: InviteCode, nickname: impl Into<String>) -> Self {
        Self::new(invite_code, nickname, Role::Rider)
    }
}
