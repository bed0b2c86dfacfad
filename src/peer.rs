//! Per-peer connection management: negotiation, lifecycle and the data channel

mod connection;
mod state;
mod types;

pub use connection::PeerHandle;
pub use state::{ChannelState, ConnectionState, PeerStatus};
pub use types::{ConnectionId, PeerError, PeerEvent, PeerEventKind};
