//! Serverless group live-location sharing: a leader and its riders connect
//! peer-to-peer in a star, negotiating over a broadcast signaling channel,
//! and the leader relays every rider's position to the rest of the group.

pub mod directory;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod types;
