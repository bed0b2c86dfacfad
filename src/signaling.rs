//! Group-scoped signaling over a publish/subscribe broadcast fabric

mod client;
mod fabric;
mod memory;
mod types;
mod websocket;

pub use client::SignalingClient;
pub use fabric::{Fabric, Inbound, TopicLink};
pub use memory::{MemoryFabric, MemoryLink};
pub use types::SignalingError;
pub use websocket::{WsFabric, WsLink};
