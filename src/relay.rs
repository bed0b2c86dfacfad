//! WebSocket broadcast relay carrying group signaling

mod actor;
mod messages;
mod server;
mod types;

pub use actor::TopicManagerHandle;
pub use messages::{ClientMessage, ServerMessage};
pub use server::{DEFAULT_RELAY_PORT, RelayServer};
pub use types::{ConnId, MAX_TOPIC_LEN, OutboundMessage, RelayError};
