//! Point-to-point transports with a data-channel abstraction

mod memory;
mod rtc;
mod types;

pub use memory::{MemoryChannel, MemoryNetwork, MemoryTransport, MemoryTransportFactory};
pub use rtc::{
    DEFAULT_STUN_URLS, IceServer, WebRtcChannel, WebRtcTransport, WebRtcTransportFactory,
    default_ice_servers,
};
pub use types::{
    DataChannel, PeerTransport, TransportError, TransportEvent, TransportEvents, TransportFactory,
    TransportState,
};
