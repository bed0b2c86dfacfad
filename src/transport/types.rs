use std::fmt;
use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{IceCandidate, SessionDescription};
use crate::types::PeerId;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid transport state: {0}")]
    InvalidState(&'static str),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("data channel is not open")]
    ChannelClosed,

    #[error("transport closed")]
    Closed,

    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
}

/// Connection state as reported by the underlying transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Everything a transport reports asynchronously
#[derive(Debug)]
pub enum TransportEvent<C> {
    /// A locally gathered candidate
    IceCandidate(IceCandidate),
    /// Local gathering has finished; no further batch candidates follow
    GatheringComplete,
    StateChanged(TransportState),
    /// The remote side opened a data channel
    DataChannel(C),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
}

pub type TransportEvents<C> = mpsc::UnboundedReceiver<TransportEvent<C>>;

/// Reliable, ordered message stream over an established connection
pub trait DataChannel: Send + Sync + 'static {
    fn label(&self) -> &str;

    fn send_text(&self, text: &str) -> Result<(), TransportError>;

    fn close(&self);
}

/// One direct connection to a remote peer, negotiated by offer/answer.
///
/// Setting the local description starts candidate gathering; candidates and
/// `GatheringComplete` arrive on the transport's event stream.
pub trait PeerTransport: Send + Sync + 'static {
    type Channel: DataChannel;

    fn create_data_channel(
        &self,
        label: &str,
    ) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;

    fn create_offer(
        &self,
    ) -> impl Future<Output = Result<SessionDescription, TransportError>> + Send;

    fn create_answer(
        &self,
    ) -> impl Future<Output = Result<SessionDescription, TransportError>> + Send;

    fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Builds one transport per remote peer
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: PeerTransport;

    #[allow(clippy::type_complexity)]
    fn create(
        &self,
        remote: PeerId,
    ) -> Result<
        (
            Self::Transport,
            TransportEvents<<Self::Transport as PeerTransport>::Channel>,
        ),
        TransportError,
    >;
}
