//! WebRTC transport: one webrtc-rs `RTCPeerConnection` per remote peer.
//!
//! The connection is created lazily on first use, so the factory stays
//! synchronous. Callbacks are forwarded in order onto the transport's event
//! stream; a `None` candidate marks the end of gathering.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{OnceCell, mpsc};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::types::{
    DataChannel, PeerTransport, TransportError, TransportEvent, TransportEvents, TransportFactory,
    TransportState,
};
use crate::protocol::{IceCandidate, SessionDescription};
use crate::types::PeerId;

type EventTx = mpsc::UnboundedSender<TransportEvent<WebRtcChannel>>;

/// Public STUN servers used when no ICE servers are configured
pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// STUN or TURN server handed to every peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

pub fn default_ice_servers() -> Vec<IceServer> {
    DEFAULT_STUN_URLS.iter().map(|url| IceServer::stun(url)).collect()
}

/// Builds WebRTC transports sharing one webrtc-rs API instance
#[derive(Clone)]
pub struct WebRtcTransportFactory {
    api: Arc<API>,
    ice_servers: Vec<IceServer>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<IceServer>) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }

    /// Factory using `DEFAULT_STUN_URLS`
    pub fn with_default_servers() -> Result<Self, TransportError> {
        Self::new(default_ice_servers())
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }
}

impl TransportFactory for WebRtcTransportFactory {
    type Transport = WebRtcTransport;

    fn create(
        &self,
        remote: PeerId,
    ) -> Result<(WebRtcTransport, TransportEvents<WebRtcChannel>), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("WebRTC transport created for {}", remote);

        let transport = WebRtcTransport {
            api: self.api.clone(),
            ice_servers: self.ice_servers.iter().map(IceServer::to_rtc).collect(),
            remote,
            events: tx,
            pc: OnceCell::new(),
            closed: AtomicBool::new(false),
        };
        Ok((transport, rx))
    }
}

pub struct WebRtcTransport {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    remote: PeerId,
    events: EventTx,
    pc: OnceCell<Arc<RTCPeerConnection>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    async fn connection(&self) -> Result<&Arc<RTCPeerConnection>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.pc.get_or_try_init(|| self.open()).await
    }

    async fn open(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            match candidate.map(|c| c.to_json()) {
                Some(Ok(init)) => {
                    let _ = events.send(TransportEvent::IceCandidate(from_init(init)));
                }
                Some(Err(e)) => warn!("Skipping unreadable local candidate: {}", e),
                None => {
                    let _ = events.send(TransportEvent::GatheringComplete);
                }
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let remote = self.remote;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Connection to {} is {}", remote, state);
            if let Some(state) = transport_state(state) {
                let _ = events.send(TransportEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel = WebRtcChannel::new(dc.clone());
            // DataChannel must precede ChannelOpen; on_open fires at once
            // for a channel that is already open
            let _ = events.send(TransportEvent::DataChannel(channel.clone()));
            channel.watch(&dc, events.clone());
            Box::pin(async {})
        }));

        debug!("Peer connection to {} opened", self.remote);
        Ok(pc)
    }
}

impl PeerTransport for WebRtcTransport {
    type Channel = WebRtcChannel;

    async fn create_data_channel(&self, label: &str) -> Result<WebRtcChannel, TransportError> {
        let pc = self.connection().await?;
        let dc = pc.create_data_channel(label, None).await?;

        let channel = WebRtcChannel::new(dc.clone());
        channel.watch(&dc, self.events.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let pc = self.connection().await?;
        from_rtc(pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let pc = self.connection().await?;
        if pc.remote_description().await.is_none() {
            return Err(TransportError::InvalidState("no remote offer"));
        }
        from_rtc(pc.create_answer(None).await?)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let pc = self.connection().await?;
        pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc(description)?;
        let pc = self.connection().await?;
        pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let pc = self.connection().await?;
        if pc.remote_description().await.is_none() {
            return Err(TransportError::InvalidState("remote description not set"));
        }
        pc.add_ice_candidate(to_init(candidate)).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pc) = self.pc.get() {
            if let Err(e) = pc.close().await {
                debug!("Closing connection to {} failed: {}", self.remote, e);
            }
        }
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(pc) = self.pc.get().cloned() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            let _ = pc.close().await;
        });
    }
}

enum Outbound {
    Text(String),
    Close,
}

/// Data channel handle. Sends are queued to a writer task, which keeps
/// `send_text` synchronous and preserves order.
#[derive(Clone)]
pub struct WebRtcChannel {
    label: String,
    open: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl WebRtcChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            label: dc.label().to_string(),
            open: Arc::new(AtomicBool::new(false)),
            outbound: tx,
        };
        tokio::spawn(write_loop(dc, rx));
        channel
    }

    /// Forward the channel's open, message and close callbacks to `events`
    fn watch(&self, dc: &RTCDataChannel, events: EventTx) {
        let open = self.open.clone();
        let tx = events.clone();
        dc.on_open(Box::new(move || {
            open.store(true, Ordering::Release);
            let _ = tx.send(TransportEvent::ChannelOpen);
            Box::pin(async {})
        }));

        let tx = events.clone();
        let label = self.label.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(TransportEvent::ChannelMessage(text));
                }
                Err(_) => warn!("Dropping binary message on {}", label),
            }
            Box::pin(async {})
        }));

        let open = self.open.clone();
        dc.on_close(Box::new(move || {
            if open.swap(false, Ordering::AcqRel) {
                let _ = events.send(TransportEvent::ChannelClosed);
            }
            Box::pin(async {})
        }));
    }
}

impl fmt::Debug for WebRtcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcChannel")
            .field("label", &self.label)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}

impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed);
        }
        self.outbound
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.outbound.send(Outbound::Close);
    }
}

async fn write_loop(dc: Arc<RTCDataChannel>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Text(text) => {
                if let Err(e) = dc.send_text(text).await {
                    warn!("Send on data channel {} failed: {}", dc.label(), e);
                }
            }
            Outbound::Close => break,
        }
    }
    if let Err(e) = dc.close().await {
        debug!("Closing data channel {} failed: {}", dc.label(), e);
    }
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match description.kind {
        crate::protocol::SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        crate::protocol::SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(TransportError::InvalidDescription(format!(
            "unexpected {} description",
            other
        ))),
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
