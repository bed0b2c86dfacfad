//! Loopback transport: endpoints inside one process linked by offer/answer.
//!
//! Descriptions carry the endpoint name and gathering yields one host
//! candidate per endpoint. Two endpoints link once each has a local
//! description, the other's description, and one of the other's candidates.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use super::types::{
    DataChannel, PeerTransport, TransportError, TransportEvent, TransportEvents, TransportFactory,
    TransportState,
};
use crate::protocol::{IceCandidate, SessionDescription};
use crate::types::PeerId;

type Event = TransportEvent<MemoryChannel>;
type EventTx = mpsc::UnboundedSender<Event>;
type EndpointId = u64;

const ENDPOINT_ATTR: &str = "a=endpoint:";

fn endpoint_name(id: EndpointId) -> String {
    format!("mem-{}", id)
}

fn sdp_for(id: EndpointId, with_channel: bool) -> String {
    let mut sdp = format!(
        "v=0\r\no=- {id} 1 IN IP4 127.0.0.1\r\ns=-\r\n{ENDPOINT_ATTR}{}\r\n",
        endpoint_name(id)
    );
    if with_channel {
        sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
    }
    sdp
}

fn parse_endpoint(sdp: &str) -> Option<EndpointId> {
    sdp.lines()
        .find_map(|line| line.strip_prefix(ENDPOINT_ATTR))
        .and_then(|name| name.trim().strip_prefix("mem-"))
        .and_then(|id| id.parse().ok())
}

fn candidate_for(id: EndpointId) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:1 1 udp 2130706431 {}.local 9 typ host",
        endpoint_name(id)
    ))
}

fn candidate_endpoint(candidate: &IceCandidate) -> Option<EndpointId> {
    candidate
        .candidate
        .split_whitespace()
        .nth(4)
        .and_then(|addr| addr.strip_suffix(".local"))
        .and_then(|name| name.strip_prefix("mem-"))
        .and_then(|id| id.parse().ok())
}

struct ChannelEnd {
    label: String,
    /// Shared by both ends of one channel
    open: Arc<AtomicBool>,
    local: OnceLock<EventTx>,
    remote: OnceLock<EventTx>,
}

#[derive(Clone)]
pub struct MemoryChannel {
    end: Arc<ChannelEnd>,
}

impl MemoryChannel {
    fn new(label: &str, open: Arc<AtomicBool>) -> Self {
        Self {
            end: Arc::new(ChannelEnd {
                label: label.to_string(),
                open,
                local: OnceLock::new(),
                remote: OnceLock::new(),
            }),
        }
    }

    fn wire(&self, local: EventTx, remote: EventTx) {
        let _ = self.end.local.set(local);
        let _ = self.end.remote.set(remote);
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("label", &self.end.label)
            .field("open", &self.end.open.load(Ordering::Relaxed))
            .finish()
    }
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.end.label
    }

    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.end.open.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed);
        }
        let remote = self.end.remote.get().ok_or(TransportError::ChannelClosed)?;
        remote
            .send(TransportEvent::ChannelMessage(text.to_string()))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&self) {
        if self.end.open.swap(false, Ordering::AcqRel) {
            for tx in [self.end.local.get(), self.end.remote.get()].into_iter().flatten() {
                let _ = tx.send(TransportEvent::ChannelClosed);
            }
        }
    }
}

struct Endpoint {
    local_peer: PeerId,
    remote_peer: PeerId,
    events: EventTx,
    local_description: Option<SessionDescription>,
    remote_endpoint: Option<EndpointId>,
    remote_candidate: bool,
    /// Every candidate handed to the transport, accepted or not
    candidates_received: usize,
    channel: Option<MemoryChannel>,
    linked_to: Option<EndpointId>,
    failed: bool,
}

#[derive(Default)]
struct NetInner {
    endpoints: Mutex<HashMap<EndpointId, Endpoint>>,
    next_id: AtomicU64,
}

impl NetInner {
    fn endpoints(&self) -> MutexGuard<'_, HashMap<EndpointId, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process network shared by every participant of a test or demo
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport factory for the participant `local`
    pub fn factory(&self, local: PeerId) -> MemoryTransportFactory {
        MemoryTransportFactory {
            net: self.inner.clone(),
            local,
        }
    }

    /// Number of live transports
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints().len()
    }

    /// Whether `local` holds a live transport linked to `remote`
    pub fn is_linked(&self, local: PeerId, remote: PeerId) -> bool {
        let endpoints = self.inner.endpoints();
        find(&endpoints, local, remote)
            .and_then(|id| endpoints.get(&id))
            .is_some_and(|ep| ep.linked_to.is_some())
    }

    /// How many remote candidates `local`'s transport to `remote` was given
    pub fn candidates_received(&self, local: PeerId, remote: PeerId) -> Option<usize> {
        let endpoints = self.inner.endpoints();
        find(&endpoints, local, remote)
            .and_then(|id| endpoints.get(&id))
            .map(|ep| ep.candidates_received)
    }

    /// Make `local`'s transport to `remote` fail, as a transport timeout would
    pub fn fail(&self, local: PeerId, remote: PeerId) -> bool {
        let mut endpoints = self.inner.endpoints();
        let Some(id) = find(&endpoints, local, remote) else {
            return false;
        };
        let linked_to = endpoints.get_mut(&id).and_then(|ep| {
            ep.failed = true;
            let _ = ep
                .events
                .send(TransportEvent::StateChanged(TransportState::Failed));
            if let Some(channel) = &ep.channel {
                channel.close();
            }
            ep.linked_to.take()
        });
        if let Some(remote_ep) = linked_to.and_then(|rid| endpoints.get_mut(&rid)) {
            remote_ep.linked_to = None;
            let _ = remote_ep
                .events
                .send(TransportEvent::StateChanged(TransportState::Disconnected));
        }
        true
    }

    /// Deliver raw text on `local`'s data channel to `remote`, as if sent by
    /// the remote side
    pub fn inject(&self, local: PeerId, remote: PeerId, text: &str) -> bool {
        let endpoints = self.inner.endpoints();
        find(&endpoints, local, remote)
            .and_then(|id| endpoints.get(&id))
            .is_some_and(|ep| {
                ep.events
                    .send(TransportEvent::ChannelMessage(text.to_string()))
                    .is_ok()
            })
    }
}

fn find(
    endpoints: &HashMap<EndpointId, Endpoint>,
    local: PeerId,
    remote: PeerId,
) -> Option<EndpointId> {
    endpoints
        .iter()
        .find(|(_, ep)| ep.local_peer == local && ep.remote_peer == remote && !ep.failed)
        .map(|(id, _)| *id)
}

/// The remote endpoint `id` is ready to link with, if any
fn ready_peer(endpoints: &HashMap<EndpointId, Endpoint>, id: EndpointId) -> Option<EndpointId> {
    let ep = endpoints.get(&id)?;
    if ep.failed || ep.linked_to.is_some() || ep.local_description.is_none() || !ep.remote_candidate
    {
        return None;
    }
    ep.remote_endpoint
}

fn try_link(endpoints: &mut HashMap<EndpointId, Endpoint>, id: EndpointId) {
    let Some(rid) = ready_peer(endpoints, id) else {
        return;
    };
    if ready_peer(endpoints, rid) != Some(id) {
        return;
    }

    let Some((a_events, a_channel)) = endpoints.get_mut(&id).map(|a| {
        a.linked_to = Some(rid);
        (a.events.clone(), a.channel.clone())
    }) else {
        return;
    };
    let Some((b_events, b_channel)) = endpoints.get_mut(&rid).map(|b| {
        b.linked_to = Some(id);
        (b.events.clone(), b.channel.clone())
    }) else {
        return;
    };

    debug!("Linked {} <-> {}", endpoint_name(id), endpoint_name(rid));
    let _ = a_events.send(TransportEvent::StateChanged(TransportState::Connected));
    let _ = b_events.send(TransportEvent::StateChanged(TransportState::Connected));

    let (offered, offerer_events, answerer, answerer_events) = match (a_channel, b_channel) {
        (Some(offered), None) => (offered, a_events, rid, b_events),
        (None, Some(offered)) => (offered, b_events, id, a_events),
        _ => return,
    };

    offered.wire(offerer_events.clone(), answerer_events.clone());
    let accepted = MemoryChannel::new(&offered.end.label, offered.end.open.clone());
    accepted.wire(answerer_events.clone(), offerer_events.clone());
    if let Some(ep) = endpoints.get_mut(&answerer) {
        ep.channel = Some(accepted.clone());
    }
    offered.end.open.store(true, Ordering::Release);

    let _ = answerer_events.send(TransportEvent::DataChannel(accepted));
    let _ = answerer_events.send(TransportEvent::ChannelOpen);
    let _ = offerer_events.send(TransportEvent::ChannelOpen);
}

pub struct MemoryTransportFactory {
    net: Arc<NetInner>,
    local: PeerId,
}

impl TransportFactory for MemoryTransportFactory {
    type Transport = MemoryTransport;

    fn create(
        &self,
        remote: PeerId,
    ) -> Result<(MemoryTransport, TransportEvents<MemoryChannel>), TransportError> {
        let id = self.net.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.net.endpoints().insert(
            id,
            Endpoint {
                local_peer: self.local,
                remote_peer: remote,
                events: tx,
                local_description: None,
                remote_endpoint: None,
                remote_candidate: false,
                candidates_received: 0,
                channel: None,
                linked_to: None,
                failed: false,
            },
        );

        debug!("Endpoint {} created for {} -> {}", endpoint_name(id), self.local, remote);
        Ok((
            MemoryTransport {
                net: self.net.clone(),
                id,
            },
            rx,
        ))
    }
}

pub struct MemoryTransport {
    net: Arc<NetInner>,
    id: EndpointId,
}

impl MemoryTransport {
    fn with_endpoint<R>(
        &self,
        f: impl FnOnce(&mut HashMap<EndpointId, Endpoint>, &mut Endpoint) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut endpoints = self.net.endpoints();
        let mut ep = endpoints.remove(&self.id).ok_or(TransportError::Closed)?;
        if ep.failed {
            endpoints.insert(self.id, ep);
            return Err(TransportError::Closed);
        }
        let result = f(&mut endpoints, &mut ep);
        endpoints.insert(self.id, ep);
        if result.is_ok() {
            try_link(&mut endpoints, self.id);
        }
        result
    }

    fn shutdown(&self) {
        let mut endpoints = self.net.endpoints();
        let Some(ep) = endpoints.remove(&self.id) else {
            return;
        };
        if let Some(channel) = &ep.channel {
            channel.close();
        }
        if let Some(remote) = ep.linked_to.and_then(|rid| endpoints.get_mut(&rid)) {
            remote.linked_to = None;
            let _ = remote
                .events
                .send(TransportEvent::StateChanged(TransportState::Disconnected));
        }
        debug!("Endpoint {} closed", endpoint_name(self.id));
    }
}

impl PeerTransport for MemoryTransport {
    type Channel = MemoryChannel;

    async fn create_data_channel(&self, label: &str) -> Result<MemoryChannel, TransportError> {
        self.with_endpoint(|_, ep| {
            if ep.channel.is_some() {
                return Err(TransportError::InvalidState("data channel already created"));
            }
            let channel = MemoryChannel::new(label, Arc::new(AtomicBool::new(false)));
            ep.channel = Some(channel.clone());
            Ok(channel)
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let id = self.id;
        self.with_endpoint(|_, ep| Ok(SessionDescription::offer(sdp_for(id, ep.channel.is_some()))))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let id = self.id;
        self.with_endpoint(|_, ep| {
            if ep.remote_endpoint.is_none() {
                return Err(TransportError::InvalidState("no remote offer"));
            }
            Ok(SessionDescription::answer(sdp_for(id, true)))
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let id = self.id;
        self.with_endpoint(|_, ep| {
            if ep.local_description.is_some() {
                return Err(TransportError::InvalidState("local description already set"));
            }
            ep.local_description = Some(description);
            let _ = ep.events.send(TransportEvent::IceCandidate(candidate_for(id)));
            let _ = ep.events.send(TransportEvent::GatheringComplete);
            Ok(())
        })
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let rid = parse_endpoint(&description.sdp).ok_or_else(|| {
            TransportError::InvalidDescription("missing endpoint attribute".to_string())
        })?;
        self.with_endpoint(|endpoints, ep| {
            if !endpoints.contains_key(&rid) {
                return Err(TransportError::InvalidDescription(format!(
                    "unknown endpoint {}",
                    endpoint_name(rid)
                )));
            }
            ep.remote_endpoint = Some(rid);
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.with_endpoint(|_, ep| {
            ep.candidates_received += 1;
            let Some(rid) = ep.remote_endpoint else {
                return Err(TransportError::InvalidState("remote description not set"));
            };
            if candidate_endpoint(&candidate) == Some(rid) {
                ep.remote_candidate = true;
            }
            Ok(())
        })
    }

    async fn close(&self) {
        self.shutdown();
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn gather(events: &mut TransportEvents<MemoryChannel>) -> Vec<IceCandidate> {
        let mut candidates = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::IceCandidate(c) => candidates.push(c),
                TransportEvent::GatheringComplete => break,
                other => panic!("unexpected event {:?}", other),
            }
        }
        candidates
    }

    fn ids() -> (PeerId, PeerId) {
        (
            PeerId::try_from("peer_a").unwrap(),
            PeerId::try_from("peer_b").unwrap(),
        )
    }

    #[tokio::test]
    async fn offer_answer_links_endpoints_and_opens_channel() {
        let net = MemoryNetwork::new();
        let (a, b) = ids();
        let (ta, mut ea) = net.factory(a).create(b).unwrap();
        let (tb, mut eb) = net.factory(b).create(a).unwrap();

        let channel = ta.create_data_channel("location").await.unwrap();
        let offer = ta.create_offer().await.unwrap();
        ta.set_local_description(offer.clone()).await.unwrap();
        let offer_candidates = gather(&mut ea).await;
        assert_eq!(offer_candidates.len(), 1);

        tb.set_remote_description(offer).await.unwrap();
        for c in offer_candidates {
            tb.add_ice_candidate(c).await.unwrap();
        }
        let answer = tb.create_answer().await.unwrap();
        tb.set_local_description(answer.clone()).await.unwrap();
        let answer_candidates = gather(&mut eb).await;

        ta.set_remote_description(answer).await.unwrap();
        for c in answer_candidates {
            ta.add_ice_candidate(c).await.unwrap();
        }

        assert!(matches!(
            ea.recv().await,
            Some(TransportEvent::StateChanged(TransportState::Connected))
        ));
        assert!(matches!(ea.recv().await, Some(TransportEvent::ChannelOpen)));
        assert!(matches!(
            eb.recv().await,
            Some(TransportEvent::StateChanged(TransportState::Connected))
        ));
        let Some(TransportEvent::DataChannel(remote_channel)) = eb.recv().await else {
            panic!("expected remote data channel");
        };
        assert_eq!(remote_channel.label(), "location");
        assert!(matches!(eb.recv().await, Some(TransportEvent::ChannelOpen)));
        assert!(net.is_linked(a, b));

        channel.send_text("ping").unwrap();
        assert!(matches!(
            eb.recv().await,
            Some(TransportEvent::ChannelMessage(text)) if text == "ping"
        ));
        remote_channel.send_text("pong").unwrap();
        assert!(matches!(
            ea.recv().await,
            Some(TransportEvent::ChannelMessage(text)) if text == "pong"
        ));

        tb.close().await;
        assert!(matches!(ea.recv().await, Some(TransportEvent::ChannelClosed)));
        assert!(matches!(
            ea.recv().await,
            Some(TransportEvent::StateChanged(TransportState::Disconnected))
        ));
        assert!(channel.send_text("late").is_err());
    }

    #[tokio::test]
    async fn answer_requires_remote_offer() {
        let net = MemoryNetwork::new();
        let (a, b) = ids();
        let (t, _events) = net.factory(a).create(b).unwrap();
        assert!(matches!(
            t.create_answer().await,
            Err(TransportError::InvalidState(_))
        ));
        assert!(matches!(
            t.add_ice_candidate(IceCandidate::new("candidate:x")).await,
            Err(TransportError::InvalidState(_))
        ));
        assert_eq!(net.candidates_received(a, b), Some(1));
    }

    #[tokio::test]
    async fn malformed_description_is_rejected() {
        let net = MemoryNetwork::new();
        let (a, b) = ids();
        let (t, _events) = net.factory(a).create(b).unwrap();
        let result = t
            .set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await;
        assert!(matches!(result, Err(TransportError::InvalidDescription(_))));
    }

    #[tokio::test]
    async fn dropping_transport_frees_endpoint() {
        let net = MemoryNetwork::new();
        let (a, b) = ids();
        let (t, _events) = net.factory(a).create(b).unwrap();
        assert_eq!(net.endpoint_count(), 1);
        drop(t);
        assert_eq!(net.endpoint_count(), 0);
    }

    #[test]
    fn sdp_and_candidate_carry_endpoint() {
        assert_eq!(parse_endpoint(&sdp_for(7, true)), Some(7));
        assert_eq!(candidate_endpoint(&candidate_for(7)), Some(7));
        assert_eq!(parse_endpoint("v=0\r\n"), None);
    }
}
