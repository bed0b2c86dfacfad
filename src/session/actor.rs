use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::arena::{PeerArena, PeerSlot};
use super::types::{LocationMap, RiderInfo, RosterSnapshot};
use crate::peer::{ConnectionId, PeerEvent, PeerEventKind, PeerHandle};
use crate::protocol::{
    LocationMessage, LocationSample, Negotiation, RiderLocation, Signal, SignalingMessage,
};
use crate::signaling::{SignalingClient, TopicLink};
use crate::transport::TransportFactory;
use crate::types::{GroupIdentity, PeerId, Role};

/// Commands sent to the session actor
pub(crate) enum SessionCommand {
    SendLocation {
        sample: LocationSample,
        reply: oneshot::Sender<usize>,
    },
    PeerCount {
        reply: oneshot::Sender<usize>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct SessionActor<L, T> {
    pub identity: GroupIdentity,
    pub leader_nickname: String,
    pub signaling: SignalingClient<L>,
    pub factory: T,
    pub peers: PeerArena,
    pub roster: BTreeMap<PeerId, RiderInfo>,
    pub locations: LocationMap,
    pub roster_tx: watch::Sender<RosterSnapshot>,
    pub locations_tx: watch::Sender<LocationMap>,
    pub peer_tx: mpsc::UnboundedSender<PeerEvent>,
}

impl<L: TopicLink, T: TransportFactory> SessionActor<L, T> {
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::SendLocation { sample, reply }) => {
                        let _ = reply.send(self.send_location(sample));
                    }
                    Some(SessionCommand::PeerCount { reply }) => {
                        let _ = reply.send(self.peers.len());
                    }
                    Some(SessionCommand::Disconnect { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                Some(msg) = inbound.recv() => self.handle_signal(msg),
                Some(event) = peer_events.recv() => self.handle_peer_event(event),
            }
        }
        debug!("Session actor for {} stopped", self.identity.peer_id);
    }

    fn role(&self) -> Role {
        self.identity.role
    }

    fn handle_signal(&mut self, msg: SignalingMessage) {
        let from = msg.from_peer_id;
        debug!("Received {} from {}", msg.signal.kind(), from);

        match (self.role(), msg.signal) {
            (Role::Leader, Signal::Join { nickname }) => {
                info!("{} ({}) joined", nickname, from);
                let Some(handle) = self.open_peer(from, nickname) else {
                    return;
                };
                let signaling = self.signaling.clone();
                tokio::spawn(async move {
                    match handle.create_offer().await {
                        Ok(offer) => signaling.send_offer(from, offer).await,
                        Err(e) => warn!("Offer to {} failed: {}", from, e),
                    }
                });
            }

            (Role::Rider, Signal::Offer(offer)) => {
                let nickname = self.leader_nickname.clone();
                let Some(handle) = self.open_peer(from, nickname) else {
                    return;
                };
                let signaling = self.signaling.clone();
                tokio::spawn(answer_offer(handle, signaling, from, offer));
            }

            (Role::Leader, Signal::Answer(answer)) => {
                let Some(slot) = self.peers.get(&from) else {
                    debug!("Answer from unknown peer {}", from);
                    return;
                };
                let handle = slot.handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.handle_answer(answer).await {
                        warn!("Answer from {} rejected: {}", from, e);
                    }
                });
            }

            (_, Signal::Ice { candidate }) => match self.peers.get(&from) {
                Some(slot) => slot.handle.add_ice_candidate(candidate),
                None => debug!("Candidate from unknown peer {}", from),
            },

            (_, Signal::Leave { reason }) => {
                info!(
                    "{} left ({})",
                    from,
                    reason.as_deref().unwrap_or("no reason")
                );
                if let Some(slot) = self.peers.remove(&from) {
                    close_in_background(slot.handle);
                }
                self.forget(&from);
            }

            (role, signal) => debug!("Ignoring {} as {}", signal.kind(), role),
        }
    }

    /// Create the connection record for `remote`, replacing any older one
    fn open_peer(&mut self, remote: PeerId, nickname: String) -> Option<PeerHandle> {
        let (transport, events) = match self.factory.create(remote) {
            Ok(created) => created,
            Err(e) => {
                warn!("Failed to create transport for {}: {}", remote, e);
                return None;
            }
        };

        let conn = self.peers.next_connection_id();
        let handle = PeerHandle::spawn(remote, conn, transport, events, self.peer_tx.clone());
        let slot = PeerSlot {
            handle: handle.clone(),
            nickname,
        };

        if let Some(old) = self.peers.insert(remote, slot) {
            info!("Replacing connection {} to {}", old.conn(), remote);
            close_in_background(old.handle);
            if self.roster.remove(&remote).is_some() {
                self.publish_roster();
            }
        }
        Some(handle)
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent { peer, conn, kind } = event;

        match kind {
            PeerEventKind::Connected => {
                let Some(slot) = self.peers.get(&peer).filter(|s| s.conn() == conn) else {
                    return;
                };
                let info = RiderInfo {
                    nickname: slot.nickname.clone(),
                    is_leader: self.role() == Role::Rider,
                    is_connected: true,
                };
                info!("Peer {} ({}) connected", info.nickname, peer);
                self.roster.insert(peer, info);
                self.publish_roster();
            }

            PeerEventKind::Disconnected(state) => {
                let Some(slot) = self.peers.remove_current(&peer, conn) else {
                    debug!("Ignoring stale disconnect of {} ({})", peer, conn);
                    return;
                };
                info!("Peer {} disconnected ({})", peer, state);
                close_in_background(slot.handle);
                self.forget(&peer);
            }

            PeerEventKind::Location(location) => self.relay(peer, conn, location),

            PeerEventKind::IceCandidate(candidate) => {
                debug!("Gathered candidate for {}: {}", peer, candidate.candidate);
            }
        }
    }

    /// Record an inbound location and apply the relay policy
    fn relay(&mut self, source: PeerId, conn: ConnectionId, location: LocationMessage) {
        if !self.peers.is_current(&source, conn) {
            debug!("Dropping location from stale connection to {}", source);
            return;
        }

        let tagged = location.id;
        self.locations.insert(tagged, RiderLocation::from(&location));
        self.locations_tx.send_replace(self.locations.clone());

        match self.role() {
            Role::Leader => {
                let forwarded = self
                    .peers
                    .iter()
                    .filter(|(peer, _)| **peer != source)
                    .filter(|(_, slot)| slot.handle.send_location(&location))
                    .count();
                if forwarded > 0 {
                    debug!("Relayed location of {} to {} peers", tagged, forwarded);
                }
            }
            Role::Rider => {
                if tagged != source && !self.roster.contains_key(&tagged) {
                    info!("Learned {} ({}) via relay", location.nickname, tagged);
                    self.roster.insert(
                        tagged,
                        RiderInfo {
                            nickname: location.nickname,
                            is_leader: false,
                            is_connected: true,
                        },
                    );
                    self.publish_roster();
                }
            }
        }
    }

    fn send_location(&self, sample: LocationSample) -> usize {
        let msg = LocationMessage {
            id: self.identity.peer_id,
            nickname: self.identity.nickname.clone(),
            lat: sample.lat,
            lng: sample.lng,
            heading: sample.heading,
            speed: sample.speed,
            ts: sample.timestamp,
        };
        self.peers
            .iter()
            .filter(|(_, slot)| slot.handle.send_location(&msg))
            .count()
    }

    /// Drop roster and location state held for a departed peer
    fn forget(&mut self, peer: &PeerId) {
        // published even without an entry: connectivity may have changed
        self.roster.remove(peer);
        self.publish_roster();
        if self.locations.remove(peer).is_some() {
            self.locations_tx.send_replace(self.locations.clone());
        }
    }

    fn publish_roster(&self) {
        self.roster_tx.send_replace(RosterSnapshot {
            riders: self.roster.clone(),
            connected: self.peers.any_connected(),
        });
    }

    async fn teardown(&mut self) {
        info!("Leaving group {}", self.identity.invite_code);

        for (peer, slot) in self.peers.drain() {
            debug!("Closing connection to {}", peer);
            slot.handle.close().await;
        }
        self.roster.clear();
        self.locations.clear();
        self.publish_roster();
        self.locations_tx.send_replace(LocationMap::new());

        self.signaling.disconnect().await;
    }
}

async fn answer_offer<L: TopicLink>(
    handle: PeerHandle,
    signaling: SignalingClient<L>,
    from: PeerId,
    offer: Negotiation,
) {
    match handle.handle_offer(offer).await {
        Ok(answer) => signaling.send_answer(from, answer).await,
        Err(e) => warn!("Answer to {} failed: {}", from, e),
    }
}

fn close_in_background(handle: PeerHandle) {
    tokio::spawn(async move { handle.close().await });
}
