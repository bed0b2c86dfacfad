use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::actor::{SessionActor, SessionCommand};
use super::arena::PeerArena;
use super::types::{DEFAULT_LEADER_NICKNAME, LocationMap, RosterSnapshot, SessionError};
use crate::protocol::LocationSample;
use crate::signaling::{Fabric, SignalingClient};
use crate::transport::TransportFactory;
use crate::types::{GroupIdentity, InviteCode, PeerId, Role};

/// Options for starting a session
pub struct SessionBuilder {
    identity: GroupIdentity,
    leader_nickname: String,
}

impl SessionBuilder {
    pub fn new(identity: GroupIdentity) -> Self {
        Self {
            identity,
            leader_nickname: DEFAULT_LEADER_NICKNAME.to_string(),
        }
    }

    /// Nickname a rider shows for the leader, normally from the group lookup
    pub fn leader_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.leader_nickname = nickname.into();
        self
    }

    /// Connect signaling and start coordinating. Riders announce themselves
    /// with `join`; the leader waits for joins.
    pub async fn start<F, T>(self, fabric: &F, factory: T) -> Result<SessionHandle, SessionError>
    where
        F: Fabric,
        T: TransportFactory,
    {
        let identity = self.identity;
        let (signaling, inbound) =
            SignalingClient::connect(fabric, identity.invite_code, identity.peer_id).await?;

        let (tx, rx) = mpsc::channel(256);
        let (roster_tx, roster) = watch::channel(RosterSnapshot::default());
        let (locations_tx, locations) = watch::channel(LocationMap::new());
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            identity: identity.clone(),
            leader_nickname: self.leader_nickname,
            signaling: signaling.clone(),
            factory,
            peers: PeerArena::default(),
            roster: BTreeMap::new(),
            locations: LocationMap::new(),
            roster_tx,
            locations_tx,
            peer_tx,
        };
        tokio::spawn(actor.run(rx, inbound, peer_rx));

        info!(
            "Session started in {} as {} {} ({})",
            identity.invite_code, identity.role, identity.nickname, identity.peer_id
        );
        if identity.role == Role::Rider {
            signaling.send_join(&identity.nickname).await;
        }

        Ok(SessionHandle {
            tx,
            identity,
            roster,
            locations,
        })
    }
}

/// Handle to a running session; clones share it.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    identity: GroupIdentity,
    roster: watch::Receiver<RosterSnapshot>,
    locations: watch::Receiver<LocationMap>,
}

impl SessionHandle {
    /// Start with default options
    pub async fn start<F, T>(
        identity: GroupIdentity,
        fabric: &F,
        factory: T,
    ) -> Result<Self, SessionError>
    where
        F: Fabric,
        T: TransportFactory,
    {
        SessionBuilder::new(identity).start(fabric, factory).await
    }

    pub fn identity(&self) -> &GroupIdentity {
        &self.identity
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id
    }

    pub fn invite_code(&self) -> InviteCode {
        self.identity.invite_code
    }

    /// Send our position to every directly connected peer with an open
    /// channel, returning how many it reached. Nothing is queued or retried.
    pub async fn send_location(
        &self,
        lat: f64,
        lng: f64,
        heading: Option<f64>,
        speed: Option<f64>,
    ) -> usize {
        let sample = LocationSample {
            heading,
            speed,
            ..LocationSample::new(lat, lng)
        };
        self.send_sample(sample).await
    }

    pub async fn send_sample(&self, sample: LocationSample) -> usize {
        self.request(|reply| SessionCommand::SendLocation { sample, reply })
            .await
            .unwrap_or(0)
    }

    /// Forward every sample from a geolocation source until it ends or the
    /// session closes
    pub fn forward_samples(&self, mut samples: mpsc::Receiver<LocationSample>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(sample) = samples.recv().await {
                if session.tx.is_closed() {
                    break;
                }
                let delivered = session.send_sample(sample).await;
                debug!("Location sample delivered to {} peers", delivered);
            }
        })
    }

    /// Current roster snapshot
    pub fn roster(&self) -> RosterSnapshot {
        self.roster.borrow().clone()
    }

    /// Receiver that sees every new roster snapshot
    pub fn subscribe_roster(&self) -> watch::Receiver<RosterSnapshot> {
        self.roster.clone()
    }

    /// Latest known location per participant
    pub fn locations(&self) -> LocationMap {
        self.locations.borrow().clone()
    }

    pub fn subscribe_locations(&self) -> watch::Receiver<LocationMap> {
        self.locations.clone()
    }

    /// Number of direct peer connections held
    pub async fn peer_count(&self) -> usize {
        self.request(|reply| SessionCommand::PeerCount { reply })
            .await
            .unwrap_or(0)
    }

    /// Whether any direct peer connection is up
    pub fn is_connected(&self) -> bool {
        self.roster.borrow().connected
    }

    /// Close every peer connection, clear all state and leave the group.
    /// Later calls return immediately.
    pub async fn disconnect(&self) {
        if self
            .request(|reply| SessionCommand::Disconnect { reply })
            .await
            .is_err()
        {
            debug!("Session {} already closed", self.identity.peer_id);
        }
    }

    async fn request<R>(
        &self,
        cmd: impl FnOnce(oneshot::Sender<R>) -> SessionCommand,
    ) -> Result<R, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(cmd(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}
