use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::state::{ChannelState, ConnectionState, PeerStatus};
use super::types::{ConnectionId, PeerError, PeerEvent, PeerEventKind};
use crate::protocol::{
    ChannelMessage, DATA_CHANNEL_LABEL, IceCandidate, LocationMessage, Negotiation,
    SessionDescription,
};
use crate::transport::{DataChannel, PeerTransport, TransportEvent, TransportEvents};
use crate::types::PeerId;

type NegotiationReply = oneshot::Sender<Result<Negotiation, PeerError>>;
type SharedChannel = Option<Arc<dyn DataChannel>>;

/// Commands sent to a peer connection actor
pub(crate) enum PeerCommand {
    CreateOffer {
        reply: NegotiationReply,
    },
    HandleOffer {
        offer: Negotiation,
        reply: NegotiationReply,
    },
    HandleAnswer {
        answer: Negotiation,
        reply: oneshot::Sender<Result<(), PeerError>>,
    },
    AddIceCandidate {
        candidate: IceCandidate,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Local description waiting for candidate gathering to finish
struct PendingLocal {
    description: SessionDescription,
    reply: NegotiationReply,
    then: ConnectionState,
}

struct PeerActor<T: PeerTransport> {
    remote: PeerId,
    conn: ConnectionId,
    transport: T,
    channel: Option<Arc<T::Channel>>,
    state: ConnectionState,
    channel_state: ChannelState,
    has_remote_description: bool,
    offer_sent: bool,
    candidates: Vec<IceCandidate>,
    gathering_complete: bool,
    pending_local: Option<PendingLocal>,
    status_tx: watch::Sender<PeerStatus>,
    channel_tx: watch::Sender<SharedChannel>,
    notify: mpsc::UnboundedSender<PeerEvent>,
}

impl<T: PeerTransport> PeerActor<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        mut events: TransportEvents<T::Channel>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        self.close().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        debug!("Peer actor for {} ({}) stopped", self.remote, self.conn);
    }

    /// Returns false once the connection is closed
    async fn handle_command(&mut self, cmd: PeerCommand) -> bool {
        match cmd {
            PeerCommand::CreateOffer { reply } => {
                if self.state != ConnectionState::New {
                    let _ = reply.send(Err(self.out_of_order("create_offer")));
                    return true;
                }
                self.set_state(ConnectionState::LocalOfferPending);
                match self.start_offer().await {
                    Ok(description) => {
                        self.await_gathering(description, reply, ConnectionState::LocalOfferPending)
                    }
                    Err(e) => {
                        self.fail_negotiation("create_offer", &e);
                        let _ = reply.send(Err(e));
                    }
                }
            }

            PeerCommand::HandleOffer { offer, reply } => {
                if self.state != ConnectionState::New {
                    let _ = reply.send(Err(self.out_of_order("handle_offer")));
                    return true;
                }
                self.set_state(ConnectionState::RemoteOfferReceived);
                match self.accept_offer(offer).await {
                    Ok(description) => {
                        self.await_gathering(description, reply, ConnectionState::Connecting)
                    }
                    Err(e) => {
                        self.fail_negotiation("handle_offer", &e);
                        let _ = reply.send(Err(e));
                    }
                }
            }

            PeerCommand::HandleAnswer { answer, reply } => {
                if self.state != ConnectionState::LocalOfferPending || !self.offer_sent {
                    let _ = reply.send(Err(self.out_of_order("handle_answer")));
                    return true;
                }
                match self.apply_remote(answer).await {
                    Ok(()) => {
                        self.set_state(ConnectionState::Connecting);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        self.fail_negotiation("handle_answer", &e);
                        let _ = reply.send(Err(e));
                    }
                }
            }

            PeerCommand::AddIceCandidate { candidate } => {
                if !self.has_remote_description || self.state.is_terminal() {
                    debug!("Dropping candidate from {}: no remote description", self.remote);
                    return true;
                }
                if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                    warn!("Failed to add candidate from {}: {}", self.remote, e);
                }
            }

            PeerCommand::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn start_offer(&mut self) -> Result<SessionDescription, PeerError> {
        let channel = self.transport.create_data_channel(DATA_CHANNEL_LABEL).await?;
        self.channel = Some(Arc::new(channel));

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn accept_offer(&mut self, offer: Negotiation) -> Result<SessionDescription, PeerError> {
        self.apply_remote(offer).await?;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn apply_remote(&mut self, remote: Negotiation) -> Result<(), PeerError> {
        self.transport
            .set_remote_description(remote.description)
            .await?;
        self.has_remote_description = true;

        for candidate in remote.candidates {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Reply with the description once gathering is done. Candidates are
    /// never trickled: the whole batch goes out with the description.
    fn await_gathering(
        &mut self,
        description: SessionDescription,
        reply: NegotiationReply,
        then: ConnectionState,
    ) {
        let pending = PendingLocal {
            description,
            reply,
            then,
        };
        if self.gathering_complete {
            self.resolve_local(pending);
        } else {
            self.pending_local = Some(pending);
        }
    }

    fn resolve_local(&mut self, pending: PendingLocal) {
        let negotiation = Negotiation {
            description: pending.description,
            candidates: self.candidates.clone(),
        };
        debug!(
            "Local {:?} for {} ready with {} candidates",
            negotiation.description.kind,
            self.remote,
            negotiation.candidates.len()
        );

        if pending.then == ConnectionState::LocalOfferPending {
            self.offer_sent = true;
        }
        if matches!(
            self.state,
            ConnectionState::LocalOfferPending | ConnectionState::RemoteOfferReceived
        ) {
            self.set_state(pending.then);
        }
        let _ = pending.reply.send(Ok(negotiation));
    }

    fn handle_event(&mut self, event: TransportEvent<T::Channel>) {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                if self.gathering_complete {
                    debug!("Late candidate for {} will not be signaled", self.remote);
                }
                self.candidates.push(candidate.clone());
                self.emit(PeerEventKind::IceCandidate(candidate));
            }

            TransportEvent::GatheringComplete => {
                debug!("ICE gathering complete for {}", self.remote);
                self.gathering_complete = true;
                if let Some(pending) = self.pending_local.take() {
                    self.resolve_local(pending);
                }
            }

            TransportEvent::StateChanged(reported) => {
                debug!("Transport to {} reports {}", self.remote, reported);
                if let Some(next) = self.state.on_transport(reported) {
                    self.set_state(next);
                }
            }

            TransportEvent::DataChannel(channel) => {
                info!("Received data channel from {}", self.remote);
                self.channel = Some(Arc::new(channel));
            }

            TransportEvent::ChannelOpen => {
                let Some(channel) = self.channel.clone() else {
                    warn!("Open reported without a data channel for {}", self.remote);
                    return;
                };
                if self.state.is_terminal() {
                    return;
                }
                info!("Data channel open with {}", self.remote);
                let shared: Arc<dyn DataChannel> = channel;
                self.channel_tx.send_replace(Some(shared));
                self.channel_state = ChannelState::Open;
                self.publish_status();
            }

            TransportEvent::ChannelClosed => {
                if self.channel_state == ChannelState::Open {
                    info!("Data channel closed with {}", self.remote);
                }
                self.close_channel_state();
            }

            TransportEvent::ChannelMessage(text) => match parse_channel_message(&text) {
                Ok(ChannelMessage::Location(location)) => {
                    self.emit(PeerEventKind::Location(location));
                }
                Err(e) => warn!("Dropping message from {}: {}", self.remote, e),
            },
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next || self.state.is_terminal() {
            return;
        }
        debug!("Peer {} {} -> {}", self.remote, self.state, next);
        self.state = next;

        if next.is_terminal() {
            if let Some(pending) = self.pending_local.take() {
                let _ = pending.reply.send(Err(PeerError::Closed));
            }
            self.close_channel_state();
        } else {
            self.publish_status();
        }

        match next {
            ConnectionState::Connected => {
                info!("Connected to {}", self.remote);
                self.emit(PeerEventKind::Connected);
            }
            state if state.is_terminal() => {
                info!("Disconnected from {} ({})", self.remote, state);
                self.emit(PeerEventKind::Disconnected(state));
            }
            _ => {}
        }
    }

    fn close_channel_state(&mut self) {
        self.channel_tx.send_replace(None);
        self.channel_state = ChannelState::Closed;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(PeerStatus {
            connection: self.state,
            channel: self.channel_state,
        });
    }

    fn out_of_order(&self, op: &'static str) -> PeerError {
        PeerError::NegotiationState {
            op,
            state: self.state,
        }
    }

    fn fail_negotiation(&mut self, op: &str, e: &PeerError) {
        warn!("{} with {} failed: {}", op, self.remote, e);
        self.set_state(ConnectionState::Failed);
    }

    fn emit(&self, kind: PeerEventKind) {
        let _ = self.notify.send(PeerEvent {
            peer: self.remote,
            conn: self.conn,
            kind,
        });
    }

    /// Close the data channel, then the transport
    async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.transport.close().await;

        if self.state.is_terminal() {
            self.state = ConnectionState::Closed;
            self.close_channel_state();
        } else {
            self.set_state(ConnectionState::Closed);
        }
    }
}

fn parse_channel_message(text: &str) -> Result<ChannelMessage, PeerError> {
    Ok(serde_json::from_str(text)?)
}

/// Handle to one remote peer's connection actor
#[derive(Clone)]
pub struct PeerHandle {
    remote: PeerId,
    conn: ConnectionId,
    tx: mpsc::UnboundedSender<PeerCommand>,
    status: watch::Receiver<PeerStatus>,
    channel: watch::Receiver<SharedChannel>,
}

impl PeerHandle {
    /// Start the connection actor for `remote` over a fresh transport
    pub fn spawn<T: PeerTransport>(
        remote: PeerId,
        conn: ConnectionId,
        transport: T,
        events: TransportEvents<T::Channel>,
        notify: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PeerStatus::default());
        let (channel_tx, channel) = watch::channel(None);

        let actor = PeerActor {
            remote,
            conn,
            transport,
            channel: None,
            state: ConnectionState::New,
            channel_state: ChannelState::Closed,
            has_remote_description: false,
            offer_sent: false,
            candidates: Vec::new(),
            gathering_complete: false,
            pending_local: None,
            status_tx,
            channel_tx,
            notify,
        };
        tokio::spawn(actor.run(rx, events));

        Self {
            remote,
            conn,
            tx,
            status,
            channel,
        }
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().connection == ConnectionState::Connected
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel.borrow().is_some()
    }

    /// Wait until the status satisfies `f`, or the actor has stopped
    pub async fn wait_until(&self, mut f: impl FnMut(&PeerStatus) -> bool) -> PeerStatus {
        let mut status = self.status.clone();
        let reached = status.wait_for(|s| f(s)).await.map(|s| *s);
        reached.unwrap_or_else(|_| *status.borrow())
    }

    /// Initiator: open the data channel and produce the offer with its full
    /// candidate batch
    pub async fn create_offer(&self) -> Result<Negotiation, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.request(PeerCommand::CreateOffer { reply })?;
        rx.await.map_err(|_| PeerError::Closed)?
    }

    /// Responder: apply the offer and produce the answer with its full
    /// candidate batch
    pub async fn handle_offer(&self, offer: Negotiation) -> Result<Negotiation, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.request(PeerCommand::HandleOffer { offer, reply })?;
        rx.await.map_err(|_| PeerError::Closed)?
    }

    pub async fn handle_answer(&self, answer: Negotiation) -> Result<(), PeerError> {
        let (reply, rx) = oneshot::channel();
        self.request(PeerCommand::HandleAnswer { answer, reply })?;
        rx.await.map_err(|_| PeerError::Closed)?
    }

    /// Applied only once a remote description is set, dropped otherwise
    pub fn add_ice_candidate(&self, candidate: IceCandidate) {
        let _ = self.request(PeerCommand::AddIceCandidate { candidate });
    }

    /// Transmit a location if the data channel is open. Never fails loudly.
    pub fn send_location(&self, location: &LocationMessage) -> bool {
        let channel = self.channel.borrow().clone();
        let Some(channel) = channel else {
            return false;
        };

        let msg = ChannelMessage::Location(location.clone());
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode location for {}: {}", self.remote, e);
                return false;
            }
        };

        match channel.send_text(&text) {
            Ok(()) => true,
            Err(e) => {
                debug!("Send to {} failed: {}", self.remote, e);
                false
            }
        }
    }

    /// Close from any state; later calls do nothing
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request(PeerCommand::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn request(&self, cmd: PeerCommand) -> Result<(), PeerError> {
        self.tx.send(cmd).map_err(|_| PeerError::Closed)
    }
}
