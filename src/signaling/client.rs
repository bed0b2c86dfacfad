use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::fabric::{Fabric, Inbound, TopicLink};
use super::types::SignalingError;
use crate::protocol::{IceCandidate, Negotiation, Signal, SignalingMessage, now_millis};
use crate::types::{InviteCode, PeerId};

struct ClientInner<L> {
    link: L,
    peer_id: PeerId,
    topic: String,
    connected: AtomicBool,
    /// Claimed by the first `disconnect`
    leaving: AtomicBool,
}

/// Signaling channel for one group, as seen by one peer.
///
/// Inbound messages are filtered client-side: only broadcasts and messages
/// addressed to this peer are delivered, never this peer's own.
pub struct SignalingClient<L> {
    inner: Arc<ClientInner<L>>,
}

impl<L> Clone for SignalingClient<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: TopicLink> SignalingClient<L> {
    /// Subscribe to the group's signaling topic
    pub async fn connect<F>(
        fabric: &F,
        invite_code: InviteCode,
        peer_id: PeerId,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingMessage>), SignalingError>
    where
        F: Fabric<Link = L>,
    {
        let topic = invite_code.signaling_topic();
        let (link, raw) = fabric.subscribe(&topic).await?;

        info!("Connected to signaling channel {}", topic);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(filter_inbound(raw, peer_id, tx));

        let client = Self {
            inner: Arc::new(ClientInner {
                link,
                peer_id,
                topic,
                connected: AtomicBool::new(true),
                leaving: AtomicBool::new(false),
            }),
        };
        Ok((client, rx))
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Stamp and publish. Failures are logged, never retried.
    pub async fn send(&self, signal: Signal, to: Option<PeerId>) {
        let kind = signal.kind();
        if let Err(e) = self.publish(signal, to).await {
            warn!("Failed to send {} signal: {}", kind, e);
        }
    }

    async fn publish(&self, signal: Signal, to: Option<PeerId>) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let msg = SignalingMessage {
            signal,
            from_peer_id: self.inner.peer_id,
            to_peer_id: to,
            timestamp: now_millis(),
        };

        match &msg.to_peer_id {
            Some(to) => debug!("Sending {} to {}", msg.signal.kind(), to),
            None => debug!("Sending {} to all", msg.signal.kind()),
        }

        let json = serde_json::to_string(&msg)?;
        self.inner.link.publish(json).await
    }

    pub async fn send_join(&self, nickname: &str) {
        let signal = Signal::Join {
            nickname: nickname.to_string(),
        };
        self.send(signal, None).await;
    }

    pub async fn send_offer(&self, to: PeerId, offer: Negotiation) {
        self.send(Signal::Offer(offer), Some(to)).await;
    }

    pub async fn send_answer(&self, to: PeerId, answer: Negotiation) {
        self.send(Signal::Answer(answer), Some(to)).await;
    }

    pub async fn send_ice(&self, to: PeerId, candidate: IceCandidate) {
        self.send(Signal::Ice { candidate }, Some(to)).await;
    }

    pub async fn send_leave(&self, reason: Option<String>) {
        self.send(Signal::Leave { reason }, None).await;
    }

    /// Announce `leave` and unsubscribe; later calls do nothing.
    pub async fn disconnect(&self) {
        if self.inner.leaving.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Disconnecting from {}", self.inner.topic);
        self.send_leave(Some("disconnected".to_string())).await;

        self.inner.connected.store(false, Ordering::Release);
        self.inner.link.unsubscribe().await;
    }
}

async fn filter_inbound(
    mut raw: Inbound,
    peer_id: PeerId,
    tx: mpsc::UnboundedSender<SignalingMessage>,
) {
    while let Some(payload) = raw.recv().await {
        let msg: SignalingMessage = match serde_json::from_str(&payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("Dropping malformed signaling message: {}", e);
                continue;
            }
        };

        if msg.from_peer_id == peer_id || !msg.is_for(&peer_id) {
            continue;
        }

        if tx.send(msg).is_err() {
            break;
        }
    }
}
