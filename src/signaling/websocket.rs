//! Client side of the WebSocket broadcast relay

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::fabric::{Fabric, Inbound, TopicLink};
use super::types::SignalingError;
use crate::relay::{ClientMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SubscribeReply = oneshot::Sender<Result<(), SignalingError>>;

enum WsCommand {
    Subscribe {
        topic: String,
        inbound: mpsc::UnboundedSender<String>,
        reply: SubscribeReply,
    },
    Publish {
        topic: String,
        payload: String,
    },
    Unsubscribe {
        topic: String,
    },
}

/// Broadcast fabric backed by one WebSocket connection to a relay server.
///
/// The relay excludes the publishing connection from fan-out, so every
/// session should use its own `WsFabric`.
#[derive(Clone)]
pub struct WsFabric {
    tx: mpsc::Sender<WsCommand>,
}

impl WsFabric {
    pub async fn connect(url: &str) -> Result<Self, SignalingError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;

        info!("Connected to relay at {}", url);

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(ws_fabric_actor(ws, rx));
        Ok(Self { tx })
    }
}

impl Fabric for WsFabric {
    type Link = WsLink;

    async fn subscribe(&self, topic: &str) -> Result<(WsLink, Inbound), SignalingError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(WsCommand::Subscribe {
                topic: topic.to_string(),
                inbound: inbound_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SignalingError::NotConnected)?;

        reply_rx.await.map_err(|_| SignalingError::NotConnected)??;

        let link = WsLink {
            tx: self.tx.clone(),
            topic: topic.to_string(),
            active: AtomicBool::new(true),
        };
        Ok((link, inbound_rx))
    }
}

pub struct WsLink {
    tx: mpsc::Sender<WsCommand>,
    topic: String,
    active: AtomicBool,
}

impl TopicLink for WsLink {
    async fn publish(&self, payload: String) -> Result<(), SignalingError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(SignalingError::NotConnected);
        }
        self.tx
            .send(WsCommand::Publish {
                topic: self.topic.clone(),
                payload,
            })
            .await
            .map_err(|_| SignalingError::Publish("relay connection closed".to_string()))
    }

    async fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            let _ = self
                .tx
                .send(WsCommand::Unsubscribe {
                    topic: self.topic.clone(),
                })
                .await;
        }
    }
}

async fn ws_fabric_actor(ws: WsStream, mut rx: mpsc::Receiver<WsCommand>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut topics: HashMap<String, mpsc::UnboundedSender<String>> = HashMap::new();
    let mut pending: HashMap<String, (mpsc::UnboundedSender<String>, SubscribeReply)> =
        HashMap::new();

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                let (msg, topic) = match cmd {
                    WsCommand::Subscribe { topic, inbound, reply } => {
                        if topics.contains_key(&topic) || pending.contains_key(&topic) {
                            let _ = reply.send(Err(SignalingError::SubscriptionRejected {
                                topic,
                                reason: "already subscribed on this connection".to_string(),
                            }));
                            continue;
                        }
                        pending.insert(topic.clone(), (inbound, reply));
                        (ClientMessage::Subscribe { topic: topic.clone() }, topic)
                    }
                    WsCommand::Publish { topic, payload } => {
                        (ClientMessage::Publish { topic: topic.clone(), payload }, topic)
                    }
                    WsCommand::Unsubscribe { topic } => {
                        topics.remove(&topic);
                        (ClientMessage::Unsubscribe { topic: topic.clone() }, topic)
                    }
                };

                let sent = match serde_json::to_string(&msg) {
                    Ok(json) => ws_tx.send(Message::text(json)).await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(e) = sent {
                    warn!("Relay send failed on {}: {}", topic, e);
                    if let Some((_, reply)) = pending.remove(&topic) {
                        let _ = reply.send(Err(SignalingError::Publish(e)));
                    }
                }
            }

            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Relay connection error: {}", e);
                        break;
                    }
                };

                match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(ServerMessage::Subscribed { topic }) => {
                        if let Some((inbound, reply)) = pending.remove(&topic) {
                            debug!("Subscribed to {}", topic);
                            topics.insert(topic, inbound);
                            let _ = reply.send(Ok(()));
                        }
                    }
                    Ok(ServerMessage::Broadcast { topic, payload }) => {
                        let closed = match topics.get(&topic) {
                            Some(inbound) => inbound.send(payload).is_err(),
                            None => false,
                        };
                        if closed {
                            topics.remove(&topic);
                        }
                    }
                    Ok(ServerMessage::Error { topic, message }) => {
                        match topic.and_then(|t| pending.remove(&t).map(|p| (t, p))) {
                            Some((topic, (_, reply))) => {
                                let _ = reply.send(Err(SignalingError::SubscriptionRejected {
                                    topic,
                                    reason: message,
                                }));
                            }
                            None => warn!("Relay error: {}", message),
                        }
                    }
                    Err(e) => warn!("Invalid relay message: {}", e),
                }
            }
        }
    }

    for (topic, (_, reply)) in pending.drain() {
        let _ = reply.send(Err(SignalingError::SubscriptionRejected {
            topic,
            reason: "relay connection closed".to_string(),
        }));
    }
    info!("Relay connection closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::relay::RelayServer;
    use crate::session::SessionHandle;
    use crate::transport::MemoryNetwork;
    use crate::types::{GroupIdentity, InviteCode};

    async fn relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let server = RelayServer::new();
            let _ = server.serve(listener).await;
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn publish_reaches_other_connections_only() {
        let url = relay().await;
        let a = WsFabric::connect(&url).await.unwrap();
        let b = WsFabric::connect(&url).await.unwrap();

        let (link_a, mut rx_a) = a.subscribe("group:ABC123:signaling").await.unwrap();
        let (_link_b, mut rx_b) = b.subscribe("group:ABC123:signaling").await.unwrap();

        link_a.publish("hello".to_string()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("hello"));
        assert!(rx_a.try_recv().is_err());

        link_a.unsubscribe().await;
        assert!(matches!(
            link_a.publish("late".to_string()).await,
            Err(SignalingError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn duplicate_subscription_is_rejected() {
        let url = relay().await;
        let fabric = WsFabric::connect(&url).await.unwrap();

        let _first = fabric.subscribe("group:ABC123:signaling").await.unwrap();
        assert!(matches!(
            fabric.subscribe("group:ABC123:signaling").await,
            Err(SignalingError::SubscriptionRejected { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_topic_is_rejected_by_relay() {
        let url = relay().await;
        let fabric = WsFabric::connect(&url).await.unwrap();

        let topic = "t".repeat(crate::relay::MAX_TOPIC_LEN + 1);
        assert!(matches!(
            fabric.subscribe(&topic).await,
            Err(SignalingError::SubscriptionRejected { .. })
        ));
    }

    #[tokio::test]
    async fn sessions_negotiate_through_the_relay() {
        let url = relay().await;
        let net = MemoryNetwork::new();
        let code = InviteCode::try_from("WSRYDE").unwrap();

        let leader_id = GroupIdentity::leader(code, "L");
        let leader_fabric = WsFabric::connect(&url).await.unwrap();
        let factory = net.factory(leader_id.peer_id);
        let leader = SessionHandle::start(leader_id, &leader_fabric, factory)
            .await
            .unwrap();

        let rider_id = GroupIdentity::rider(code, "R1");
        let rider_fabric = WsFabric::connect(&url).await.unwrap();
        let factory = net.factory(rider_id.peer_id);
        let rider = SessionHandle::start(rider_id, &rider_fabric, factory)
            .await
            .unwrap();

        let mut roster = leader.subscribe_roster();
        tokio::time::timeout(Duration::from_secs(5), roster.wait_for(|r| r.connected))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leader.peer_count().await, 1);
        assert_eq!(rider.peer_count().await, 1);

        rider.disconnect().await;
        leader.disconnect().await;
    }
}
