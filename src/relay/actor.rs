use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::messages::ServerMessage;
use super::types::{ConnId, MAX_TOPIC_LEN, OutboundMessage, RelayError, Subscriber, Topic};

/// Commands sent to the topic manager actor
pub(crate) enum TopicCommand {
    Subscribe {
        conn: ConnId,
        addr: SocketAddr,
        topic: String,
        tx: mpsc::UnboundedSender<OutboundMessage>,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Publish {
        conn: ConnId,
        topic: String,
        payload: String,
        reply: oneshot::Sender<Result<usize, RelayError>>,
    },
    Unsubscribe {
        conn: ConnId,
        topic: String,
    },
    Disconnect {
        conn: ConnId,
    },
}

pub(crate) async fn topic_manager_actor(mut rx: mpsc::Receiver<TopicCommand>) {
    let mut topics: HashMap<String, Topic> = HashMap::new();
    let mut conn_topics: HashMap<ConnId, HashSet<String>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            TopicCommand::Subscribe {
                conn,
                addr,
                topic,
                tx,
                reply,
            } => {
                if topic.len() > MAX_TOPIC_LEN {
                    let _ = reply.send(Err(RelayError::TopicTooLong(topic.len())));
                    continue;
                }

                topics
                    .entry(topic.clone())
                    .or_default()
                    .subscribers
                    .insert(conn, Subscriber { addr, tx });
                conn_topics.entry(conn).or_default().insert(topic.clone());

                info!("Connection {} ({}) subscribed to {}", conn, addr, topic);
                let _ = reply.send(Ok(()));
            }

            TopicCommand::Publish {
                conn,
                topic,
                payload,
                reply,
            } => {
                let result = match topics.get(&topic) {
                    Some(entry) if entry.subscribers.contains_key(&conn) => {
                        let msg = ServerMessage::Broadcast {
                            topic: topic.clone(),
                            payload,
                        };
                        match serde_json::to_string(&msg) {
                            Ok(json) => {
                                let msg = OutboundMessage::from(json);
                                let mut delivered = 0;
                                for (id, sub) in &entry.subscribers {
                                    if *id != conn && sub.tx.send(msg.clone()).is_ok() {
                                        delivered += 1;
                                    }
                                }
                                debug!("Publish on {} from {} reached {}", topic, conn, delivered);
                                Ok(delivered)
                            }
                            Err(e) => Err(RelayError::Internal(e.to_string())),
                        }
                    }
                    _ => Err(RelayError::NotSubscribed(topic)),
                };

                let _ = reply.send(result);
            }

            TopicCommand::Unsubscribe { conn, topic } => {
                if let Some(set) = conn_topics.get_mut(&conn) {
                    set.remove(&topic);
                }
                remove_subscriber(&mut topics, conn, &topic);
            }

            TopicCommand::Disconnect { conn } => {
                if let Some(set) = conn_topics.remove(&conn) {
                    for topic in set {
                        remove_subscriber(&mut topics, conn, &topic);
                    }
                }
            }
        }
    }
}

fn remove_subscriber(topics: &mut HashMap<String, Topic>, conn: ConnId, topic: &str) {
    if let Some(entry) = topics.get_mut(topic) {
        if let Some(sub) = entry.subscribers.remove(&conn) {
            info!("Connection {} ({}) left topic {}", conn, sub.addr, topic);
        }
        if entry.subscribers.is_empty() {
            topics.remove(topic);
            info!("Topic {} removed (empty)", topic);
        }
    }
}

/// Handle to communicate with the topic manager actor
#[derive(Clone)]
pub struct TopicManagerHandle {
    pub(crate) tx: mpsc::Sender<TopicCommand>,
}

impl TopicManagerHandle {
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<TopicCommand>(1024);
        tokio::spawn(topic_manager_actor(rx));
        Self { tx }
    }

    /// Subscribe a connection to a topic
    pub async fn subscribe(
        &self,
        conn: ConnId,
        addr: SocketAddr,
        topic: String,
        tx: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Result<(), RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(TopicCommand::Subscribe {
                conn,
                addr,
                topic,
                tx,
                reply: reply_tx,
            })
            .await;
        reply_rx
            .await
            .map_err(|_| RelayError::Internal("actor channel closed".to_string()))?
    }

    /// Publish to every other subscriber, returning how many were reached
    pub async fn publish(
        &self,
        conn: ConnId,
        topic: String,
        payload: String,
    ) -> Result<usize, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(TopicCommand::Publish {
                conn,
                topic,
                payload,
                reply: reply_tx,
            })
            .await;
        reply_rx
            .await
            .map_err(|_| RelayError::Internal("actor channel closed".to_string()))?
    }

    pub async fn unsubscribe(&self, conn: ConnId, topic: String) {
        let _ = self.tx.send(TopicCommand::Unsubscribe { conn, topic }).await;
    }

    /// Drop every subscription held by a connection
    pub async fn disconnect(&self, conn: ConnId) {
        let _ = self.tx.send(TopicCommand::Disconnect { conn }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn payload_of(msg: OutboundMessage) -> String {
        let parsed: ServerMessage = serde_json::from_str(msg.into_inner().as_str()).unwrap();
        match parsed {
            ServerMessage::Broadcast { payload, .. } => payload,
            other => panic!("Expected Broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_fans_out_to_other_subscribers() {
        let handle = TopicManagerHandle::spawn();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();

        handle.subscribe(1, addr(), "t".into(), tx1).await.unwrap();
        handle.subscribe(2, addr(), "t".into(), tx2).await.unwrap();
        handle.subscribe(3, addr(), "other".into(), tx3).await.unwrap();

        let delivered = handle.publish(1, "t".into(), "hi".into()).await.unwrap();
        assert_eq!(delivered, 1);

        assert_eq!(payload_of(rx2.recv().await.unwrap()), "hi");
        assert!(rx1.try_recv().is_err());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_requires_subscription() {
        let handle = TopicManagerHandle::spawn();
        let err = handle.publish(9, "t".into(), "x".into()).await.unwrap_err();
        assert!(matches!(err, RelayError::NotSubscribed(_)));
    }

    #[tokio::test]
    async fn long_topic_is_rejected() {
        let handle = TopicManagerHandle::spawn();
        let (tx, _rx) = mpsc::unbounded_channel();
        let topic = "x".repeat(MAX_TOPIC_LEN + 1);
        let err = handle.subscribe(1, addr(), topic, tx).await.unwrap_err();
        assert!(matches!(err, RelayError::TopicTooLong(_)));
    }

    #[tokio::test]
    async fn disconnect_removes_every_subscription() {
        let handle = TopicManagerHandle::spawn();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        handle.subscribe(1, addr(), "t".into(), tx1).await.unwrap();
        handle.subscribe(2, addr(), "t".into(), tx2.clone()).await.unwrap();
        handle.subscribe(2, addr(), "u".into(), tx2).await.unwrap();
        handle.disconnect(2).await;

        let delivered = handle.publish(1, "t".into(), "hi".into()).await.unwrap();
        assert_eq!(delivered, 0);
        assert!(rx2.try_recv().is_err());
    }
}
