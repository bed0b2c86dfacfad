use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::actor::TopicManagerHandle;
use super::messages::{ClientMessage, ServerMessage};
use super::types::{ConnId, OutboundMessage};

pub const DEFAULT_RELAY_PORT: u16 = 3479;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket broadcast relay: every publication on a topic is fanned out to
/// the topic's other subscribers. It never inspects payloads.
pub struct RelayServer {
    handle: TopicManagerHandle,
    next_conn: AtomicU64,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        Self {
            handle: TopicManagerHandle::spawn(),
            next_conn: AtomicU64::new(1),
        }
    }

    pub async fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("Relay server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            let handle = self.handle.clone();
            let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, conn, handle).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn: ConnId,
    handle: TopicManagerHandle,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    info!("WebSocket connection {} from {}", conn, addr);

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    let ws_msg = Message::Text(msg.into_inner());
                    if ws_tx.send(ws_msg).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", addr);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + PONG_TIMEOUT);
                debug!("Ping sent to {}", addr);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", addr);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        if let Err(e) = handle_text_message(&text, &tx, &handle, addr, conn).await {
                            warn!("Message handling error: {}", e);
                        }
                    }
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", addr);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", addr);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    handle.disconnect(conn).await;

    send_task.abort();
    info!("WebSocket disconnected: {}", addr);

    Ok(())
}

async fn handle_text_message(
    text: &str,
    tx: &mpsc::UnboundedSender<OutboundMessage>,
    handle: &TopicManagerHandle,
    addr: SocketAddr,
    conn: ConnId,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let err = ServerMessage::Error {
                topic: None,
                message: format!("Invalid message: {}", e),
            };
            let _ = tx.send(OutboundMessage::from(serde_json::to_string(&err)?));
            return Ok(());
        }
    };

    match client_msg {
        ClientMessage::Subscribe { topic } => {
            let response = match handle.subscribe(conn, addr, topic.clone(), tx.clone()).await {
                Ok(()) => ServerMessage::Subscribed { topic },
                Err(e) => ServerMessage::Error {
                    topic: Some(topic),
                    message: e.to_string(),
                },
            };
            let _ = tx.send(OutboundMessage::from(serde_json::to_string(&response)?));
        }

        ClientMessage::Publish { topic, payload } => {
            if let Err(e) = handle.publish(conn, topic.clone(), payload).await {
                let err = ServerMessage::Error {
                    topic: Some(topic),
                    message: e.to_string(),
                };
                let _ = tx.send(OutboundMessage::from(serde_json::to_string(&err)?));
            }
        }

        ClientMessage::Unsubscribe { topic } => {
            handle.unsubscribe(conn, topic).await;
        }
    }

    Ok(())
}
