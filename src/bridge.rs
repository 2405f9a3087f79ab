//! [`ProtocolClient`] that talks JSON over WebSocket to a protocol bridge
//! process.
//!
//! Each connection attempt opens its own socket to the bridge and sends a
//! `connect` frame with the loaded credentials. After that the bridge
//! streams events (`creds`, `qr`, `open`, `close`) and answers numbered
//! requests (`pairing_code`, `send`, `join`) with `reply` frames.
//!
//! A single task per socket owns both halves of the stream: it forwards
//! outgoing frames, routes replies to their waiting callers and turns
//! events into [`ProtocolEvent`]s. If the socket dies without a `close`
//! event the task reports status 500 so the session reconnects.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;

use crate::creds::AuthState;
use crate::protocol::{
    CloseStatus, ConnectError, ConnectOptions, JoinError, OutgoingMessage, PairingRequestError,
    ProtocolClient, ProtocolEvent, ProtocolHandle, SendError, STATUS_CONNECTION_LOST,
};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const EVENT_BUFFER: usize = 64;
const OUTBOUND_BUFFER: usize = 32;

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Outbound<'a> {
    Connect {
        auth: &'a serde_json::Value,
        options: &'a ConnectOptions,
    },
    PairingCode {
        id: u64,
        number: &'a str,
    },
    Send {
        id: u64,
        to: &'a str,
        message: &'a OutgoingMessage,
    },
    Join {
        id: u64,
        invite: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    Event(BridgeEvent),
    Reply(Reply),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum BridgeEvent {
    Creds { delta: serde_json::Value },
    Qr { payload: String },
    Open { identity: String },
    Close { status: u16 },
}

impl From<BridgeEvent> for ProtocolEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Creds { delta } => ProtocolEvent::CredentialsUpdated(delta),
            BridgeEvent::Qr { payload } => ProtocolEvent::QrIssued(payload),
            BridgeEvent::Open { identity } => ProtocolEvent::ConnectionOpen(identity),
            BridgeEvent::Close { status } => ProtocolEvent::ConnectionClosed(CloseStatus(status)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    reply: u64,
    ok: bool,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Opens bridge connections at a fixed URL.
pub struct BridgeClient {
    url: String,
}

impl BridgeClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn connect(
        &self,
        auth: AuthState,
        options: &ConnectOptions,
    ) -> Result<(Arc<dyn ProtocolHandle>, mpsc::Receiver<ProtocolEvent>), ConnectError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;

        let hello = serde_json::to_string(&Outbound::Connect {
            auth: &auth.creds,
            options,
        })
        .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        ws.send(Message::Text(hello.into()))
            .await
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let pending: Pending = Arc::default();
        let cancel = CancellationToken::new();

        tokio::spawn(run_socket(
            ws,
            out_rx,
            events_tx,
            pending.clone(),
            cancel.clone(),
        ));
        tracing::debug!(url = %self.url, "bridge connection established");

        let handle = BridgeHandle {
            registered: auth.registered,
            next_id: AtomicU64::new(1),
            out: out_tx,
            pending,
            cancel,
            closed: AtomicBool::new(false),
            timeout: Duration::from_millis(options.query_timeout_ms),
        };
        Ok((Arc::new(handle), events_rx))
    }
}

async fn run_socket(
    ws: WsStream,
    mut out_rx: mpsc::Receiver<String>,
    events_tx: mpsc::Sender<ProtocolEvent>,
    pending: Pending,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = ws.split();
    let mut saw_close = false;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Inbound>(&text) {
                            Ok(Inbound::Event(event)) => {
                                saw_close |= matches!(event, BridgeEvent::Close { .. });
                                if events_tx.send(event.into()).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Inbound::Reply(reply)) => {
                                if let Some(tx) = pending.lock().remove(&reply.reply) {
                                    let _ = tx.send(reply);
                                }
                            }
                            Err(e) => tracing::debug!(error = %e, "ignoring malformed bridge frame"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "bridge socket error");
                        break;
                    }
                }
            }
            Some(frame) = out_rx.recv() => {
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                pending.lock().clear();
                return;
            }
        }
    }

    // Waiting callers see their reply channel drop.
    pending.lock().clear();
    if !saw_close && !cancel.is_cancelled() {
        tracing::warn!("bridge socket lost without close event");
        let _ = events_tx
            .send(ProtocolEvent::ConnectionClosed(CloseStatus(STATUS_CONNECTION_LOST)))
            .await;
    }
}

struct BridgeHandle {
    registered: bool,
    next_id: AtomicU64,
    out: mpsc::Sender<String>,
    pending: Pending,
    cancel: CancellationToken,
    closed: AtomicBool,
    timeout: Duration,
}

impl BridgeHandle {
    /// Send a numbered request and wait for its reply.
    async fn request<'a>(
        &self,
        build: impl FnOnce(u64) -> Outbound<'a>,
    ) -> Result<Option<String>, String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&build(id)).map_err(|e| e.to_string())?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.out.send(frame).await.is_err() {
            self.pending.lock().remove(&id);
            return Err("bridge connection closed".into());
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err("bridge connection closed".into()),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(format!("no reply within {:?}", self.timeout));
            }
        };
        if reply.ok {
            Ok(reply.value)
        } else {
            Err(reply.error.unwrap_or_else(|| "request rejected".into()))
        }
    }
}

#[async_trait]
impl ProtocolHandle for BridgeHandle {
    fn is_registered(&self) -> bool {
        self.registered
    }

    async fn request_pairing_code(&self, number: &str) -> Result<String, PairingRequestError> {
        self.request(|id| Outbound::PairingCode { id, number })
            .await
            .map_err(PairingRequestError)?
            .ok_or_else(|| PairingRequestError("reply carried no code".into()))
    }

    async fn send_message(&self, to: &str, message: OutgoingMessage) -> Result<(), SendError> {
        self.request(|id| Outbound::Send {
            id,
            to,
            message: &message,
        })
        .await
        .map(|_| ())
        .map_err(SendError)
    }

    async fn join_community(&self, invite: &str) -> Result<(), JoinError> {
        self.request(|id| Outbound::Join { id, invite })
            .await
            .map(|_| ())
            .map_err(JoinError)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
