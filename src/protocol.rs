//! Seam to the external messaging-protocol client.
//!
//! The orchestrator never talks to a concrete protocol implementation; it
//! drives a [`ProtocolClient`] that opens one [`ProtocolHandle`] per
//! connection attempt and reports asynchronous [`ProtocolEvent`]s on a
//! channel. [`crate::bridge`] provides the production implementation; tests
//! plug in in-process fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::creds::AuthState;

/// Close status that signals the credentials were rejected.
pub const STATUS_UNAUTHORIZED: u16 = 401;

/// Status reported when the transport to the protocol client vanished
/// without an explicit close reason.
pub const STATUS_CONNECTION_LOST: u16 = 500;

/// Classification attached to a `connectionClosed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseStatus(pub u16);

impl CloseStatus {
    /// Authentication rejections are never retried.
    pub fn is_terminal(&self) -> bool {
        self.0 == STATUS_UNAUTHORIZED
    }
}

impl std::fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asynchronous events emitted by a live connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Partial credential update that must be persisted.
    CredentialsUpdated(serde_json::Value),
    /// A QR payload to be scanned by the remote client.
    QrIssued(String),
    /// The connection authenticated; carries the remote account identity.
    ConnectionOpen(String),
    /// The connection closed.
    ConnectionClosed(CloseStatus),
}

/// Options passed to [`ProtocolClient::connect`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Browser triple advertised to the remote service.
    pub browser: Vec<String>,
    /// Whether to request full history sync.
    pub sync_full_history: bool,
    /// Upper bound the protocol client applies to its own queries.
    pub query_timeout_ms: u64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            browser: vec!["Pairlink".into(), "Chrome".into(), "10.0.0".into()],
            sync_full_history: false,
            query_timeout_ms: 60_000,
        }
    }
}

/// Link preview attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub title: String,
    pub body: String,
    pub thumbnail_url: String,
    pub source_url: String,
}

/// An outgoing text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<LinkPreview>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            preview: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("protocol transport unavailable: {0}")]
    Transport(String),
    #[error("protocol handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, thiserror::Error)]
#[error("pairing code request failed: {0}")]
pub struct PairingRequestError(pub String);

#[derive(Debug, thiserror::Error)]
#[error("send failed: {0}")]
pub struct SendError(pub String);

#[derive(Debug, thiserror::Error)]
#[error("join community failed: {0}")]
pub struct JoinError(pub String);

/// A live connection to the protocol client.
///
/// Owned by exactly one session record; only its orchestrator (or the
/// cleanup path that takes it out of the record) calls into it.
#[async_trait]
pub trait ProtocolHandle: Send + Sync {
    /// Whether the loaded credentials are already registered.
    fn is_registered(&self) -> bool;

    async fn request_pairing_code(&self, number: &str) -> Result<String, PairingRequestError>;

    async fn send_message(&self, to: &str, message: OutgoingMessage) -> Result<(), SendError>;

    async fn join_community(&self, invite: &str) -> Result<(), JoinError>;

    /// Tear down the connection. Idempotent.
    async fn close(&self);
}

/// Factory for protocol connections.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn connect(
        &self,
        auth: AuthState,
        options: &ConnectOptions,
    ) -> Result<(Arc<dyn ProtocolHandle>, mpsc::Receiver<ProtocolEvent>), ConnectError>;
}
