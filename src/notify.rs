//! Push channel from a session to whichever client is currently watching it.
//!
//! Delivery is at-most-once and best-effort: an event pushed while no
//! transport is attached is dropped, and nothing is replayed when a client
//! attaches later.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-transport queue depth. A client that falls this far behind starts
/// losing events rather than stalling the session.
pub const TRANSPORT_CAPACITY: usize = 32;

/// Visual severity of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn color(&self) -> &'static str {
        match self {
            Severity::Info => "#00ff00",
            Severity::Warning => "#ffff00",
            Severity::Error => "#ff0000",
        }
    }
}

/// Event delivered to a waiting client.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Qr { image: String },
    Status { message: String, severity: Severity },
    Connected,
    Error { message: String },
}

impl PushEvent {
    pub fn status(message: impl Into<String>, severity: Severity) -> Self {
        PushEvent::Status {
            message: message.into(),
            severity,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        PushEvent::Error {
            message: message.into(),
        }
    }

    /// The `type` tag on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            PushEvent::Qr { .. } => "qr",
            PushEvent::Status { .. } => "status",
            PushEvent::Connected => "connected",
            PushEvent::Error { .. } => "error",
        }
    }

    pub fn to_wire(&self) -> WireMessage<'_> {
        let mut wire = WireMessage {
            kind: self.kind(),
            qr: None,
            message: None,
            color: None,
        };
        match self {
            PushEvent::Qr { image } => wire.qr = Some(image),
            PushEvent::Status { message, severity } => {
                wire.message = Some(message);
                wire.color = Some(severity.color());
            }
            PushEvent::Connected => {}
            PushEvent::Error { message } => wire.message = Some(message),
        }
        wire
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_wire()).unwrap_or_else(|_| {
            format!(r#"{{"type":"{}"}}"#, self.kind())
        })
    }
}

/// JSON shape of one pushed event.
#[derive(Debug, Serialize)]
pub struct WireMessage<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<&'static str>,
}

/// A push transport is the sending half of a queue drained by a WebSocket or
/// SSE handler.
pub type Transport = mpsc::Sender<PushEvent>;

struct Attachment {
    token: u64,
    tx: Transport,
}

/// Routes pushed events to the transport attached to each session.
#[derive(Clone, Default)]
pub struct NotificationChannel {
    inner: Arc<Mutex<HashMap<String, Attachment>>>,
    next_token: Arc<AtomicU64>,
}

/// Detaches its transport on drop, but only if no newer transport has
/// replaced it in the meantime.
pub struct TransportGuard {
    channel: NotificationChannel,
    session_id: String,
    token: u64,
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.channel.detach_token(&self.session_id, self.token);
    }
}

impl NotificationChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport queue pair of the default capacity.
    pub fn transport() -> (Transport, mpsc::Receiver<PushEvent>) {
        mpsc::channel(TRANSPORT_CAPACITY)
    }

    /// Attach `transport` to session `id`, replacing any previous one.
    pub fn attach(&self, id: &str, transport: Transport) -> TransportGuard {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .inner
            .lock()
            .insert(id.to_string(), Attachment { token, tx: transport });
        if previous.is_some() {
            tracing::debug!(session_id = %id, "replaced existing push transport");
        }
        TransportGuard {
            channel: self.clone(),
            session_id: id.to_string(),
            token,
        }
    }

    /// Remove whatever transport is attached to `id`. No-op if none.
    pub fn detach(&self, id: &str) {
        self.inner.lock().remove(id);
    }

    fn detach_token(&self, id: &str, token: u64) {
        let mut inner = self.inner.lock();
        if inner.get(id).is_some_and(|a| a.token == token) {
            inner.remove(id);
        }
    }

    pub fn is_attached(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    /// Fire-and-forget delivery. Returns whether the event was handed to a
    /// transport; never errors and never buffers.
    pub fn push(&self, id: &str, event: PushEvent) -> bool {
        let tx = match self.inner.lock().get(id) {
            Some(attachment) => attachment.tx.clone(),
            None => {
                tracing::debug!(session_id = %id, kind = event.kind(), "no transport attached, dropping push");
                return false;
            }
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(session_id = %id, kind = event.kind(), "push transport full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Receiver went away without dropping its guard yet.
                self.inner.lock().retain(|k, a| k != id || !a.tx.is_closed());
                false
            }
        }
    }
}
