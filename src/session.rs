use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::creds::ResourceHandle;
use crate::id::make_session_id;
use crate::notify::PushEvent;
use crate::protocol::ProtocolHandle;

/// Lifecycle state of a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Init,
    AwaitingCode,
    Connecting,
    Open,
    Reconnecting,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// States during which the record owns a live protocol handle.
    pub fn holds_connection(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::AwaitingCode
                | SessionState::Open
                | SessionState::Reconnecting
        )
    }

    /// Whether `self -> next` is an edge of the session state machine.
    ///
    /// `AwaitingCode` is a sub-state of `Connecting` and shares its
    /// outgoing edges. Any live state may be forced to `Closing` by the
    /// reaper or an explicit cancel.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Init, Connecting) => true,
            (Connecting, AwaitingCode) | (AwaitingCode, AwaitingCode) => true,
            (Connecting | AwaitingCode, Open | Reconnecting | Failed) => true,
            (Open, Closing | Reconnecting) => true,
            (Reconnecting, Connecting) => true,
            (Init | Connecting | AwaitingCode | Reconnecting, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

/// Which artifact the client is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowKind {
    Qr,
    PairingCode,
}

/// One pairing session as stored in the registry.
///
/// Only the owning orchestrator mutates a record, except for the cleanup
/// path (reaper or cancel) which may move it to `Closing`/`Closed`.
#[derive(Clone)]
pub struct SessionRecord {
    pub id: String,
    pub flow: FlowKind,
    pub state: SessionState,
    pub created_at: Instant,
    pub last_event_at: Instant,
    /// Bumped on every reconnect attempt; stale reconnect timers compare
    /// against it and abort on mismatch.
    pub generation: u64,
    pub resource: Arc<ResourceHandle>,
    pub protocol: Option<Arc<dyn ProtocolHandle>>,
    pub channel: Option<mpsc::WeakSender<PushEvent>>,
    pub qr_delivered: bool,
    /// Set once cleanup has been claimed so a second claimant backs off.
    pub cleanup_started: bool,
    /// Fires when the record leaves the registry so the orchestrator task
    /// stops promptly.
    pub cancelled: CancellationToken,
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("flow", &self.flow)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("qr_delivered", &self.qr_delivered)
            .finish_non_exhaustive()
    }
}

impl SessionRecord {
    /// Whether a push subscriber is still reachable.
    pub fn has_subscriber(&self) -> bool {
        self.channel
            .as_ref()
            .and_then(mpsc::WeakSender::upgrade)
            .is_some_and(|tx| !tx.is_closed())
    }
}

/// Server-level session lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Created { id: String },
    StateChanged { id: String, from: SessionState, to: SessionState },
    Removed { id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("illegal transition for session {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: String,
        from: SessionState,
        to: SessionState,
    },
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
}

struct RegistryInner {
    sessions: HashMap<String, SessionRecord>,
    max_sessions: Option<usize>,
}

/// Concurrent keyed store of session records.
///
/// Every operation takes the lock only for the duration of the map
/// mutation; nothing async happens under it.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Default maximum number of concurrent sessions.
    ///
    /// Each session holds a protocol connection and a temp directory.
    pub const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new() -> Self {
        Self::with_max_sessions(Some(Self::DEFAULT_MAX_SESSIONS))
    }

    pub fn with_max_sessions(max_sessions: Option<usize>) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                max_sessions,
            })),
            events_tx,
        }
    }

    /// Reserve a fresh, unique id. The caller uses it to allocate the
    /// session's resources before calling [`SessionRegistry::insert`].
    pub fn reserve_id(&self) -> String {
        let inner = self.inner.read();
        loop {
            let id = make_session_id();
            if !inner.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Insert a fresh record in `Init` for `id`.
    ///
    /// If `id` was taken in the meantime a new one is generated; the
    /// assigned id is returned.
    pub fn create(
        &self,
        id: String,
        flow: FlowKind,
        resource: Arc<ResourceHandle>,
    ) -> Result<String, RegistryError> {
        let mut inner = self.inner.write();
        if let Some(max) = inner.max_sessions {
            if inner.sessions.len() >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }
        let mut id = id;
        while inner.sessions.contains_key(&id) {
            id = make_session_id();
        }
        let now = Instant::now();
        inner.sessions.insert(
            id.clone(),
            SessionRecord {
                id: id.clone(),
                flow,
                state: SessionState::Init,
                created_at: now,
                last_event_at: now,
                generation: 0,
                resource,
                protocol: None,
                channel: None,
                qr_delivered: false,
                cleanup_started: false,
                cancelled: CancellationToken::new(),
            },
        );
        let _ = self.events_tx.send(SessionEvent::Created { id: id.clone() });
        Ok(id)
    }

    /// Look up a record, returning a snapshot if found.
    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.inner.read().sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().sessions.contains_key(id)
    }

    /// Remove a record. Idempotent: returns `None` if it was already gone.
    pub fn remove(&self, id: &str) -> Option<SessionRecord> {
        let removed = self.inner.write().sessions.remove(id);
        if let Some(ref record) = removed {
            record.cancelled.cancel();
            let _ = self.events_tx.send(SessionEvent::Removed { id: id.to_string() });
        }
        removed
    }

    /// Visit every record. The closure sees a consistent snapshot taken
    /// under the read lock but runs after the lock is released.
    pub fn for_each(&self, mut f: impl FnMut(&SessionRecord)) {
        let snapshot: Vec<SessionRecord> = self.inner.read().sessions.values().cloned().collect();
        for record in &snapshot {
            f(record);
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.read().sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }

    /// Mutate a record in place under the write lock.
    pub fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Result<T, RegistryError> {
        let mut inner = self.inner.write();
        let record = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(f(record))
    }

    /// Move a record along one edge of the state machine, returning the
    /// previous state.
    pub fn transition(&self, id: &str, to: SessionState) -> Result<SessionState, RegistryError> {
        let from = {
            let mut inner = self.inner.write();
            let record = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let from = record.state;
            if !from.can_transition_to(to) {
                return Err(RegistryError::IllegalTransition {
                    id: id.to_string(),
                    from,
                    to,
                });
            }
            record.state = to;
            record.last_event_at = Instant::now();
            from
        };
        if from != to {
            tracing::info!(session_id = %id, ?from, ?to, "session state changed");
            let _ = self.events_tx.send(SessionEvent::StateChanged {
                id: id.to_string(),
                from,
                to,
            });
        }
        Ok(from)
    }

    /// Enter `Reconnecting` and bump the generation in one step, returning
    /// the new generation for the caller's timer to capture.
    pub fn begin_reconnect(&self, id: &str) -> Result<u64, RegistryError> {
        self.transition(id, SessionState::Reconnecting)?;
        self.update(id, |record| {
            record.generation += 1;
            record.qr_delivered = false;
            record.generation
        })
    }

    /// Claim cleanup of a record. Returns `None` if the record is gone or
    /// another caller already claimed it.
    ///
    /// On success the protocol handle is taken out of the record, so at
    /// most one claimant ever closes it, and the state moves to `Closing`
    /// unless the session already failed.
    pub fn claim_cleanup(
        &self,
        id: &str,
    ) -> Option<(Option<Arc<dyn ProtocolHandle>>, Arc<ResourceHandle>, SessionState)> {
        let (claimed, from) = {
            let mut inner = self.inner.write();
            let record = inner.sessions.get_mut(id)?;
            if record.cleanup_started {
                return None;
            }
            record.cleanup_started = true;
            let from = record.state;
            if from.can_transition_to(SessionState::Closing) {
                record.state = SessionState::Closing;
                record.last_event_at = Instant::now();
            }
            (
                (record.protocol.take(), record.resource.clone(), record.state),
                from,
            )
        };
        if from != claimed.2 {
            tracing::info!(session_id = %id, ?from, to = ?claimed.2, "session state changed");
            let _ = self.events_tx.send(SessionEvent::StateChanged {
                id: id.to_string(),
                from,
                to: claimed.2,
            });
        }
        Some(claimed)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}
