#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use pairlink::config::{Branding, Timings};
use pairlink::creds::{AuthState, FileCredentialStore};
use pairlink::notify::NotificationChannel;
use pairlink::orchestrator::{Collaborators, OrchestratorSettings, PairingService};
use pairlink::protocol::{
    ConnectError, ConnectOptions, JoinError, OutgoingMessage, PairingRequestError,
    ProtocolClient, ProtocolEvent, ProtocolHandle, SendError,
};
use pairlink::publish::{ArtifactPublisher, ArtifactSource, UploadError};
use pairlink::session::SessionRegistry;

// ── Fake protocol client ─────────────────────────────────────────

/// One connection opened through [`FakeClient`].
pub struct FakeHandle {
    pub registered: bool,
    pub auth: serde_json::Value,
    pub sent: Mutex<Vec<(String, OutgoingMessage)>>,
    pub joins: Mutex<Vec<String>>,
    pub pairing_requests: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
    pairing_reply: Result<String, String>,
    fail_join: bool,
}

impl FakeHandle {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, m)| m.text.clone()).collect()
    }
}

#[async_trait]
impl ProtocolHandle for FakeHandle {
    fn is_registered(&self) -> bool {
        self.registered
    }

    async fn request_pairing_code(&self, number: &str) -> Result<String, PairingRequestError> {
        self.pairing_requests.lock().push(number.to_string());
        self.pairing_reply.clone().map_err(PairingRequestError)
    }

    async fn send_message(&self, to: &str, message: OutgoingMessage) -> Result<(), SendError> {
        self.sent.lock().push((to.to_string(), message));
        Ok(())
    }

    async fn join_community(&self, invite: &str) -> Result<(), JoinError> {
        self.joins.lock().push(invite.to_string());
        if self.fail_join {
            return Err(JoinError("invite expired".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::AcqRel);
    }
}

struct Connection {
    handle: Arc<FakeHandle>,
    events: mpsc::Sender<ProtocolEvent>,
}

#[derive(Default)]
struct FakeState {
    connections: Vec<Connection>,
    fail_connects: usize,
    registered: bool,
    pairing_reply: Option<Result<String, String>>,
    fail_join: bool,
}

/// In-process protocol client. Every `connect` records a [`FakeHandle`]
/// and keeps the sending side of its event stream so tests can inject
/// events.
#[derive(Clone, Default)]
pub struct FakeClient {
    state: Arc<Mutex<FakeState>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connect attempts fail with a transport error.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().fail_connects = n;
    }

    pub fn set_registered(&self, registered: bool) {
        self.state.lock().registered = registered;
    }

    pub fn set_pairing_reply(&self, reply: Result<&str, &str>) {
        self.state.lock().pairing_reply = Some(reply.map(str::to_string).map_err(str::to_string));
    }

    pub fn fail_joins(&self) {
        self.state.lock().fail_join = true;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn handle(&self, n: usize) -> Arc<FakeHandle> {
        self.state.lock().connections[n].handle.clone()
    }

    /// Inject an event into connection `n`. Returns false if the
    /// orchestrator already dropped that connection's stream.
    pub async fn emit(&self, n: usize, event: ProtocolEvent) -> bool {
        let tx = self.state.lock().connections[n].events.clone();
        tx.send(event).await.is_ok()
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn connect(
        &self,
        auth: AuthState,
        _options: &ConnectOptions,
    ) -> Result<(Arc<dyn ProtocolHandle>, mpsc::Receiver<ProtocolEvent>), ConnectError> {
        let mut state = self.state.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(ConnectError::Transport("bridge unreachable".into()));
        }
        let handle = Arc::new(FakeHandle {
            registered: state.registered || auth.registered,
            auth: auth.creds,
            sent: Mutex::default(),
            joins: Mutex::default(),
            pairing_requests: Mutex::default(),
            closes: AtomicUsize::new(0),
            pairing_reply: state
                .pairing_reply
                .clone()
                .unwrap_or_else(|| Ok("ABCD1234".into())),
            fail_join: state.fail_join,
        });
        let (tx, rx) = mpsc::channel(64);
        state.connections.push(Connection {
            handle: handle.clone(),
            events: tx,
        });
        Ok((handle, rx))
    }
}

// ── Fake publisher ───────────────────────────────────────────────

/// Records uploads and answers with a fixed link, or fails.
pub struct FakePublisher {
    link: Option<String>,
    pub uploads: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakePublisher {
    pub fn succeeding(link: &str) -> Self {
        Self {
            link: Some(link.to_string()),
            uploads: Mutex::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            link: None,
            uploads: Mutex::default(),
        }
    }
}

#[async_trait]
impl ArtifactPublisher for FakePublisher {
    async fn upload(&self, mut source: ArtifactSource, name: &str) -> Result<String, UploadError> {
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).await?;
        self.uploads.lock().push((name.to_string(), bytes));
        self.link.clone().ok_or(UploadError::Rejected(500))
    }
}

// ── Service harness ──────────────────────────────────────────────

pub struct Harness {
    pub root: tempfile::TempDir,
    pub client: FakeClient,
    pub publisher: Arc<FakePublisher>,
    pub registry: SessionRegistry,
    pub notifier: NotificationChannel,
    pub service: Arc<PairingService>,
}

pub const UPLOAD_LINK: &str = "https://store.test/file/AbC123#key";

pub fn harness() -> Harness {
    harness_with(FakePublisher::succeeding(UPLOAD_LINK), Branding::default(), None)
}

pub fn harness_with(
    publisher: FakePublisher,
    branding: Branding,
    max_sessions: Option<usize>,
) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let client = FakeClient::new();
    let publisher = Arc::new(publisher);
    let registry = SessionRegistry::with_max_sessions(max_sessions);
    let notifier = NotificationChannel::new();
    let deps = Collaborators {
        registry: registry.clone(),
        notifier: notifier.clone(),
        client: Arc::new(client.clone()),
        creds: Arc::new(FileCredentialStore),
        publisher: publisher.clone(),
        settings: Arc::new(OrchestratorSettings {
            timings: Timings::default(),
            connect_options: ConnectOptions::default(),
            reference_prefix: "pairlink".into(),
            branding,
        }),
    };
    let service = Arc::new(PairingService::new(deps, root.path().to_path_buf()));
    Harness {
        root,
        client,
        publisher,
        registry,
        notifier,
        service,
    }
}

/// Poll `cond` every millisecond until it holds. Panics after 60 seconds
/// (virtual seconds under a paused clock).
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
