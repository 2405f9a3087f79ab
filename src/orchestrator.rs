//! Per-session lifecycle driver.
//!
//! Each session runs one [`SessionOrchestrator`] task. The task owns the
//! receiving end of the current protocol connection's event stream and an
//! inbox for its own timers, and advances the session record through the
//! state machine defined in [`crate::session::SessionState`].
//!
//! Reconnect timers carry the generation they were scheduled for. When one
//! fires, the orchestrator re-reads the record and drops the timer if the
//! session is gone or its generation moved on.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cleanup::{release_session, CleanupOutcome};
use crate::config::{Branding, Timings};
use crate::creds::{CredentialError, CredentialStore, ResourceHandle};
use crate::notify::{NotificationChannel, PushEvent, Severity, Transport, TransportGuard};
use crate::protocol::{
    CloseStatus, ConnectError, ConnectOptions, LinkPreview, OutgoingMessage, PairingRequestError,
    ProtocolClient, ProtocolEvent, ProtocolHandle, STATUS_CONNECTION_LOST,
};
use crate::publish::{reference_code, ArtifactPublisher, UploadError};
use crate::qr;
use crate::session::{FlowKind, RegistryError, SessionRecord, SessionRegistry, SessionState};

/// Shortest phone number accepted for the pairing-code flow.
pub const MIN_PHONE_DIGITS: usize = 10;
/// Longest number allowed by E.164.
pub const MAX_PHONE_DIGITS: usize = 15;

/// Errors surfaced to the caller of [`PairingService`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    PairingRequest(#[from] PairingRequestError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("failed to allocate session directory: {0}")]
    Resource(#[source] std::io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Strip everything but digits and check the length.
pub fn normalize_phone(raw: &str) -> Result<String, SessionError> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < MIN_PHONE_DIGITS {
        return Err(SessionError::InvalidInput(format!(
            "phone number must have at least {MIN_PHONE_DIGITS} digits including country code"
        )));
    }
    if digits.len() > MAX_PHONE_DIGITS {
        return Err(SessionError::InvalidInput(format!(
            "phone number must have at most {MAX_PHONE_DIGITS} digits"
        )));
    }
    Ok(digits)
}

/// Static knobs shared by every orchestrator.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub timings: Timings,
    pub connect_options: ConnectOptions,
    pub reference_prefix: String,
    pub branding: Branding,
}

/// Collaborators shared by every orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: SessionRegistry,
    pub notifier: NotificationChannel,
    pub client: Arc<dyn ProtocolClient>,
    pub creds: Arc<dyn CredentialStore>,
    pub publisher: Arc<dyn ArtifactPublisher>,
    pub settings: Arc<OrchestratorSettings>,
}

/// Result of `createPairingSession`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub session_id: String,
    /// Present for the pairing-code flow when the account still needed one.
    pub pairing_code: Option<String>,
}

/// Entry point used by the HTTP layer.
pub struct PairingService {
    deps: Collaborators,
    temp_dir: PathBuf,
}

impl PairingService {
    pub fn new(deps: Collaborators, temp_dir: PathBuf) -> Self {
        Self { deps, temp_dir }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.deps.registry
    }

    pub fn notifier(&self) -> &NotificationChannel {
        &self.deps.notifier
    }

    pub fn timings(&self) -> &Timings {
        &self.deps.settings.timings
    }

    /// Start a session. With a phone number this is the pairing-code flow
    /// and the code is returned directly; without one it is the QR flow and
    /// progress arrives over the push channel.
    pub async fn create_pairing_session(
        &self,
        phone: Option<&str>,
    ) -> Result<CreatedSession, SessionError> {
        let number = phone.map(normalize_phone).transpose()?;
        let flow = if number.is_some() {
            FlowKind::PairingCode
        } else {
            FlowKind::Qr
        };

        let registry = &self.deps.registry;
        let reserved = registry.reserve_id();
        let resource = ResourceHandle::create(&self.temp_dir, &reserved)
            .await
            .map_err(SessionError::Resource)?;
        let resource = Arc::new(resource);
        let id = match registry.create(reserved, flow, resource.clone()) {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = resource.release().await {
                    tracing::warn!(error = %cleanup, "failed to remove unused session directory");
                }
                return Err(e.into());
            }
        };
        tracing::info!(session_id = %id, ?flow, "pairing session created");

        let mut orchestrator = SessionOrchestrator::new(self.deps.clone(), id.clone(), flow)?;
        let pairing_code = match orchestrator.start(number.as_deref()).await {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "session failed to start");
                orchestrator.fail_silently().await;
                return Err(e);
            }
        };
        tokio::spawn(orchestrator.run());

        Ok(CreatedSession {
            session_id: id,
            pairing_code,
        })
    }

    /// Attach a push transport to a live session.
    pub fn attach_transport(
        &self,
        id: &str,
        transport: Transport,
    ) -> Result<TransportGuard, SessionError> {
        let weak = transport.downgrade();
        self.deps
            .registry
            .update(id, |record| record.channel = Some(weak))?;
        Ok(self.deps.notifier.attach(id, transport))
    }

    /// Force a session down regardless of its state.
    pub async fn cancel(&self, id: &str) -> CleanupOutcome {
        release_session(
            &self.deps.registry,
            &self.deps.notifier,
            id,
            Duration::ZERO,
        )
        .await
    }

    /// Release every live session. Used on process shutdown.
    pub async fn shutdown_all(&self) {
        let ids = self.deps.registry.ids();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "releasing live sessions");
        futures::future::join_all(ids.iter().map(|id| self.cancel(id))).await;
    }
}

#[derive(Debug)]
enum Command {
    ReconnectDue { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

/// Drives one session record through its lifecycle.
pub struct SessionOrchestrator {
    deps: Collaborators,
    id: String,
    flow: FlowKind,
    resource: Arc<ResourceHandle>,
    cancelled: CancellationToken,
    events: Option<mpsc::Receiver<ProtocolEvent>>,
    inbox_tx: mpsc::Sender<Command>,
    inbox_rx: mpsc::Receiver<Command>,
}

impl SessionOrchestrator {
    pub fn new(deps: Collaborators, id: String, flow: FlowKind) -> Result<Self, SessionError> {
        let record = deps
            .registry
            .get(&id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let (inbox_tx, inbox_rx) = mpsc::channel(8);
        Ok(Self {
            deps,
            id,
            flow,
            resource: record.resource,
            cancelled: record.cancelled,
            events: None,
            inbox_tx,
            inbox_rx,
        })
    }

    fn record(&self) -> Option<SessionRecord> {
        self.deps.registry.get(&self.id)
    }

    fn protocol(&self) -> Option<Arc<dyn ProtocolHandle>> {
        self.record().and_then(|r| r.protocol)
    }

    fn push(&self, event: PushEvent) -> bool {
        self.deps.notifier.push(&self.id, event)
    }

    fn timings(&self) -> &Timings {
        &self.deps.settings.timings
    }

    /// `INIT -> CONNECTING`, open the first connection and, for the
    /// pairing-code flow, fetch the code before any event is processed.
    pub async fn start(&mut self, number: Option<&str>) -> Result<Option<String>, SessionError> {
        self.deps.registry.transition(&self.id, SessionState::Connecting)?;
        let handle = match self.connect().await {
            Ok(handle) => handle,
            Err(SessionError::Connect(e)) if self.flow == FlowKind::Qr => {
                // QR clients are waiting on the push channel, so a transient
                // failure here goes through the normal retry path.
                tracing::warn!(session_id = %self.id, error = %e, "initial connect failed");
                self.retry(CloseStatus(STATUS_CONNECTION_LOST))?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(number) = number else {
            return Ok(None);
        };
        if handle.is_registered() {
            tracing::info!(session_id = %self.id, "account already registered, no pairing code needed");
            return Ok(None);
        }

        tokio::time::sleep(self.timings().pairing_code_delay()).await;
        tracing::info!(session_id = %self.id, "requesting pairing code");
        let code = handle.request_pairing_code(number).await?;
        self.deps.registry.transition(&self.id, SessionState::AwaitingCode)?;
        tracing::info!(session_id = %self.id, "pairing code issued");
        Ok(Some(code))
    }

    /// Load credentials and open a protocol connection, storing the handle
    /// in the record.
    async fn connect(&mut self) -> Result<Arc<dyn ProtocolHandle>, SessionError> {
        let auth = self.deps.creds.load(self.resource.path()).await?;
        let (handle, events) = self
            .deps
            .client
            .connect(auth, &self.deps.settings.connect_options)
            .await?;

        let adopted = self.deps.registry.update(&self.id, |record| {
            if record.cleanup_started {
                return false;
            }
            record.protocol = Some(handle.clone());
            record.qr_delivered = false;
            true
        });
        if !matches!(adopted, Ok(true)) {
            // Session was torn down while we were connecting.
            handle.close().await;
            return Err(RegistryError::NotFound(self.id.clone()).into());
        }
        self.events = Some(events);
        tracing::debug!(session_id = %self.id, "protocol connection opened");
        Ok(handle)
    }

    /// Consume protocol events and timers until the session terminates or
    /// is removed from the registry.
    pub async fn run(mut self) {
        loop {
            let step = tokio::select! {
                _ = self.cancelled.cancelled() => Step::Stop,
                event = recv_event(&mut self.events) => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        // Left for the reaper if no close ever arrives.
                        tracing::debug!(session_id = %self.id, "protocol event stream ended");
                        self.events = None;
                        Step::Continue
                    }
                },
                Some(command) = self.inbox_rx.recv() => self.on_command(command).await,
            };
            if step == Step::Stop {
                break;
            }
        }
        tracing::debug!(session_id = %self.id, "orchestrator stopped");
    }

    async fn on_event(&mut self, event: ProtocolEvent) -> Step {
        match self.record() {
            Some(record) if !record.cleanup_started => {}
            _ => return Step::Stop,
        }
        let _ = self
            .deps
            .registry
            .update(&self.id, |r| r.last_event_at = tokio::time::Instant::now());

        match event {
            ProtocolEvent::CredentialsUpdated(delta) => {
                self.save_credentials(&delta).await;
                Step::Continue
            }
            ProtocolEvent::QrIssued(payload) => self.on_qr(&payload),
            ProtocolEvent::ConnectionOpen(identity) => self.on_open(identity).await,
            ProtocolEvent::ConnectionClosed(status) => self.on_close(status).await,
        }
    }

    async fn save_credentials(&self, delta: &serde_json::Value) {
        if let Err(e) = self.deps.creds.save(self.resource.path(), delta).await {
            tracing::warn!(session_id = %self.id, error = %e, "failed to persist credential update");
        }
    }

    fn on_qr(&mut self, payload: &str) -> Step {
        if self.flow == FlowKind::PairingCode {
            tracing::debug!(session_id = %self.id, "ignoring QR in pairing-code flow");
            return Step::Continue;
        }
        let Some(record) = self.record() else {
            return Step::Stop;
        };
        if record.state == SessionState::Connecting {
            if let Err(e) = self.deps.registry.transition(&self.id, SessionState::AwaitingCode) {
                tracing::debug!(session_id = %self.id, error = %e, "QR outside a connection attempt");
                return Step::Continue;
            }
        }
        if record.qr_delivered {
            tracing::debug!(session_id = %self.id, "QR already delivered for this attempt");
            return Step::Continue;
        }

        match qr::render_data_url(payload) {
            Ok(image) => {
                if self.push(PushEvent::Qr { image }) {
                    let _ = self.deps.registry.update(&self.id, |r| r.qr_delivered = true);
                    tracing::info!(session_id = %self.id, "QR delivered");
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "QR render failed");
                // Counts as this attempt's QR so re-emissions stay quiet.
                if self.push(PushEvent::error(format!("Failed to generate QR code: {e}"))) {
                    let _ = self.deps.registry.update(&self.id, |r| r.qr_delivered = true);
                }
            }
        }
        Step::Continue
    }

    async fn on_open(&mut self, identity: String) -> Step {
        if let Err(e) = self.deps.registry.transition(&self.id, SessionState::Open) {
            tracing::warn!(session_id = %self.id, error = %e, "unexpected open");
            return Step::Continue;
        }
        tracing::info!(session_id = %self.id, %identity, "paired");
        self.push(PushEvent::Connected);

        // Let trailing credential updates land before reading them.
        let settle = tokio::time::sleep(self.timings().settle());
        tokio::pin!(settle);
        loop {
            tokio::select! {
                _ = &mut settle => break,
                _ = self.cancelled.cancelled() => return Step::Stop,
                event = recv_event(&mut self.events) => match event {
                    Some(ProtocolEvent::CredentialsUpdated(delta)) => self.save_credentials(&delta).await,
                    Some(ProtocolEvent::ConnectionClosed(status)) => return self.on_close(status).await,
                    Some(_) => {}
                    None => self.events = None,
                },
            }
        }

        self.post_process(&identity).await;

        release_session(
            &self.deps.registry,
            &self.deps.notifier,
            &self.id,
            self.timings().cleanup_grace(),
        )
        .await;
        Step::Stop
    }

    /// Best-effort follow-up once paired. No step here can fail the
    /// session.
    async fn post_process(&self, identity: &str) {
        let Some(handle) = self.protocol() else {
            return;
        };
        let branding = &self.deps.settings.branding;

        if let Some(ref invite) = branding.community_invite {
            match handle.join_community(invite).await {
                Ok(()) => tracing::info!(session_id = %self.id, "joined community"),
                Err(e) => tracing::warn!(session_id = %self.id, error = %e, "could not join community"),
            }
        }

        match self.archive().await {
            Ok(url) => {
                let code = reference_code(&self.deps.settings.reference_prefix, &url);
                self.send(handle.as_ref(), identity, session_code_message(&code)).await;
                self.send(handle.as_ref(), identity, welcome_message(branding, identity))
                    .await;
                tracing::info!(session_id = %self.id, %identity, "reference code sent");
                self.push(PushEvent::status(
                    "✅ Session created and sent to your account!",
                    Severity::Info,
                ));
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "artifact upload failed");
                self.send(handle.as_ref(), identity, upload_failed_message(&e)).await;
                self.push(PushEvent::error("Failed to upload session to cloud"));
            }
        }

        self.push(PushEvent::status(
            "✅ Session completed! You can close this window.",
            Severity::Info,
        ));
    }

    async fn archive(&self) -> Result<String, UploadError> {
        let file = self.resource.open_artifact().await?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let name = format!(
            "{}_{}_{}.json",
            self.deps.settings.reference_prefix, self.id, millis
        );
        self.deps.publisher.upload(Box::new(file), &name).await
    }

    async fn send(&self, handle: &dyn ProtocolHandle, to: &str, message: OutgoingMessage) {
        if let Err(e) = handle.send_message(to, message).await {
            tracing::warn!(session_id = %self.id, error = %e, "failed to message paired account");
        }
    }

    async fn on_close(&mut self, status: CloseStatus) -> Step {
        self.events = None;
        if status.is_terminal() {
            tracing::warn!(session_id = %self.id, %status, "credentials rejected");
            self.fail().await;
            return Step::Stop;
        }
        tracing::info!(session_id = %self.id, %status, "connection closed, will reconnect");
        match self.retry(status) {
            Ok(()) => Step::Continue,
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "not reconnecting");
                Step::Stop
            }
        }
    }

    /// Enter `RECONNECTING`, drop the dead handle and arm a reconnect timer
    /// for the new generation.
    fn retry(&mut self, status: CloseStatus) -> Result<(), RegistryError> {
        let generation = self.deps.registry.begin_reconnect(&self.id)?;
        let old = self
            .deps
            .registry
            .update(&self.id, |r| r.protocol.take())
            .ok()
            .flatten();
        if let Some(old) = old {
            tokio::spawn(async move { old.close().await });
        }
        self.push(PushEvent::status("🔄 Reconnecting...", Severity::Warning));

        let delay = self.timings().reconnect_delay();
        let inbox = self.inbox_tx.clone();
        let cancelled = self.cancelled.clone();
        tracing::debug!(session_id = %self.id, generation, code = status.0, ?delay, "reconnect scheduled");
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = inbox.send(Command::ReconnectDue { generation }).await;
                }
                _ = cancelled.cancelled() => {}
            }
        });
        Ok(())
    }

    async fn on_command(&mut self, command: Command) -> Step {
        match command {
            Command::ReconnectDue { generation } => {
                let Some(record) = self.record() else {
                    tracing::debug!(session_id = %self.id, "session gone, dropping reconnect");
                    return Step::Stop;
                };
                if record.generation != generation
                    || record.state != SessionState::Reconnecting
                    || record.cleanup_started
                {
                    tracing::debug!(
                        session_id = %self.id,
                        generation,
                        current = record.generation,
                        state = ?record.state,
                        "stale reconnect timer"
                    );
                    return Step::Continue;
                }
                if let Err(e) = self.deps.registry.transition(&self.id, SessionState::Connecting) {
                    tracing::debug!(session_id = %self.id, error = %e, "reconnect aborted");
                    return Step::Stop;
                }
                match self.connect().await {
                    Ok(_) => Step::Continue,
                    Err(SessionError::Connect(e)) => {
                        tracing::warn!(session_id = %self.id, error = %e, "reconnect failed");
                        match self.retry(CloseStatus(STATUS_CONNECTION_LOST)) {
                            Ok(()) => Step::Continue,
                            Err(_) => Step::Stop,
                        }
                    }
                    Err(SessionError::Registry(_)) => Step::Stop,
                    Err(e) => {
                        tracing::warn!(session_id = %self.id, error = %e, "reconnect cannot proceed");
                        self.fail().await;
                        Step::Stop
                    }
                }
            }
        }
    }

    /// Terminal failure: `FAILED`, tell the client, release immediately.
    async fn fail(&mut self) {
        match self.deps.registry.transition(&self.id, SessionState::Failed) {
            Ok(_) | Err(RegistryError::IllegalTransition { .. }) => {}
            Err(RegistryError::NotFound(_)) | Err(RegistryError::MaxSessionsReached) => return,
        }
        self.push(PushEvent::error("Connection failed. Please try again."));
        release_session(
            &self.deps.registry,
            &self.deps.notifier,
            &self.id,
            Duration::ZERO,
        )
        .await;
    }

    /// Failure during `start`: the caller gets the error directly, so no
    /// push is sent.
    async fn fail_silently(&mut self) {
        let _ = self.deps.registry.transition(&self.id, SessionState::Failed);
        release_session(
            &self.deps.registry,
            &self.deps.notifier,
            &self.id,
            Duration::ZERO,
        )
        .await;
    }
}

async fn recv_event(events: &mut Option<mpsc::Receiver<ProtocolEvent>>) -> Option<ProtocolEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn session_code_message(code: &str) -> OutgoingMessage {
    OutgoingMessage::text(format!(
        "🔐 *YOUR SESSION CODE*\n\n```{code}```\n\nSave this code!"
    ))
}

fn welcome_message(branding: &Branding, identity: &str) -> OutgoingMessage {
    let mut text = format!(
        "*🎉 WELCOME TO {}!*\n\n✅ *Paired Successfully!*\n\n👤 *Your ID:* {identity}\n\
         🔐 *Session Code:* Sent above\n⚠️ *IMPORTANT:* Keep your session code safe!\n",
        branding.bot_name
    );
    if let Some(ref url) = branding.channel_url {
        text.push_str(&format!("\n📢 *Join Our Channel:*\n{url}\n"));
    }
    text.push_str("\n_Thank you for using our service! ✨_");

    let preview = match (&branding.channel_url, &branding.thumbnail_url) {
        (Some(source), Some(thumb)) => Some(LinkPreview {
            title: format!("{} ✅", branding.bot_name),
            body: "Paired Successfully".into(),
            thumbnail_url: thumb.clone(),
            source_url: source.clone(),
        }),
        _ => None,
    };
    OutgoingMessage { text, preview }
}

fn upload_failed_message(error: &UploadError) -> OutgoingMessage {
    OutgoingMessage::text(format!(
        "❌ *Upload Failed*\n\nError: {error}\n\nYour session is still active locally."
    ))
}
