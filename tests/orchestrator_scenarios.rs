//! End-to-end lifecycle scenarios driven through `PairingService` with an
//! in-process protocol client and publisher. All tests run on a paused
//! clock so the fixed settle / reconnect / grace delays elapse virtually.

mod common;

use common::{harness, harness_with, wait_for, FakePublisher, UPLOAD_LINK};
use pairlink::cleanup::CleanupOutcome;
use pairlink::config::Branding;
use pairlink::notify::{NotificationChannel, PushEvent, Severity};
use pairlink::orchestrator::SessionError;
use pairlink::protocol::{CloseStatus, ProtocolEvent};
use pairlink::reaper;
use pairlink::session::SessionState;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const IDENTITY: &str = "15551234567@s.whatsapp.net";

async fn next_push(rx: &mut mpsc::Receiver<PushEvent>) -> PushEvent {
    timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for push")
        .expect("push transport closed")
}

fn state_of(h: &common::Harness, id: &str) -> Option<SessionState> {
    h.registry.get(id).map(|r| r.state)
}

// ── Scenario A: QR flow, happy path ──────────────────────────────

#[tokio::test(start_paused = true)]
async fn qr_flow_pairs_uploads_and_cleans_up() {
    let branding = Branding {
        community_invite: Some("INVITE42".into()),
        ..Branding::default()
    };
    let h = harness_with(FakePublisher::succeeding(UPLOAD_LINK), branding, None);

    let created = h.service.create_pairing_session(None).await.unwrap();
    let id = created.session_id;
    assert!(created.pairing_code.is_none());
    assert_eq!(state_of(&h, &id), Some(SessionState::Connecting));

    let (tx, mut rx) = NotificationChannel::transport();
    let _guard = h.service.attach_transport(&id, tx).unwrap();

    h.client.emit(0, ProtocolEvent::QrIssued("2@abc,def".into())).await;
    match next_push(&mut rx).await {
        PushEvent::Qr { image } => assert!(image.starts_with("data:image/svg+xml;base64,")),
        other => panic!("expected qr push, got {other:?}"),
    }
    assert_eq!(state_of(&h, &id), Some(SessionState::AwaitingCode));

    h.client
        .emit(0, ProtocolEvent::CredentialsUpdated(json!({ "me": { "id": IDENTITY } })))
        .await;
    h.client.emit(0, ProtocolEvent::ConnectionOpen(IDENTITY.into())).await;

    assert_eq!(next_push(&mut rx).await, PushEvent::Connected);
    assert_eq!(state_of(&h, &id), Some(SessionState::Open));

    assert_eq!(
        next_push(&mut rx).await,
        PushEvent::status("✅ Session created and sent to your account!", Severity::Info)
    );
    assert_eq!(
        next_push(&mut rx).await,
        PushEvent::status("✅ Session completed! You can close this window.", Severity::Info)
    );

    let handle = h.client.handle(0);
    assert_eq!(*handle.joins.lock(), vec!["INVITE42".to_string()]);

    let sent = handle.sent.lock().clone();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(to, _)| to == IDENTITY));
    assert!(sent[0].1.text.contains("pairlink~AbC123"));
    assert!(sent[1].1.text.contains(IDENTITY));

    let uploads = h.publisher.uploads.lock().clone();
    assert_eq!(uploads.len(), 1);
    let (name, bytes) = &uploads[0];
    assert!(name.starts_with(&format!("pairlink_{id}_")));
    assert!(name.ends_with(".json"));
    let archived: serde_json::Value = serde_json::from_slice(bytes).unwrap();
    assert_eq!(archived["me"]["id"], IDENTITY);

    wait_for("session removal", || !h.registry.contains(&id)).await;
    assert_eq!(handle.close_count(), 1);
    assert!(!h.root.path().join(&id).exists());
    assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn cleanup_waits_for_grace_after_completion() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;
    let (tx, mut rx) = NotificationChannel::transport();
    let _guard = h.service.attach_transport(&id, tx).unwrap();

    h.client.emit(0, ProtocolEvent::CredentialsUpdated(json!({ "k": 1 }))).await;
    h.client.emit(0, ProtocolEvent::ConnectionOpen(IDENTITY.into())).await;
    for _ in 0..3 {
        next_push(&mut rx).await;
    }

    // Record lingers in CLOSING while the grace period runs.
    assert_eq!(state_of(&h, &id), Some(SessionState::Closing));
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(h.registry.contains(&id));
    wait_for("session removal", || !h.registry.contains(&id)).await;
}

// ── Scenario B: upload failure ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn upload_failure_notifies_both_sides_and_still_completes() {
    let h = harness_with(FakePublisher::failing(), Branding::default(), None);
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;
    let (tx, mut rx) = NotificationChannel::transport();
    let _guard = h.service.attach_transport(&id, tx).unwrap();

    h.client.emit(0, ProtocolEvent::CredentialsUpdated(json!({ "k": 1 }))).await;
    h.client.emit(0, ProtocolEvent::ConnectionOpen(IDENTITY.into())).await;

    assert_eq!(next_push(&mut rx).await, PushEvent::Connected);
    assert_eq!(
        next_push(&mut rx).await,
        PushEvent::error("Failed to upload session to cloud")
    );
    assert!(matches!(next_push(&mut rx).await, PushEvent::Status { severity: Severity::Info, .. }));

    let texts = h.client.handle(0).sent_texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("Upload Failed"));

    wait_for("session removal", || !h.registry.contains(&id)).await;
}

#[tokio::test(start_paused = true)]
async fn missing_credentials_file_counts_as_upload_failure() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;
    let (tx, mut rx) = NotificationChannel::transport();
    let _guard = h.service.attach_transport(&id, tx).unwrap();

    h.client.emit(0, ProtocolEvent::ConnectionOpen(IDENTITY.into())).await;
    assert_eq!(next_push(&mut rx).await, PushEvent::Connected);
    assert_eq!(
        next_push(&mut rx).await,
        PushEvent::error("Failed to upload session to cloud")
    );
    assert!(h.publisher.uploads.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn join_failure_does_not_block_upload() {
    let branding = Branding {
        community_invite: Some("BAD".into()),
        ..Branding::default()
    };
    let h = harness_with(FakePublisher::succeeding(UPLOAD_LINK), branding, None);
    h.client.fail_joins();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;

    h.client.emit(0, ProtocolEvent::CredentialsUpdated(json!({ "k": 1 }))).await;
    h.client.emit(0, ProtocolEvent::ConnectionOpen(IDENTITY.into())).await;
    wait_for("session removal", || !h.registry.contains(&id)).await;

    assert_eq!(h.publisher.uploads.lock().len(), 1);
    assert_eq!(h.client.handle(0).sent_texts().len(), 2);
}

// ── Scenario C: credentials rejected ─────────────────────────────

#[tokio::test(start_paused = true)]
async fn terminal_close_fails_without_retry() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;
    let (tx, mut rx) = NotificationChannel::transport();
    let _guard = h.service.attach_transport(&id, tx).unwrap();
    let mut events = h.registry.subscribe_events();

    h.client.emit(0, ProtocolEvent::ConnectionClosed(CloseStatus(401))).await;
    assert_eq!(
        next_push(&mut rx).await,
        PushEvent::error("Connection failed. Please try again.")
    );
    wait_for("session removal", || !h.registry.contains(&id)).await;
    assert!(!h.root.path().join(&id).exists());

    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if let pairlink::session::SessionEvent::StateChanged { to, .. } = event {
            saw_failed |= to == SessionState::Failed;
            assert_ne!(to, SessionState::Reconnecting);
        }
    }
    assert!(saw_failed);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.client.connects(), 1);
}

// ── Scenario D: retryable close ──────────────────────────────────

#[tokio::test(start_paused = true)]
async fn retryable_close_reconnects_with_next_generation() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;
    let (tx, mut rx) = NotificationChannel::transport();
    let _guard = h.service.attach_transport(&id, tx).unwrap();

    h.client.emit(0, ProtocolEvent::QrIssued("first".into())).await;
    assert!(matches!(next_push(&mut rx).await, PushEvent::Qr { .. }));

    h.client.emit(0, ProtocolEvent::ConnectionClosed(CloseStatus(428))).await;
    assert_eq!(
        next_push(&mut rx).await,
        PushEvent::status("🔄 Reconnecting...", Severity::Warning)
    );
    let record = h.registry.get(&id).unwrap();
    assert_eq!(record.state, SessionState::Reconnecting);
    assert_eq!(record.generation, 1);
    assert!(record.protocol.is_none());
    wait_for("old handle closed", || h.client.handle(0).close_count() == 1).await;

    // Nothing happens before the delay elapses.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.client.connects(), 1);

    wait_for("reconnect", || h.client.connects() == 2).await;
    let record = h.registry.get(&id).unwrap();
    assert_eq!(record.state, SessionState::Connecting);
    assert_eq!(record.generation, 1);
    assert!(record.protocol.is_some());

    // QR dedupe resets for the new attempt.
    h.client.emit(1, ProtocolEvent::QrIssued("second".into())).await;
    assert!(matches!(next_push(&mut rx).await, PushEvent::Qr { .. }));
}

#[tokio::test(start_paused = true)]
async fn lost_connection_during_settle_reconnects() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;

    h.client.emit(0, ProtocolEvent::ConnectionOpen(IDENTITY.into())).await;
    wait_for("open", || state_of(&h, &id) == Some(SessionState::Open)).await;
    h.client.emit(0, ProtocolEvent::ConnectionClosed(CloseStatus(500))).await;

    wait_for("reconnect", || h.client.connects() == 2).await;
    assert!(h.publisher.uploads.lock().is_empty());
    assert_eq!(state_of(&h, &id), Some(SessionState::Connecting));
}

#[tokio::test(start_paused = true)]
async fn failed_reconnect_attempt_schedules_another() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;
    h.client.fail_next_connects(1);

    h.client.emit(0, ProtocolEvent::ConnectionClosed(CloseStatus(503))).await;
    wait_for("second generation", || {
        h.registry.get(&id).is_some_and(|r| r.generation == 2)
    })
    .await;
    assert_eq!(state_of(&h, &id), Some(SessionState::Reconnecting));

    wait_for("reconnect", || h.client.connects() == 2).await;
    assert_eq!(state_of(&h, &id), Some(SessionState::Connecting));
}

#[tokio::test(start_paused = true)]
async fn reconnect_reuses_persisted_credentials() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;

    h.client.emit(0, ProtocolEvent::CredentialsUpdated(json!({ "noiseKey": "n" }))).await;
    h.client.emit(0, ProtocolEvent::CredentialsUpdated(json!({ "me": { "id": "x" } }))).await;
    h.client.emit(0, ProtocolEvent::ConnectionClosed(CloseStatus(515))).await;
    wait_for("reconnect", || h.client.connects() == 2).await;

    let auth = h.client.handle(1).auth.clone();
    assert_eq!(auth, json!({ "noiseKey": "n", "me": { "id": "x" } }));
    assert!(h.registry.contains(&id));
}

// ── QR dedupe and stale timers ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn repeated_qr_is_pushed_once_per_attempt() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;
    let (tx, mut rx) = NotificationChannel::transport();
    let _guard = h.service.attach_transport(&id, tx).unwrap();

    for n in 0..3 {
        h.client.emit(0, ProtocolEvent::QrIssued(format!("ref-{n}"))).await;
    }
    assert!(matches!(next_push(&mut rx).await, PushEvent::Qr { .. }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert!(h.registry.get(&id).unwrap().qr_delivered);
}

#[tokio::test(start_paused = true)]
async fn unrenderable_qr_reports_one_error_per_attempt() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;
    let (tx, mut rx) = NotificationChannel::transport();
    let _guard = h.service.attach_transport(&id, tx).unwrap();

    // Far beyond the capacity of the largest QR version.
    let oversized = "x".repeat(8_000);
    for _ in 0..3 {
        h.client.emit(0, ProtocolEvent::QrIssued(oversized.clone())).await;
    }
    match next_push(&mut rx).await {
        PushEvent::Error { message } => assert!(message.starts_with("Failed to generate QR code")),
        other => panic!("expected error push, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn qr_before_subscriber_is_delivered_on_reissue() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;

    h.client.emit(0, ProtocolEvent::QrIssued("early".into())).await;
    wait_for("awaiting code", || state_of(&h, &id) == Some(SessionState::AwaitingCode)).await;
    assert!(!h.registry.get(&id).unwrap().qr_delivered);

    let (tx, mut rx) = NotificationChannel::transport();
    let _guard = h.service.attach_transport(&id, tx).unwrap();
    h.client.emit(0, ProtocolEvent::QrIssued("rotated".into())).await;
    assert!(matches!(next_push(&mut rx).await, PushEvent::Qr { .. }));
}

#[tokio::test(start_paused = true)]
async fn reconnect_timer_for_cancelled_session_is_dropped() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;

    h.client.emit(0, ProtocolEvent::ConnectionClosed(CloseStatus(500))).await;
    wait_for("reconnecting", || state_of(&h, &id) == Some(SessionState::Reconnecting)).await;

    assert_eq!(h.service.cancel(&id).await, CleanupOutcome::Released);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.client.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_timer_with_stale_generation_is_ignored() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;

    h.client.emit(0, ProtocolEvent::ConnectionClosed(CloseStatus(500))).await;
    wait_for("reconnecting", || state_of(&h, &id) == Some(SessionState::Reconnecting)).await;

    // Another attempt supersedes the pending timer's generation.
    h.registry.transition(&id, SessionState::Connecting).unwrap();
    assert_eq!(h.registry.begin_reconnect(&id).unwrap(), 2);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.client.connects(), 1);
    assert_eq!(state_of(&h, &id), Some(SessionState::Reconnecting));
}

// ── Reaper / cancel race ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reaper_and_cancel_release_exactly_once() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;
    let max_age = Duration::from_secs(600);
    let later = tokio::time::Instant::now() + max_age + Duration::from_secs(1);

    let (reaped, cancelled) = tokio::join!(
        reaper::sweep(&h.registry, &h.notifier, later, max_age, Duration::from_secs(5)),
        h.service.cancel(&id),
    );
    let releases = reaped.len() + usize::from(cancelled == CleanupOutcome::Released);
    assert_eq!(releases, 1);
    assert!(!h.registry.contains(&id));
    assert_eq!(h.client.handle(0).close_count(), 1);
    assert!(!h.root.path().join(&id).exists());
}

#[tokio::test(start_paused = true)]
async fn reaper_force_closes_stuck_session() {
    let h = harness();
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;
    let reaper = reaper::Reaper::spawn(
        h.registry.clone(),
        h.notifier.clone(),
        Duration::from_secs(300),
        Duration::from_secs(500),
        Duration::from_secs(5),
    );

    // First sweep at 300s finds it too young; the one at 600s reaps it.
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert!(h.registry.contains(&id));
    tokio::time::sleep(Duration::from_secs(300)).await;
    wait_for("reaped", || !h.registry.contains(&id)).await;
    assert_eq!(h.client.handle(0).close_count(), 1);

    reaper.shutdown();
    reaper.join().await;
}

// ── Pairing-code flow ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn pairing_code_flow_returns_code() {
    let h = harness();
    h.client.set_pairing_reply(Ok("WXYZ-1234"));

    let created = h
        .service
        .create_pairing_session(Some("+1 (555) 123-4567"))
        .await
        .unwrap();
    assert_eq!(created.pairing_code.as_deref(), Some("WXYZ-1234"));
    assert_eq!(
        *h.client.handle(0).pairing_requests.lock(),
        vec!["15551234567".to_string()]
    );
    assert_eq!(
        state_of(&h, &created.session_id),
        Some(SessionState::AwaitingCode)
    );

    // QR events are irrelevant to this flow.
    let (tx, mut rx) = NotificationChannel::transport();
    let _guard = h.service.attach_transport(&created.session_id, tx).unwrap();
    h.client.emit(0, ProtocolEvent::QrIssued("ignored".into())).await;
    h.client.emit(0, ProtocolEvent::ConnectionOpen(IDENTITY.into())).await;
    assert_eq!(next_push(&mut rx).await, PushEvent::Connected);
}

#[tokio::test(start_paused = true)]
async fn registered_account_skips_pairing_code() {
    let h = harness();
    h.client.set_registered(true);
    let created = h
        .service
        .create_pairing_session(Some("15551234567"))
        .await
        .unwrap();
    assert!(created.pairing_code.is_none());
    assert!(h.client.handle(0).pairing_requests.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_phone_is_rejected_before_connecting() {
    let h = harness();
    let err = h
        .service
        .create_pairing_session(Some("12-34"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidInput(_)));
    assert_eq!(h.client.connects(), 0);
    assert!(h.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn pairing_request_failure_releases_session() {
    let h = harness();
    h.client.set_pairing_reply(Err("rate limited"));
    let err = h
        .service
        .create_pairing_session(Some("15551234567"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::PairingRequest(_)));
    assert!(h.registry.is_empty());
    assert_eq!(h.client.handle(0).close_count(), 1);
    assert_eq!(std::fs::read_dir(h.root.path()).unwrap().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn pairing_flow_connect_failure_is_returned() {
    let h = harness();
    h.client.fail_next_connects(1);
    let err = h
        .service
        .create_pairing_session(Some("15551234567"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Connect(_)));
    assert!(h.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn qr_flow_connect_failure_retries() {
    let h = harness();
    h.client.fail_next_connects(1);
    let id = h.service.create_pairing_session(None).await.unwrap().session_id;
    assert_eq!(state_of(&h, &id), Some(SessionState::Reconnecting));

    wait_for("reconnect", || h.client.connects() == 1).await;
    assert_eq!(state_of(&h, &id), Some(SessionState::Connecting));
}

// ── Capacity and shutdown ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn capacity_limit_rejects_new_sessions() {
    let h = harness_with(FakePublisher::succeeding(UPLOAD_LINK), Branding::default(), Some(1));
    h.service.create_pairing_session(None).await.unwrap();
    let err = h.service.create_pairing_session(None).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Registry(pairlink::session::RegistryError::MaxSessionsReached)
    ));
    assert_eq!(h.registry.len(), 1);
    assert_eq!(h.client.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_all_releases_every_session() {
    let h = harness();
    for _ in 0..3 {
        h.service.create_pairing_session(None).await.unwrap();
    }
    h.service.shutdown_all().await;
    assert!(h.registry.is_empty());
    for n in 0..3 {
        assert_eq!(h.client.handle(n).close_count(), 1);
    }
}
