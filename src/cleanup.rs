use std::time::Duration;

use crate::notify::NotificationChannel;
use crate::session::{SessionRegistry, SessionState};

/// Outcome of a cleanup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// This call performed the release and removed the record.
    Released,
    /// The record was already gone or another caller owns its cleanup.
    AlreadyHandled,
}

/// Release every resource a session holds and remove it from the registry.
///
/// Safe to call concurrently from the orchestrator, the reaper and the
/// API: the first caller claims the record, closes the protocol handle,
/// waits `grace` so readers of the credential directory can finish, deletes
/// the directory and removes the record. Every later caller is a no-op.
///
/// The record only leaves the registry after both handles are released.
/// A failed directory deletion is logged and does not block removal.
pub async fn release_session(
    registry: &SessionRegistry,
    notifier: &NotificationChannel,
    id: &str,
    grace: Duration,
) -> CleanupOutcome {
    let Some((protocol, resource, state)) = registry.claim_cleanup(id) else {
        tracing::debug!(session_id = %id, "cleanup already handled");
        return CleanupOutcome::AlreadyHandled;
    };

    if let Some(handle) = protocol {
        handle.close().await;
        tracing::debug!(session_id = %id, "protocol handle closed");
    }

    if !grace.is_zero() {
        tokio::time::sleep(grace).await;
    }

    match resource.release().await {
        Ok(_) => tracing::debug!(session_id = %id, path = %resource.path().display(), "credential directory removed"),
        Err(e) => tracing::warn!(session_id = %id, error = %e, "failed to remove credential directory"),
    }

    if state == SessionState::Closing {
        if let Err(e) = registry.transition(id, SessionState::Closed) {
            tracing::debug!(session_id = %id, error = %e, "could not mark session closed");
        }
    }
    registry.remove(id);
    notifier.detach(id);
    tracing::info!(session_id = %id, final_state = ?state_after(state), "session cleaned up");
    CleanupOutcome::Released
}

fn state_after(claimed: SessionState) -> SessionState {
    if claimed == SessionState::Closing {
        SessionState::Closed
    } else {
        claimed
    }
}
