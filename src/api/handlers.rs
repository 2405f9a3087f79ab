use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;

use crate::cleanup::CleanupOutcome;
use crate::notify::NotificationChannel;
use crate::session::{FlowKind, SessionState};

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.service.registry().len(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateSessionRequest {
    #[serde(default)]
    phone_number: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateSessionResponse {
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pairing_code: Option<String>,
}

fn ensure_accepting(state: &AppState) -> Result<(), ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }
    Ok(())
}

pub(super) async fn session_create(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    ensure_accepting(&state)?;
    let req: CreateSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?
    };
    let created = state
        .service
        .create_pairing_session(req.phone_number.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: created.session_id,
            pairing_code: created.pairing_code,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub(super) struct CodeQuery {
    number: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CodeResponse {
    session_id: String,
    code: Option<String>,
    message: &'static str,
}

/// Pairing-code flow over a query string, for clients that cannot POST.
pub(super) async fn code(
    State(state): State<AppState>,
    Query(query): Query<CodeQuery>,
) -> Result<Json<CodeResponse>, ApiError> {
    ensure_accepting(&state)?;
    let number = query
        .number
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("phone number is required".into()))?;
    let created = state.service.create_pairing_session(Some(&number)).await?;
    let message = if created.pairing_code.is_some() {
        "Enter this code on your phone to link the account."
    } else {
        "Account already linked; no pairing code needed."
    };
    Ok(Json(CodeResponse {
        session_id: created.session_id,
        code: created.pairing_code,
        message,
    }))
}

/// QR flow: create the session, then the client subscribes for the image.
pub(super) async fn qr(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    ensure_accepting(&state)?;
    let created = state.service.create_pairing_session(None).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: created.session_id,
            pairing_code: None,
        }),
    ))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SessionInfo {
    session_id: String,
    flow: FlowKind,
    state: SessionState,
    generation: u64,
    age_secs: u64,
    subscribed: bool,
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let record = super::get_session(&state, &id)?;
    Ok(Json(SessionInfo {
        subscribed: record.has_subscriber(),
        age_secs: record.created_at.elapsed().as_secs(),
        session_id: record.id,
        flow: record.flow,
        state: record.state,
        generation: record.generation,
    }))
}

pub(super) async fn session_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.service.cancel(&id).await {
        CleanupOutcome::Released => {
            tracing::info!(session_id = %id, "session cancelled by client");
            Ok(StatusCode::NO_CONTENT)
        }
        // Cleanup already underway (completed session in its grace window).
        CleanupOutcome::AlreadyHandled if state.service.registry().contains(&id) => {
            Ok(StatusCode::NO_CONTENT)
        }
        CleanupOutcome::AlreadyHandled => Err(ApiError::SessionNotFound(id)),
    }
}

pub(super) async fn ws_push(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    super::get_session(&state, &id)?;
    Ok(ws.on_upgrade(move |socket| handle_ws_push(socket, state, id)))
}

async fn handle_ws_push(socket: WebSocket, state: AppState, id: String) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (transport, mut events) = NotificationChannel::transport();
    let _attachment = match state.service.attach_transport(&id, transport) {
        Ok(guard) => guard,
        Err(e) => {
            tracing::debug!(session_id = %id, error = %e, "push socket for vanished session");
            let close_frame = CloseFrame {
                code: axum::extract::ws::close_code::NORMAL,
                reason: "session not found".into(),
            };
            let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
            return;
        }
    };
    tracing::debug!(session_id = %id, "push socket attached");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if ws_tx.send(Message::Text(event.to_json().into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Session ended or a newer transport replaced us.
                        let close_frame = CloseFrame {
                            code: axum::extract::ws::close_code::NORMAL,
                            reason: "session ended".into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                        break;
                    }
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(session_id = %id, "push socket received shutdown signal");
                    let close_frame = CloseFrame {
                        code: axum::extract::ws::close_code::AWAY,
                        reason: "server shutting down".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }
    tracing::debug!(session_id = %id, "push socket closed");
}

/// Server-sent-events alternative to the push socket.
pub(super) async fn sse_push(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (transport, events) = NotificationChannel::transport();
    let attachment = state.service.attach_transport(&id, transport)?;
    let (connection, mut shutdown_rx) = state.shutdown.register();
    tracing::debug!(session_id = %id, "event stream attached");

    let stream = ReceiverStream::new(events)
        .map(move |event| {
            // Detach and deregister when the client goes away.
            let _ = (&attachment, &connection);
            Ok(Event::default().event(event.kind()).data(event.to_json()))
        })
        .take_until(async move {
            let _ = shutdown_rx.wait_for(|down| *down).await;
        });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
