//! The client WebSocket endpoint.
//!
//! Flow:
//! 1. Upgrade, register the connection, send `auth_required`.
//! 2. The first frame must be `auth`; everything else closes 1008.
//! 3. Authenticated clients get the full frame surface. Messages from
//!    one socket are processed in receive order; sockets interleave.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use aegis_domain::{Error, ErrorCode};
use aegis_protocol::{
    ClientFrame, FrameType, SpawnPayload, SubscribePayload, TaskPayload, CLOSE_GOING_AWAY,
    CLOSE_OVERLOAD, CLOSE_POLICY,
};

use crate::degradation::DegradationLevel;
use crate::sessions::ClientConnection;
use crate::state::AppState;

/// GET /ws — upgrade to the client protocol.
pub async fn client_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

enum FrameOutcome {
    Continue,
    Close(u16),
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Shed load before doing any work.
    let overloaded = state.degradation.level() == DegradationLevel::Emergency;
    let (frame_tx, mut frame_rx) = mpsc::channel::<ClientFrame>(64);
    let client = if overloaded {
        None
    } else {
        state.clients.register(frame_tx)
    };
    let Some(client) = client else {
        let _ = ws_sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_OVERLOAD,
                reason: "server overloaded".into(),
            })))
            .await;
        return;
    };

    tracing::debug!(client_id = %client.id, "client connected");

    // Writer: serializes outbound frames; a cancelled client gets a
    // protocol close. Policy violations override the default
    // going-away code before cancelling.
    let close_code = Arc::new(parking_lot::Mutex::new((
        CLOSE_GOING_AWAY,
        "server shutting down",
    )));
    let cancel = client.cancel.clone();
    let writer_close = close_code.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = frame_rx.recv() => match frame {
                    Some(frame) => {
                        let Ok(json) = serde_json::to_string(&frame) else { continue };
                        if ws_sink.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    let (code, reason) = *writer_close.lock();
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    client.send(ClientFrame::new(FrameType::AuthRequired));

    loop {
        let msg = tokio::select! {
            _ = client.cancel.cancelled() => break,
            msg = ws_stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => match handle_frame(&state, &client, frame).await {
                        FrameOutcome::Continue => {}
                        FrameOutcome::Close(code) => {
                            *close_code.lock() = (code, "policy violation");
                            // Cancel wakes the writer; it emits the close.
                            client.cancel.cancel();
                            break;
                        }
                    },
                    Err(e) => {
                        client.send(ClientFrame::error(
                            ErrorCode::ValidationError,
                            format!("unparseable frame: {e}"),
                            None,
                        ));
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(client_id = %client.id, error = %e, "socket error");
                break;
            }
        }
    }

    state.clients.remove(&client.id);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    tracing::debug!(client_id = %client.id, "client disconnected");
}

async fn handle_frame(
    state: &AppState,
    client: &Arc<ClientConnection>,
    frame: ClientFrame,
) -> FrameOutcome {
    // Per-client message budget; exceeding it closes 1008.
    let limit = state.config.security.client_messages_per_minute;
    if client.messages.record() > limit {
        client.send(ClientFrame::error(
            ErrorCode::RateLimit,
            "message rate limit exceeded",
            frame.id.clone(),
        ));
        return FrameOutcome::Close(CLOSE_POLICY);
    }

    if !client.is_authenticated() {
        return match frame.frame_type {
            FrameType::Auth => handle_auth(state, client, &frame),
            _ => {
                client.send(ClientFrame::error(
                    ErrorCode::AuthError,
                    "authentication required",
                    frame.id.clone(),
                ));
                FrameOutcome::Close(CLOSE_POLICY)
            }
        };
    }

    let id = frame.id.clone();
    match frame.frame_type {
        FrameType::Ping => {
            let mut pong = ClientFrame::new(FrameType::Pong);
            pong.id = id;
            client.send(pong);
        }
        FrameType::Auth => {
            // Re-auth on a live session is a no-op.
            let mut ok = ClientFrame::new(FrameType::AuthSuccess);
            ok.id = id;
            client.send(ok);
        }
        FrameType::Chat => {
            #[derive(serde::Deserialize)]
            struct ChatPayload {
                message: String,
                #[serde(default)]
                model: Option<String>,
                #[serde(default)]
                stream: bool,
            }
            match frame.parse_payload::<ChatPayload>() {
                Ok(payload) => {
                    let result = state
                        .tasks
                        .chat(
                            None,
                            payload.message,
                            payload.model,
                            payload.stream,
                            Some(client),
                            id.clone(),
                        )
                        .await;
                    reply(client, id, result);
                }
                Err(e) => {
                    client.send(ClientFrame::error(ErrorCode::ValidationError, e, id));
                }
            }
        }
        FrameType::AgentSpawn => match frame.parse_payload::<SpawnPayload>() {
            Ok(payload) => {
                let result = state.tasks.spawn_agent(payload).await;
                reply(client, id, result);
            }
            Err(e) => {
                client.send(ClientFrame::error(ErrorCode::ValidationError, e, id));
            }
        },
        FrameType::AgentTerminate => {
            #[derive(serde::Deserialize)]
            struct TerminatePayload {
                #[serde(rename = "agentId")]
                agent_id: String,
            }
            match frame.parse_payload::<TerminatePayload>() {
                Ok(payload) => {
                    let result = state.tasks.terminate_agent(&payload.agent_id).await;
                    reply(client, id, result);
                }
                Err(e) => {
                    client.send(ClientFrame::error(ErrorCode::ValidationError, e, id));
                }
            }
        }
        FrameType::AgentTask => match frame.parse_payload::<TaskPayload>() {
            Ok(payload) => {
                let result = state.tasks.handle_task(payload, Some(client), id.clone()).await;
                reply(client, id, result);
            }
            Err(e) => {
                client.send(ClientFrame::error(ErrorCode::ValidationError, e, id));
            }
        },
        FrameType::Subscribe => match frame.parse_payload::<SubscribePayload>() {
            Ok(payload) => {
                client.subscribe(&payload.channels);
                let mut ok = ClientFrame::new(FrameType::System)
                    .with_payload(serde_json::json!({ "subscribed": payload.channels }));
                ok.id = id;
                client.send(ok);
            }
            Err(e) => {
                client.send(ClientFrame::error(ErrorCode::ValidationError, e, id));
            }
        },
        FrameType::Unsubscribe => match frame.parse_payload::<SubscribePayload>() {
            Ok(payload) => {
                client.unsubscribe(&payload.channels);
            }
            Err(e) => {
                client.send(ClientFrame::error(ErrorCode::ValidationError, e, id));
            }
        },
        other => {
            client.send(ClientFrame::error(
                ErrorCode::ValidationError,
                format!("unexpected frame type {other:?}"),
                id,
            ));
        }
    }
    FrameOutcome::Continue
}

fn handle_auth(
    state: &AppState,
    client: &Arc<ClientConnection>,
    frame: &ClientFrame,
) -> FrameOutcome {
    let max_failures = state.config.security.auth_max_failures;

    // Once the failure budget is spent, every attempt is rejected until
    // the window rolls, correct token or not.
    if client.auth_failures.count() >= max_failures {
        client.send(
            ClientFrame::new(FrameType::AuthFailed).with_payload(serde_json::json!({
                "code": ErrorCode::AuthError.as_str(),
                "message": "too many failed attempts, retry later",
            })),
        );
        return FrameOutcome::Continue;
    }

    #[derive(serde::Deserialize)]
    struct AuthPayload {
        token: String,
    }
    let token = frame
        .parse_payload::<AuthPayload>()
        .map(|p| p.token)
        .unwrap_or_default();

    let accepted = match (&state.auth_guard, &state.internal_guard) {
        // Dev mode: no token configured, anything passes.
        (None, None) => true,
        (auth, internal) => {
            auth.as_ref().map(|g| g.verify(&token)).unwrap_or(false)
                || internal.as_ref().map(|g| g.verify(&token)).unwrap_or(false)
        }
    };

    if accepted {
        client.set_authenticated();
        let mut ok = ClientFrame::new(FrameType::AuthSuccess)
            .with_payload(serde_json::json!({ "clientId": client.id }));
        ok.id = frame.id.clone();
        client.send(ok);
        FrameOutcome::Continue
    } else {
        let failures = client.auth_failures.record();
        tracing::warn!(client_id = %client.id, failures, "auth failure");
        client.send(
            ClientFrame::new(FrameType::AuthFailed).with_payload(serde_json::json!({
                "code": ErrorCode::AuthError.as_str(),
                "message": "invalid token",
            })),
        );
        FrameOutcome::Continue
    }
}

fn reply(
    client: &Arc<ClientConnection>,
    id: Option<String>,
    result: aegis_domain::Result<crate::tasks::TaskReply>,
) {
    match result {
        Ok(task_reply) => {
            let mut frame = ClientFrame::new(task_reply.frame_type).with_payload(task_reply.payload);
            frame.id = id;
            client.send(frame);
        }
        Err(err) => {
            log_task_error(&err);
            client.send(ClientFrame::error(err.code(), err.client_message(), id));
        }
    }
}

fn log_task_error(err: &Error) {
    match err.code() {
        ErrorCode::InternalError | ErrorCode::ProviderError => {
            tracing::error!(error = %err, "task failed");
        }
        _ => tracing::debug!(error = %err, "task rejected"),
    }
}
