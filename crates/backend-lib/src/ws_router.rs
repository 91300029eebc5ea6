// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! WebSocket router and connection handling.
//!
//! One connection = one authenticated session. The handshake must resolve a
//! bearer token to a directory user before the upgrade; afterwards the
//! connection is registered, messages are dispatched to the component
//! stores, and component errors flow back as `error` events rather than
//! dropping the socket. Disconnect synchronously unregisters the session
//! and tears down any calls it was part of.

use crate::error::AppError;
use crate::registry::ConnectedSession;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use tripline_common::{ClientMessage, ServerEvent};

/// Create the WebSocket router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for WebSocket connections: authenticate, then upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(token) = params.get("token") else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    // Unresolvable or expired tokens reject the connection before any
    // session is registered.
    let user_id = match state.tokens.verify(token).await {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!(error = %e, "rejected websocket handshake");
            return e.into_response();
        },
    };
    let profile = match state.users.find_by_id(&user_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            return AppError::Unauthorized(format!("unknown user {user_id}")).into_response()
        },
        Err(e) => return e.into_response(),
    };

    counter!(crate::metrics::WS_CONNECTION).increment(1);
    ws.on_upgrade(move |socket| handle_connection(socket, state, profile))
}

async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    profile: tripline_common::UserProfile,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();

    // Channel for events destined for this client's websocket
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(32);

    state.registry.register(&profile, conn_id.clone(), event_tx.clone());
    // Our own registration, cloned before a later reconnect can overwrite it.
    let session: ConnectedSession = state
        .registry
        .lookup(&profile.user_id)
        .expect("session registered above");

    info!(user_id = %profile.user_id, %conn_id, "session connected");

    // Forward events from the channel to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let json = serde_json::to_string(&event).unwrap_or_default();
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Main task: process incoming WebSocket messages
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    if let Err(e) = dispatch(&state, &session, client_msg).await {
                        // Component failures become error events, never a
                        // dropped connection.
                        let _ = event_tx
                            .send(ServerEvent::Error {
                                code: e.error_code().to_string(),
                                message: e.to_string(),
                            })
                            .await;
                    }
                },
                Err(e) => {
                    debug!(user_id = %session.user_id, error = %e, "malformed client frame");
                    let _ = event_tx
                        .send(ServerEvent::Error {
                            code: "MALFORMED".to_string(),
                            message: e.to_string(),
                        })
                        .await;
                },
            },
            Message::Close(_) => break,
            _ => {}, // axum answers pings itself
        }
    }

    // Cleanup runs inside the disconnect path: deregister the session and
    // stop any call tickers this connection owned.
    state.registry.unregister(&conn_id);
    state.relay.cleanup_for(&conn_id, &session.user_id);

    counter!(crate::metrics::WS_DISCONNECTION).increment(1);
    info!(user_id = %session.user_id, %conn_id, "session disconnected");

    send_task.abort();
}

async fn dispatch(
    state: &AppState,
    session: &ConnectedSession,
    msg: ClientMessage,
) -> Result<(), AppError> {
    match msg {
        ClientMessage::CallOffer {
            to_user_id,
            offer,
            request_type,
        } => {
            state
                .relay
                .relay_offer(session, &to_user_id, offer, &request_type)
                .await
        },
        ClientMessage::CallAnswer { to_user_id, answer } => {
            state.relay.relay_answer(session, &to_user_id, answer).await;
            Ok(())
        },
        ClientMessage::CallAccept { to_user_id } => {
            state.relay.accept_call(session, &to_user_id).await;
            Ok(())
        },
        ClientMessage::CallDecline { to_user_id } => {
            state.relay.decline_call(session, &to_user_id).await;
            Ok(())
        },
        ClientMessage::IceCandidate {
            to_user_id,
            candidate,
        } => {
            state
                .relay
                .relay_ice_candidate(session, &to_user_id, candidate)
                .await;
            Ok(())
        },
        ClientMessage::EndCall { to_user_id } => {
            state.relay.end_call(session, &to_user_id).await;
            Ok(())
        },
        ClientMessage::LocationUpdate {
            latitude,
            longitude,
        } => state
            .locations
            .record_sample(&session.user_id, latitude, longitude)
            .await
            .map(|_| ()),
    }
}
