// ============================
// crates/backend-lib/tests/ws_flow.rs
// ============================
//! End-to-end WebSocket flow over real connections: handshake, call
//! signaling between two clients, targeted delivery, and live location
//! updates.

use backend_lib::auth::StaticTokens;
use backend_lib::config::Settings;
use backend_lib::directory::{InMemoryDirectory, InMemoryNotificationLog, RecordingPushSender};
use backend_lib::{ws_router, AppState};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tripline_common::{Role, UserProfile};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn profile(id: &str, role: Role) -> UserProfile {
    UserProfile {
        user_id: id.to_string(),
        name: format!("User {id}"),
        email: format!("{id}@school.example"),
        role,
        push_tokens: vec![],
        trip_ongoing: false,
        license_expires_at: None,
        license_active: true,
    }
}

struct TestServer {
    url: String,
    state: Arc<AppState>,
    directory: Arc<InMemoryDirectory>,
}

async fn start_server() -> TestServer {
    let directory = Arc::new(InMemoryDirectory::new());
    let tokens = Arc::new(StaticTokens::new());
    for id in ["alice", "bob", "carol"] {
        directory.insert_user(profile(id, Role::Participant)).await;
        tokens.insert(format!("tok-{id}"), id).await;
    }

    let state = Arc::new(AppState::new(
        Settings::default(),
        directory.clone(),
        directory.clone(),
        Arc::new(InMemoryNotificationLog::new()),
        Arc::new(RecordingPushSender::new()),
        tokens,
    ));

    let app = ws_router::create_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        url: format!("ws://{addr}/ws"),
        state,
        directory,
    }
}

async fn connect(server: &TestServer, token: &str) -> WsClient {
    let (ws, _) = connect_async(format!("{}?token={token}", server.url))
        .await
        .expect("handshake");
    ws
}

async fn send(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(tungstenite::Message::text(value.to_string()))
        .await
        .unwrap();
}

/// Read events until one with the wanted `type` tag arrives, skipping
/// interleaved traffic such as duration ticks.
async fn next_event_of(ws: &mut WsClient, wanted: &str) -> serde_json::Value {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match ws.next().await.expect("stream open").expect("frame") {
                tungstenite::Message::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == wanted {
                        return value;
                    }
                },
                tungstenite::Message::Close(_) => panic!("connection closed"),
                _ => {},
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no '{wanted}' event within {deadline:?}"))
}

/// Assert that no text frame arrives within the window.
async fn assert_silent(ws: &mut WsClient, window: Duration) {
    let got = tokio::time::timeout(window, ws.next()).await;
    match got {
        Err(_) => {},
        Ok(Some(Ok(tungstenite::Message::Text(text)))) => {
            panic!("expected silence, got {text}")
        },
        Ok(other) => panic!("expected silence, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_rejects_bad_token() {
    let server = start_server().await;
    let err = connect_async(format!("{}?token=tok-nobody", server.url)).await;
    match err {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        },
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_call_flow_between_two_clients() {
    let server = start_server().await;
    let mut alice = connect(&server, "tok-alice").await;
    let mut bob = connect(&server, "tok-bob").await;
    let mut carol = connect(&server, "tok-carol").await;

    send(
        &mut alice,
        serde_json::json!({
            "type": "call-offer",
            "toUserId": "bob",
            "offer": {"sdp": "v=0"},
            "requestType": "video",
        }),
    )
    .await;

    let incoming = next_event_of(&mut bob, "incoming_call").await;
    assert_eq!(incoming["callerId"], "alice");
    let offer = next_event_of(&mut bob, "offer").await;
    assert_eq!(offer["from"], "alice");
    assert_eq!(offer["requestType"], "video");

    // targeted delivery: the third session sees none of it
    assert_silent(&mut carol, Duration::from_millis(300)).await;

    send(&mut bob, serde_json::json!({"type": "call-accept", "toUserId": "alice"})).await;
    let accepted = next_event_of(&mut alice, "call_accepted").await;
    assert_eq!(accepted["status"], "accepted");

    send(
        &mut bob,
        serde_json::json!({
            "type": "ice-candidate",
            "toUserId": "alice",
            "candidate": {"candidate": "c0"},
        }),
    )
    .await;
    let ice = next_event_of(&mut alice, "ice-candidate").await;
    assert_eq!(ice["from"], "bob");
    assert_silent(&mut carol, Duration::from_millis(300)).await;

    send(&mut alice, serde_json::json!({"type": "end-call", "toUserId": "bob"})).await;
    let ended_alice = next_event_of(&mut alice, "call-ended").await;
    let ended_bob = next_event_of(&mut bob, "call-ended").await;
    assert!(ended_alice["totalSeconds"].as_u64().unwrap() <= 2);
    assert_eq!(ended_alice["totalSeconds"], ended_bob["totalSeconds"]);
    assert_eq!(server.state.relay.active_calls(), 0);
}

#[tokio::test]
async fn test_offer_to_offline_user_yields_error_event() {
    let server = start_server().await;
    let mut alice = connect(&server, "tok-alice").await;

    send(
        &mut alice,
        serde_json::json!({
            "type": "call-offer",
            "toUserId": "bob",
            "offer": {},
            "requestType": "audio",
        }),
    )
    .await;

    let error = next_event_of(&mut alice, "error").await;
    assert_eq!(error["code"], "NF_001");
}

#[tokio::test]
async fn test_malformed_frame_yields_error_event() {
    let server = start_server().await;
    let mut alice = connect(&server, "tok-alice").await;

    alice
        .send(tungstenite::Message::text("{not json"))
        .await
        .unwrap();
    let error = next_event_of(&mut alice, "error").await;
    assert_eq!(error["code"], "MALFORMED");
}

#[tokio::test]
async fn test_location_update_round_trip() {
    let server = start_server().await;
    let mut alice = connect(&server, "tok-alice").await;

    let user = server.directory.get_user("alice").await.unwrap();
    server
        .state
        .locations
        .request_tracking(&user, chrono::Duration::hours(1))
        .await;
    let request = next_event_of(&mut alice, "locationRequest").await;
    assert_eq!(request["userId"], "alice");

    send(
        &mut alice,
        serde_json::json!({
            "type": "location-update",
            "latitude": 48.2082,
            "longitude": 16.3738,
        }),
    )
    .await;
    let updated = next_event_of(&mut alice, "locationUpdated").await;
    assert_eq!(updated["userId"], "alice");
    assert_eq!(updated["isTrackingEnabled"], true);

    let track = server.state.locations.track_snapshot("alice").unwrap();
    assert_eq!(track.samples.len(), 1);
}

#[tokio::test]
async fn test_disconnect_cleans_up_session_and_calls() {
    let server = start_server().await;
    let mut alice = connect(&server, "tok-alice").await;
    let mut bob = connect(&server, "tok-bob").await;

    send(
        &mut alice,
        serde_json::json!({
            "type": "call-offer",
            "toUserId": "bob",
            "offer": {},
            "requestType": "audio",
        }),
    )
    .await;
    next_event_of(&mut bob, "offer").await;
    assert_eq!(server.state.relay.active_calls(), 1);

    alice.close(None).await.unwrap();

    // Disconnect handling runs in the server's connection task.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.state.registry.lookup("alice").is_some()
        || server.state.relay.active_calls() > 0
    {
        assert!(tokio::time::Instant::now() < deadline, "cleanup did not run");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
