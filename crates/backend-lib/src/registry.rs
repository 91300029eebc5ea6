// ============================
// crates/backend-lib/src/registry.rs
// ============================
//! Connected-session registry.
//!
//! Single source of truth for "is user X currently reachable, and on which
//! transport". Populated by the WebSocket layer on connect/disconnect and
//! read by the signaling relay, the location store and the notification
//! fan-out. Lifecycle is bound to process uptime: nothing here touches
//! persistent storage, and a restart drops all live sessions.

use dashmap::DashMap;
use metrics::gauge;
use tokio::sync::mpsc;
use tripline_common::{ConnId, Role, ServerEvent, UserId, UserProfile};

/// A live transport session bound to an authenticated user.
#[derive(Clone)]
pub struct ConnectedSession {
    pub user_id: UserId,
    pub display_name: String,
    pub email: String,
    pub role: Role,
    pub conn_id: ConnId,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectedSession {
    /// Best-effort delivery to this session. A closed channel means the
    /// connection is going away; the caller's primary operation proceeds.
    pub async fn emit(&self, event: ServerEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Registry of live sessions, keyed by user id. Last-connect-wins: a second
/// connection for the same user overwrites the first.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<UserId, ConnectedSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the mapping for this user. Idempotent, no error path.
    pub fn register(&self, profile: &UserProfile, conn_id: ConnId, tx: mpsc::Sender<ServerEvent>) {
        self.sessions.insert(
            profile.user_id.clone(),
            ConnectedSession {
                user_id: profile.user_id.clone(),
                display_name: profile.name.clone(),
                email: profile.email.clone(),
                role: profile.role,
                conn_id,
                tx,
            },
        );
        gauge!(crate::metrics::WS_ACTIVE).set(self.sessions.len() as f64);
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectedSession> {
        self.sessions.get(user_id).map(|s| s.clone())
    }

    /// Remove the session owned by this transport connection, if it is still
    /// the registered one. Returns the user id it was bound to. A session
    /// that was already overwritten by a reconnect is left alone, so a stale
    /// disconnect cannot evict the fresh connection.
    pub fn unregister(&self, conn_id: &str) -> Option<UserId> {
        let user_id = self
            .sessions
            .iter()
            .find(|entry| entry.conn_id == conn_id)
            .map(|entry| entry.key().clone())?;

        let removed = self
            .sessions
            .remove_if(&user_id, |_, session| session.conn_id == conn_id)
            .map(|(key, _)| key);
        gauge!(crate::metrics::WS_ACTIVE).set(self.sessions.len() as f64);
        removed
    }

    /// Best-effort push to a user's live session; `false` when the user is
    /// not connected or the channel is gone.
    pub async fn send_to(&self, user_id: &str, event: ServerEvent) -> bool {
        // Clone the session out before awaiting so no map shard stays locked.
        let Some(session) = self.lookup(user_id) else {
            return false;
        };
        session.emit(event).await
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.len()
    }
}
