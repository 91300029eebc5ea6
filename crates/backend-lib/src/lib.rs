// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Core library for the tripline realtime backend: connected-session
//! registry, location tracking, call signaling, notification fan-out and
//! the trip status scheduler, behind trait seams for the surrounding CRUD
//! services.

pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod location;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod scheduler;
pub mod signaling;
pub mod validation;
pub mod ws_router;

use crate::auth::TokenVerifier;
use crate::config::Settings;
use crate::directory::{NotificationLog, PushSender, TripDirectory, UserDirectory};
use crate::location::LocationStore;
use crate::notify::Notifier;
use crate::registry::SessionRegistry;
use crate::signaling::SignalingRelay;
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all handlers. Every component store is
/// owned here and injected where needed; lifecycle is bound to application
/// start/stop, so tests get a fresh world from `AppState::new`.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub relay: Arc<SignalingRelay>,
    pub locations: Arc<LocationStore>,
    pub notifier: Arc<Notifier>,
    pub users: Arc<dyn UserDirectory>,
    pub trips: Arc<dyn TripDirectory>,
    pub tokens: Arc<dyn TokenVerifier>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        users: Arc<dyn UserDirectory>,
        trips: Arc<dyn TripDirectory>,
        log: Arc<dyn NotificationLog>,
        push: Arc<dyn PushSender>,
        tokens: Arc<dyn TokenVerifier>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let relay = Arc::new(SignalingRelay::new(
            registry.clone(),
            Duration::from_secs(settings.ring_timeout_secs),
        ));
        let locations = Arc::new(LocationStore::new(registry.clone()));
        let notifier = Arc::new(Notifier::new(registry.clone(), users.clone(), log, push));

        Self {
            registry,
            relay,
            locations,
            notifier,
            users,
            trips,
            tokens,
            settings: Arc::new(settings),
        }
    }
}
