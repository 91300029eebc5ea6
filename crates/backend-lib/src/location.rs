// ============================
// crates/backend-lib/src/location.rs
// ============================
//! Location Store
//!
//! Rolling, bounded location history per user plus a trip-scoped,
//! time-boxed tracking window. The store owns:
//! - one `LocationTrack` per user, created on the first tracking request
//! - a bounded live sample buffer (capacity 100, oldest dropped on overflow)
//! - an archival buffer that keeps history out of the live buffer without
//!   losing it for export
//! - the tracking window: once `expires_at` passes, tracking flips off and
//!   late samples are rejected
//!
//! Mutations are serialized per user through the map's entry locking; live
//! events are emitted only after the entry lock is released. Expiry is
//! checked lazily on every sample and additionally by a periodic sweep so a
//! silent track cannot stay enabled forever.

use crate::error::AppError;
use crate::registry::SessionRegistry;
use crate::validation;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use metrics::counter;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};
use tripline_common::{LocationSample, ServerEvent, UserId, UserProfile};

/// Maximum number of live samples kept per user.
pub const SAMPLE_CAPACITY: usize = 100;

/// Per-user tracking state. Soft-deleted rows are kept but invisible.
#[derive(Debug, Clone)]
pub struct LocationTrack {
    pub user_id: UserId,
    pub latitude: f64,
    pub longitude: f64,
    pub tracking_enabled: bool,
    pub expires_at: DateTime<Utc>,
    pub samples: VecDeque<LocationSample>,
    pub archived: Vec<LocationSample>,
    pub is_deleted: bool,
}

/// Result of recording a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleOutcome {
    Recorded,
    /// The window had already expired; tracking was switched off and the
    /// sample dropped. Subsequent samples fail with `NotFound`.
    TrackingStopped,
}

/// Export row: archived history first, then the live buffer.
#[derive(Debug, Clone)]
pub struct TrackedData {
    pub user_id: UserId,
    pub tracking_enabled: bool,
    pub expires_at: DateTime<Utc>,
    pub samples: Vec<LocationSample>,
}

pub struct LocationStore {
    tracks: DashMap<UserId, LocationTrack>,
    registry: Arc<SessionRegistry>,
}

impl LocationStore {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            tracks: DashMap::new(),
            registry,
        }
    }

    /// Open (or refresh) a tracking window for `user` and notify their live
    /// session. Upsert: calling this twice never duplicates the track row.
    pub async fn request_tracking(&self, user: &UserProfile, window: Duration) {
        let expires_at = Utc::now() + window;
        self.tracks
            .entry(user.user_id.clone())
            .and_modify(|track| {
                track.tracking_enabled = true;
                track.expires_at = expires_at;
                track.is_deleted = false;
            })
            .or_insert_with(|| LocationTrack {
                user_id: user.user_id.clone(),
                latitude: 0.0,
                longitude: 0.0,
                tracking_enabled: true,
                expires_at,
                samples: VecDeque::new(),
                archived: Vec::new(),
                is_deleted: false,
            });

        info!(user_id = %user.user_id, %expires_at, "location tracking requested");

        // No-op when the user has no live session.
        self.registry
            .send_to(
                &user.user_id,
                ServerEvent::LocationRequest {
                    user_id: user.user_id.clone(),
                    name: user.name.clone(),
                },
            )
            .await;
    }

    /// Record one coordinate sample for `user_id`.
    pub async fn record_sample(
        &self,
        user_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<SampleOutcome, AppError> {
        validation::validate_coordinates(latitude, longitude)?;
        let now = Utc::now();

        let event = {
            let mut track = self
                .tracks
                .get_mut(user_id)
                .filter(|t| !t.is_deleted)
                .ok_or_else(|| AppError::NotFound(format!("no location track for user {user_id}")))?;

            if !track.tracking_enabled {
                return Err(AppError::NotFound(format!(
                    "tracking disabled for user {user_id}"
                )));
            }

            if now >= track.expires_at {
                track.tracking_enabled = false;
                debug!(user_id, "tracking window expired, dropping late sample");
                return Ok(SampleOutcome::TrackingStopped);
            }

            if track.samples.len() >= SAMPLE_CAPACITY {
                track.samples.pop_front();
            }
            track.samples.push_back(LocationSample {
                latitude,
                longitude,
                timestamp: now,
            });
            track.latitude = latitude;
            track.longitude = longitude;

            ServerEvent::LocationUpdated {
                user_id: user_id.to_string(),
                latitude,
                longitude,
                is_tracking_enabled: true,
                time: now,
            }
            // entry lock released here, before any await
        };

        counter!(crate::metrics::LOCATION_SAMPLES).increment(1);
        self.registry.send_to(user_id, event).await;
        Ok(SampleOutcome::Recorded)
    }

    /// Extend the tracking window. `raw` is a plain integer (minutes),
    /// `<N>m` or `<N>h`; any other shape is a validation error. Returns the
    /// new expiry.
    pub fn extend_window(&self, user_id: &str, raw: &str) -> Result<DateTime<Utc>, AppError> {
        let delta = validation::parse_extension(raw)?;
        let mut track = self
            .tracks
            .get_mut(user_id)
            .filter(|t| !t.is_deleted)
            .ok_or_else(|| AppError::NotFound(format!("no location track for user {user_id}")))?;
        track.expires_at += delta;
        Ok(track.expires_at)
    }

    /// Move the live buffer into the archival sequence. Returns how many
    /// samples were archived.
    pub fn archive(&self, user_id: &str) -> Result<usize, AppError> {
        let mut track = self
            .tracks
            .get_mut(user_id)
            .filter(|t| !t.is_deleted)
            .ok_or_else(|| AppError::NotFound(format!("no location track for user {user_id}")))?;
        let moved = track.samples.len();
        let drained: Vec<LocationSample> = track.samples.drain(..).collect();
        track.archived.extend(drained);
        Ok(moved)
    }

    /// Soft-delete a track. The row stays; reads and samples treat it as gone.
    pub fn soft_delete(&self, user_id: &str) -> Result<(), AppError> {
        let mut track = self
            .tracks
            .get_mut(user_id)
            .ok_or_else(|| AppError::NotFound(format!("no location track for user {user_id}")))?;
        track.is_deleted = true;
        track.tracking_enabled = false;
        Ok(())
    }

    /// Export every visible track, archived samples first, then live.
    pub fn get_all_tracked_data(&self) -> Vec<TrackedData> {
        self.tracks
            .iter()
            .filter(|t| !t.is_deleted)
            .map(|track| {
                let mut samples = track.archived.clone();
                samples.extend(track.samples.iter().cloned());
                TrackedData {
                    user_id: track.user_id.clone(),
                    tracking_enabled: track.tracking_enabled,
                    expires_at: track.expires_at,
                    samples,
                }
            })
            .collect()
    }

    pub fn track_snapshot(&self, user_id: &str) -> Option<LocationTrack> {
        self.tracks
            .get(user_id)
            .filter(|t| !t.is_deleted)
            .map(|t| t.clone())
    }

    /// Flip `tracking_enabled` on every track whose window has passed.
    /// Returns how many were disabled.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for mut track in self.tracks.iter_mut() {
            if track.tracking_enabled && now >= track.expires_at {
                track.tracking_enabled = false;
                expired += 1;
            }
        }
        if expired > 0 {
            counter!(crate::metrics::LOCATION_TRACKS_EXPIRED).increment(expired as u64);
            info!(expired, "disabled expired location tracks");
        }
        expired
    }
}

/// Periodic expiry sweep, bounding how long a silent track can stay enabled
/// past its window.
pub fn spawn_expiry_sweep(
    store: Arc<LocationStore>,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            store.sweep_expired(Utc::now());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tripline_common::Role;

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            user_id: id.to_string(),
            name: format!("User {id}"),
            email: format!("{id}@school.example"),
            role: Role::Participant,
            push_tokens: vec![],
            trip_ongoing: false,
            license_expires_at: None,
            license_active: true,
        }
    }

    fn store() -> LocationStore {
        LocationStore::new(Arc::new(SessionRegistry::new()))
    }

    #[tokio::test]
    async fn test_samples_accumulate_up_to_capacity() {
        let store = store();
        store.request_tracking(&profile("u1"), Duration::hours(1)).await;

        for i in 0..5 {
            let outcome = store
                .record_sample("u1", 48.0 + f64::from(i) * 0.001, 16.0)
                .await
                .unwrap();
            assert_eq!(outcome, SampleOutcome::Recorded);
        }

        let track = store.track_snapshot("u1").unwrap();
        assert_eq!(track.samples.len(), 5);
        assert!((track.latitude - 48.004).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let store = store();
        store.request_tracking(&profile("u1"), Duration::hours(1)).await;

        for i in 0..(SAMPLE_CAPACITY + 5) {
            store
                .record_sample("u1", 10.0 + i as f64 * 0.0001, 20.0)
                .await
                .unwrap();
        }

        let track = store.track_snapshot("u1").unwrap();
        assert_eq!(track.samples.len(), SAMPLE_CAPACITY);
        // the first five samples are gone, the newest is last
        assert!((track.samples.front().unwrap().latitude - 10.0005).abs() < 1e-9);
        assert!(
            (track.samples.back().unwrap().latitude - (10.0 + 104.0 * 0.0001)).abs() < 1e-9
        );
    }

    #[tokio::test]
    async fn test_sample_without_track_fails() {
        let store = store();
        assert!(matches!(
            store.record_sample("u1", 48.0, 16.0).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_window_stops_then_rejects() {
        let store = store();
        store.request_tracking(&profile("u1"), Duration::zero()).await;

        // first late sample flips tracking off without appending
        let outcome = store.record_sample("u1", 48.0, 16.0).await.unwrap();
        assert_eq!(outcome, SampleOutcome::TrackingStopped);
        let track = store.track_snapshot("u1").unwrap();
        assert!(!track.tracking_enabled);
        assert!(track.samples.is_empty());

        // subsequent samples fail instead of silently succeeding
        assert!(matches!(
            store.record_sample("u1", 48.0, 16.0).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_request_tracking_is_idempotent_upsert() {
        let store = store();
        let user = profile("u1");
        store.request_tracking(&user, Duration::hours(1)).await;
        store.record_sample("u1", 48.0, 16.0).await.unwrap();
        store.request_tracking(&user, Duration::hours(2)).await;

        assert_eq!(store.get_all_tracked_data().len(), 1);
        // re-request re-enables but keeps history
        let track = store.track_snapshot("u1").unwrap();
        assert!(track.tracking_enabled);
        assert_eq!(track.samples.len(), 1);
    }

    #[tokio::test]
    async fn test_rerequest_reenables_expired_track() {
        let store = store();
        let user = profile("u1");
        store.request_tracking(&user, Duration::zero()).await;
        assert_eq!(
            store.record_sample("u1", 48.0, 16.0).await.unwrap(),
            SampleOutcome::TrackingStopped
        );

        store.request_tracking(&user, Duration::hours(1)).await;
        assert_eq!(
            store.record_sample("u1", 48.0, 16.0).await.unwrap(),
            SampleOutcome::Recorded
        );
    }

    #[tokio::test]
    async fn test_extend_window() {
        let store = store();
        store.request_tracking(&profile("u1"), Duration::hours(1)).await;
        let before = store.track_snapshot("u1").unwrap().expires_at;

        let after = store.extend_window("u1", "30m").unwrap();
        assert_eq!(after - before, Duration::minutes(30));

        let after2 = store.extend_window("u1", "2h").unwrap();
        assert_eq!(after2 - after, Duration::hours(2));

        let after3 = store.extend_window("u1", "45").unwrap();
        assert_eq!(after3 - after2, Duration::minutes(45));

        assert!(matches!(
            store.extend_window("u1", "later"),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            store.extend_window("u2", "30m"),
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_archive_then_export_orders_archived_first() {
        let store = store();
        store.request_tracking(&profile("u1"), Duration::hours(1)).await;

        store.record_sample("u1", 1.0, 1.0).await.unwrap();
        store.record_sample("u1", 2.0, 2.0).await.unwrap();
        assert_eq!(store.archive("u1").unwrap(), 2);
        store.record_sample("u1", 3.0, 3.0).await.unwrap();

        let track = store.track_snapshot("u1").unwrap();
        assert_eq!(track.archived.len(), 2);
        assert_eq!(track.samples.len(), 1);

        let export = store.get_all_tracked_data();
        assert_eq!(export.len(), 1);
        let lats: Vec<f64> = export[0].samples.iter().map(|s| s.latitude).collect();
        assert_eq!(lats, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_soft_delete_hides_track() {
        let store = store();
        store.request_tracking(&profile("u1"), Duration::hours(1)).await;
        store.soft_delete("u1").unwrap();

        assert!(store.track_snapshot("u1").is_none());
        assert!(store.get_all_tracked_data().is_empty());
        assert!(matches!(
            store.record_sample("u1", 48.0, 16.0).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_disables_expired_tracks() {
        let store = store();
        store.request_tracking(&profile("u1"), Duration::zero()).await;
        store.request_tracking(&profile("u2"), Duration::hours(1)).await;

        assert_eq!(store.sweep_expired(Utc::now()), 1);
        assert!(!store.track_snapshot("u1").unwrap().tracking_enabled);
        assert!(store.track_snapshot("u2").unwrap().tracking_enabled);

        // already-disabled tracks are not counted again
        assert_eq!(store.sweep_expired(Utc::now()), 0);
    }

    #[tokio::test]
    async fn test_invalid_coordinates_rejected() {
        let store = store();
        store.request_tracking(&profile("u1"), Duration::hours(1)).await;
        assert!(matches!(
            store.record_sample("u1", 91.0, 16.0).await,
            Err(AppError::Validation(_))
        ));
        assert!(store.track_snapshot("u1").unwrap().samples.is_empty());
    }

    #[tokio::test]
    async fn test_events_reach_live_session() {
        let registry = Arc::new(SessionRegistry::new());
        let store = LocationStore::new(registry.clone());
        let user = profile("u1");

        let (tx, mut rx) = mpsc::channel(8);
        registry.register(&user, "conn-1".to_string(), tx);

        store.request_tracking(&user, Duration::hours(1)).await;
        match rx.recv().await.unwrap() {
            ServerEvent::LocationRequest { user_id, name } => {
                assert_eq!(user_id, "u1");
                assert_eq!(name, "User u1");
            },
            other => panic!("Expected LocationRequest, got {other:?}"),
        }

        store.record_sample("u1", 48.0, 16.0).await.unwrap();
        match rx.recv().await.unwrap() {
            ServerEvent::LocationUpdated {
                user_id,
                latitude,
                is_tracking_enabled,
                ..
            } => {
                assert_eq!(user_id, "u1");
                assert!((latitude - 48.0).abs() < f64::EPSILON);
                assert!(is_tracking_enabled);
            },
            other => panic!("Expected LocationUpdated, got {other:?}"),
        }
    }
}
