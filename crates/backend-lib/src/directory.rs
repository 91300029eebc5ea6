// ============================
// crates/backend-lib/src/directory.rs
// ============================
//! External collaborator contracts.
//!
//! The realtime core does not own users, trips, notification persistence or
//! push delivery; it talks to them through these traits. The in-memory
//! implementations back the default binary wiring and the test suite.

use crate::error::AppError;
use crate::scheduler::SweepPlan;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tripline_common::{NotificationRecord, TripId, TripRecord, TripStatus, UserId, UserProfile};

/// User directory lookups consumed by the core.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, user_id: &str) -> Result<Option<UserProfile>, AppError>;

    async fn find_admins(&self) -> Result<Vec<UserProfile>, AppError>;

    /// Clear the "trip ongoing" flag for the given teachers.
    async fn reset_trip_ongoing(&self, user_ids: &[UserId]) -> Result<(), AppError>;

    /// Deactivate licenses that have passed their expiry. Returns how many
    /// were flipped.
    async fn expire_licenses(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Trip directory lookups and bulk updates consumed by the scheduler.
#[async_trait]
pub trait TripDirectory: Send + Sync {
    /// All non-deleted trips.
    async fn load_active(&self) -> Result<Vec<TripRecord>, AppError>;

    /// Apply one sweep plan atomically: a bulk status update per group plus
    /// participant clearing for newly-completed trips. An error leaves every
    /// trip unchanged.
    async fn commit_sweep(&self, plan: &SweepPlan) -> Result<(), AppError>;

    /// Soft-delete completed trips that ended before the cutoff. Returns how
    /// many were removed.
    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Durable notification log. Append-only; errors propagate to the caller.
#[async_trait]
pub trait NotificationLog: Send + Sync {
    async fn create(&self, record: NotificationRecord) -> Result<(), AppError>;
}

/// Outcome of one push delivery attempt.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub token: String,
    pub delivered: bool,
    pub error: Option<String>,
}

/// Push-notification sender (login and reminder flows).
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(
        &self,
        tokens: &[String],
        title: &str,
        body: &str,
    ) -> Result<Vec<PushOutcome>, AppError>;
}

/// In-memory user + trip directory.
#[derive(Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<UserId, UserProfile>>,
    trips: RwLock<HashMap<TripId, TripRecord>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, profile: UserProfile) {
        self.users.write().await.insert(profile.user_id.clone(), profile);
    }

    pub async fn insert_trip(&self, trip: TripRecord) {
        self.trips.write().await.insert(trip.trip_id.clone(), trip);
    }

    pub async fn get_trip(&self, trip_id: &str) -> Option<TripRecord> {
        self.trips.read().await.get(trip_id).cloned()
    }

    pub async fn get_user(&self, user_id: &str) -> Option<UserProfile> {
        self.users.read().await.get(user_id).cloned()
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn find_by_id(&self, user_id: &str) -> Result<Option<UserProfile>, AppError> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn find_admins(&self) -> Result<Vec<UserProfile>, AppError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .filter(|u| u.role == tripline_common::Role::Admin)
            .cloned()
            .collect())
    }

    async fn reset_trip_ongoing(&self, user_ids: &[UserId]) -> Result<(), AppError> {
        let mut users = self.users.write().await;
        for id in user_ids {
            if let Some(user) = users.get_mut(id) {
                user.trip_ongoing = false;
            }
        }
        Ok(())
    }

    async fn expire_licenses(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut users = self.users.write().await;
        let mut expired = 0;
        for user in users.values_mut() {
            if user.license_active {
                if let Some(expires) = user.license_expires_at {
                    if expires <= now {
                        user.license_active = false;
                        expired += 1;
                    }
                }
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl TripDirectory for InMemoryDirectory {
    async fn load_active(&self) -> Result<Vec<TripRecord>, AppError> {
        Ok(self
            .trips
            .read()
            .await
            .values()
            .filter(|t| !t.is_deleted)
            .cloned()
            .collect())
    }

    async fn commit_sweep(&self, plan: &SweepPlan) -> Result<(), AppError> {
        // Single write lock for the whole plan stands in for the database
        // transaction the production directory runs.
        let mut trips = self.trips.write().await;
        for (status, ids) in &plan.transitions {
            for id in ids {
                if let Some(trip) = trips.get_mut(id) {
                    trip.status = *status;
                    if *status == TripStatus::Completed {
                        trip.participants.clear();
                    }
                }
            }
        }
        Ok(())
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let mut trips = self.trips.write().await;
        let mut purged = 0;
        for trip in trips.values_mut() {
            if !trip.is_deleted && trip.status == TripStatus::Completed && trip.end_time < before {
                trip.is_deleted = true;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

/// In-memory notification log with an accessor for assertions.
#[derive(Default)]
pub struct InMemoryNotificationLog {
    records: RwLock<Vec<NotificationRecord>>,
}

impl InMemoryNotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<NotificationRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl NotificationLog for InMemoryNotificationLog {
    async fn create(&self, record: NotificationRecord) -> Result<(), AppError> {
        self.records.write().await.push(record);
        Ok(())
    }
}

/// Push sender that records every dispatch; tokens prefixed with `bad-`
/// report as undeliverable.
#[derive(Default)]
pub struct RecordingPushSender {
    sent: RwLock<Vec<(String, String, String)>>,
}

impl RecordingPushSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl PushSender for RecordingPushSender {
    async fn send(
        &self,
        tokens: &[String],
        title: &str,
        body: &str,
    ) -> Result<Vec<PushOutcome>, AppError> {
        let mut outcomes = Vec::with_capacity(tokens.len());
        let mut sent = self.sent.write().await;
        for token in tokens {
            if token.starts_with("bad-") {
                outcomes.push(PushOutcome {
                    token: token.clone(),
                    delivered: false,
                    error: Some("NotRegistered".to_string()),
                });
            } else {
                sent.push((token.clone(), title.to_string(), body.to_string()));
                outcomes.push(PushOutcome {
                    token: token.clone(),
                    delivered: true,
                    error: None,
                });
            }
        }
        Ok(outcomes)
    }
}
