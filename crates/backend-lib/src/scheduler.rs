// ============================
// crates/backend-lib/src/scheduler.rs
// ============================
//! Trip Status Scheduler
//!
//! Periodic reconciliation of derived trip state, independent of request
//! traffic. Status is a pure function of wall-clock time and the trip's
//! window; `cancelled` is a terminal override the sweep never reassigns.
//! Each sweep builds one plan (bulk update per target status, completion
//! cascades) and hands it to the trip directory, which applies it
//! atomically. Sweep errors are logged and swallowed: state stays as it was
//! until the next tick.

use crate::directory::{TripDirectory, UserDirectory};
use crate::error::AppError;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};
use tripline_common::{TripId, TripRecord, TripStatus, UserId};

/// Completed trips are soft-deleted by the daily sweep once they are this old.
const COMPLETED_RETENTION_DAYS: i64 = 30;

/// Derive a trip's status from the clock. `now >= end` wins over
/// `now >= start`, so a trip is never stuck planned at its exact start
/// instant. `Cancelled` is handled by the caller, never produced here.
pub fn classify(now: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> TripStatus {
    if now >= end {
        TripStatus::Completed
    } else if now >= start {
        TripStatus::Ongoing
    } else {
        TripStatus::Planned
    }
}

/// One sweep's worth of changes, grouped so the directory can issue a single
/// bulk update per target status.
#[derive(Debug, Default, Clone)]
pub struct SweepPlan {
    pub transitions: Vec<(TripStatus, Vec<TripId>)>,
    /// Teachers whose "trip ongoing" flag resets because a trip of theirs
    /// just completed.
    pub completed_teachers: Vec<UserId>,
}

impl SweepPlan {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.iter().map(|(_, ids)| ids.len()).sum()
    }
}

/// Build the plan for one sweep over the loaded trips.
pub fn plan_sweep(now: DateTime<Utc>, trips: &[TripRecord]) -> SweepPlan {
    let mut groups: HashMap<TripStatus, Vec<TripId>> = HashMap::new();
    let mut completed_teachers: Vec<UserId> = Vec::new();

    for trip in trips {
        if trip.is_deleted || trip.status == TripStatus::Cancelled {
            continue;
        }
        let derived = classify(now, trip.start_time, trip.end_time);
        if derived == trip.status {
            continue;
        }
        groups.entry(derived).or_default().push(trip.trip_id.clone());
        if derived == TripStatus::Completed && !completed_teachers.contains(&trip.created_by) {
            completed_teachers.push(trip.created_by.clone());
        }
    }

    // stable group order keeps the plan deterministic for the directory
    let mut transitions: Vec<(TripStatus, Vec<TripId>)> = Vec::new();
    for status in [TripStatus::Planned, TripStatus::Ongoing, TripStatus::Completed] {
        if let Some(ids) = groups.remove(&status) {
            transitions.push((status, ids));
        }
    }

    SweepPlan {
        transitions,
        completed_teachers,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub examined: usize,
    pub transitioned: usize,
    pub completed: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DailyStats {
    pub licenses_expired: u64,
    pub trips_purged: u64,
}

pub struct StatusScheduler {
    trips: Arc<dyn TripDirectory>,
    users: Arc<dyn UserDirectory>,
}

impl StatusScheduler {
    pub fn new(trips: Arc<dyn TripDirectory>, users: Arc<dyn UserDirectory>) -> Self {
        Self { trips, users }
    }

    /// One status sweep: load, classify, batch-apply, cascade.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepStats, AppError> {
        let trips = self.trips.load_active().await?;
        let plan = plan_sweep(now, &trips);

        let mut stats = SweepStats {
            examined: trips.len(),
            transitioned: plan.transition_count(),
            completed: 0,
        };
        if plan.is_empty() {
            return Ok(stats);
        }

        self.trips.commit_sweep(&plan).await?;

        if let Some((_, completed_ids)) = plan
            .transitions
            .iter()
            .find(|(status, _)| *status == TripStatus::Completed)
        {
            stats.completed = completed_ids.len();
            self.users.reset_trip_ongoing(&plan.completed_teachers).await?;
        }

        counter!(crate::metrics::TRIP_TRANSITIONS).increment(stats.transitioned as u64);
        Ok(stats)
    }

    /// Daily housekeeping: deactivate expired licenses and soft-delete old
    /// completed trips.
    pub async fn daily_sweep_once(&self, now: DateTime<Utc>) -> Result<DailyStats, AppError> {
        let licenses_expired = self.users.expire_licenses(now).await?;
        let trips_purged = self
            .trips
            .purge_completed(now - Duration::days(COMPLETED_RETENTION_DAYS))
            .await?;
        Ok(DailyStats {
            licenses_expired,
            trips_purged,
        })
    }
}

/// Run status sweeps forever. Errors are logged and the loop keeps going;
/// the scheduler must never take the host process down.
pub fn spawn_status_sweeps(
    scheduler: Arc<StatusScheduler>,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            counter!(crate::metrics::TRIP_SWEEPS).increment(1);
            match scheduler.sweep_once(Utc::now()).await {
                Ok(stats) if stats.transitioned > 0 => {
                    info!(
                        examined = stats.examined,
                        transitioned = stats.transitioned,
                        completed = stats.completed,
                        "trip status sweep applied"
                    );
                },
                Ok(_) => {},
                Err(e) => error!(error = %e, "trip status sweep failed, retrying next tick"),
            }
        }
    })
}

/// Run the daily sweep forever, same failure policy as the status sweep.
pub fn spawn_daily_sweeps(
    scheduler: Arc<StatusScheduler>,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match scheduler.daily_sweep_once(Utc::now()).await {
                Ok(stats) => {
                    if stats.licenses_expired > 0 || stats.trips_purged > 0 {
                        info!(
                            licenses_expired = stats.licenses_expired,
                            trips_purged = stats.trips_purged,
                            "daily sweep applied"
                        );
                    }
                },
                Err(e) => error!(error = %e, "daily sweep failed, retrying next tick"),
            }
        }
    })
}
