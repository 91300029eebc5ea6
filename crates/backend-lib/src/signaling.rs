// ============================
// crates/backend-lib/src/signaling.rs
// ============================
//! Signaling Relay
//!
//! Rendezvous for call negotiation between two registered sessions. The
//! relay forwards offers, answers and ICE candidates without touching media,
//! keeps an `ActiveCall` entry per call attempt and runs a 1 Hz duration
//! ticker that reports elapsed seconds to both parties.
//!
//! Per call attempt: `offered -> (answered | declined | timed-out) -> ended`.
//! An offer left unanswered past the ring timeout is declined with status
//! `timed-out`. Ending an unknown call is a silent no-op. When a session
//! disconnects, every call referencing it has its ticker stopped and its
//! entry removed; failure to stop one ticker must not keep others alive.
//!
//! ICE candidates go to the target session only. Nothing in the relay ever
//! broadcasts.

use crate::error::AppError;
use crate::registry::{ConnectedSession, SessionRegistry};
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tripline_common::{CallKind, ConnId, ServerEvent, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Offered,
    Answered,
}

struct ActiveCall {
    call_id: String,
    caller_conn: ConnId,
    caller_user: UserId,
    callee_user: UserId,
    started: Instant,
    state: CallState,
    ticker: Option<AbortHandle>,
}

/// Derive the call id from the caller's transport id and the callee's user id.
fn call_key(caller_conn: &str, callee_user: &str) -> String {
    format!("{caller_conn}#{callee_user}")
}

pub struct SignalingRelay {
    calls: Arc<DashMap<String, ActiveCall>>,
    registry: Arc<SessionRegistry>,
    ring_timeout: Duration,
}

impl SignalingRelay {
    pub fn new(registry: Arc<SessionRegistry>, ring_timeout: Duration) -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            registry,
            ring_timeout,
        }
    }

    /// Relay a call offer to `to_user_id` and start the duration ticker.
    ///
    /// Fails with `Validation` for an unrecognized call kind and `NotFound`
    /// when the target has no live session; the transport layer turns either
    /// into an `error` event for the offerer instead of dropping the
    /// connection.
    pub async fn relay_offer(
        &self,
        caller: &ConnectedSession,
        to_user_id: &str,
        offer: serde_json::Value,
        request_type: &str,
    ) -> Result<(), AppError> {
        let kind = CallKind::parse(request_type).ok_or_else(|| {
            AppError::Validation(format!("unrecognized call kind '{request_type}'"))
        })?;

        let target = self
            .registry
            .lookup(to_user_id)
            .ok_or_else(|| AppError::NotFound(format!("user {to_user_id} is not reachable")))?;

        let call_id = call_key(&caller.conn_id, to_user_id);

        // A re-offer over the same pair replaces the previous attempt.
        if let Some((_, stale)) = self.calls.remove(&call_id) {
            if let Some(ticker) = stale.ticker {
                ticker.abort();
            }
        }

        target
            .emit(ServerEvent::IncomingCall {
                call_id: call_id.clone(),
                caller_id: caller.user_id.clone(),
                message: format!("Incoming {} call from {}", kind.as_str(), caller.display_name),
            })
            .await;
        target
            .emit(ServerEvent::Offer {
                from: caller.user_id.clone(),
                offer,
                user_id: caller.user_id.clone(),
                request_type: kind,
            })
            .await;

        self.calls.insert(
            call_id.clone(),
            ActiveCall {
                call_id: call_id.clone(),
                caller_conn: caller.conn_id.clone(),
                caller_user: caller.user_id.clone(),
                callee_user: to_user_id.to_string(),
                started: Instant::now(),
                state: CallState::Offered,
                ticker: None,
            },
        );

        let ticker = spawn_ticker(
            self.calls.clone(),
            self.registry.clone(),
            call_id.clone(),
            caller.user_id.clone(),
            to_user_id.to_string(),
            self.ring_timeout,
        );
        match self.calls.get_mut(&call_id) {
            Some(mut call) => call.ticker = Some(ticker),
            // call was torn down before the ticker handle landed
            None => ticker.abort(),
        }

        counter!(crate::metrics::CALL_STARTED).increment(1);
        gauge!(crate::metrics::CALL_ACTIVE).set(self.calls.len() as f64);
        info!(%call_id, caller = %caller.user_id, callee = to_user_id, kind = kind.as_str(), "call offered");
        Ok(())
    }

    /// Forward an SDP answer to the offerer. Pure forwarding; the state
    /// transition happens on the accept signal.
    pub async fn relay_answer(
        &self,
        from: &ConnectedSession,
        to_user_id: &str,
        answer: serde_json::Value,
    ) {
        let delivered = self
            .registry
            .send_to(
                to_user_id,
                ServerEvent::OfferAnswer {
                    from: from.user_id.clone(),
                    answer,
                },
            )
            .await;
        if !delivered {
            warn!(from = %from.user_id, to = to_user_id, "answer target not reachable");
        }
    }

    /// Forward an ICE candidate to the target session only.
    pub async fn relay_ice_candidate(
        &self,
        from: &ConnectedSession,
        to_user_id: &str,
        candidate: serde_json::Value,
    ) {
        let delivered = self
            .registry
            .send_to(
                to_user_id,
                ServerEvent::IceCandidate {
                    from: from.user_id.clone(),
                    candidate,
                },
            )
            .await;
        if !delivered {
            debug!(from = %from.user_id, to = to_user_id, "ice target not reachable");
        }
    }

    /// Mark the call answered and tell the caller. Unknown call: no-op.
    pub async fn accept_call(&self, from: &ConnectedSession, to_user_id: &str) {
        let Some(key) = self.find_call(&from.user_id, to_user_id) else {
            debug!(from = %from.user_id, to = to_user_id, "accept for unknown call");
            return;
        };
        let call_id = {
            let mut call = match self.calls.get_mut(&key) {
                Some(call) => call,
                None => return,
            };
            call.state = CallState::Answered;
            call.call_id.clone()
        };
        self.registry
            .send_to(
                to_user_id,
                ServerEvent::CallAccepted {
                    call_id,
                    status: "accepted".to_string(),
                },
            )
            .await;
    }

    /// Decline the call and tear it down. Unknown call: no-op.
    pub async fn decline_call(&self, from: &ConnectedSession, to_user_id: &str) {
        let Some(key) = self.find_call(&from.user_id, to_user_id) else {
            debug!(from = %from.user_id, to = to_user_id, "decline for unknown call");
            return;
        };
        if let Some((_, call)) = self.calls.remove(&key) {
            if let Some(ticker) = &call.ticker {
                ticker.abort();
            }
            let declined = ServerEvent::CallDeclined {
                call_id: call.call_id.clone(),
                status: "declined".to_string(),
            };
            self.registry.send_to(&call.caller_user, declined.clone()).await;
            self.registry.send_to(&call.callee_user, declined).await;
            gauge!(crate::metrics::CALL_ACTIVE).set(self.calls.len() as f64);
            info!(call_id = %call.call_id, "call declined");
        }
    }

    /// End an active call between the two users, stop the ticker and report
    /// the total elapsed seconds to both parties. Works under either
    /// ordering of the pair; unknown calls are a silent no-op.
    pub async fn end_call(&self, from: &ConnectedSession, to_user_id: &str) {
        let Some(key) = self.find_call(&from.user_id, to_user_id) else {
            debug!(from = %from.user_id, to = to_user_id, "end for unknown call");
            return;
        };
        if let Some((_, call)) = self.calls.remove(&key) {
            if let Some(ticker) = &call.ticker {
                ticker.abort();
            }
            let total_seconds = call.started.elapsed().as_secs();
            let ended = ServerEvent::CallEnded {
                call_id: call.call_id.clone(),
                total_seconds,
            };
            self.registry.send_to(&call.caller_user, ended.clone()).await;
            self.registry.send_to(&call.callee_user, ended).await;

            counter!(crate::metrics::CALL_ENDED).increment(1);
            gauge!(crate::metrics::CALL_ACTIVE).set(self.calls.len() as f64);
            info!(call_id = %call.call_id, total_seconds, "call ended");
        }
    }

    /// Drop every call referencing a disconnecting session. Must run inside
    /// the disconnect handler, and a failure on one entry must not leave the
    /// remaining tickers running.
    pub fn cleanup_for(&self, conn_id: &str, user_id: &str) {
        let stale: Vec<String> = self
            .calls
            .iter()
            .filter(|call| {
                call.caller_conn == conn_id
                    || call.caller_user == user_id
                    || call.callee_user == user_id
            })
            .map(|call| call.key().clone())
            .collect();

        for key in stale {
            if let Some((_, call)) = self.calls.remove(&key) {
                if let Some(ticker) = &call.ticker {
                    ticker.abort();
                }
                debug!(call_id = %call.call_id, "call dropped on disconnect");
            }
        }
        gauge!(crate::metrics::CALL_ACTIVE).set(self.calls.len() as f64);
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    fn find_call(&self, a: &str, b: &str) -> Option<String> {
        self.calls
            .iter()
            .find(|call| {
                (call.caller_user == a && call.callee_user == b)
                    || (call.caller_user == b && call.callee_user == a)
            })
            .map(|call| call.key().clone())
    }
}

/// Per-call duration ticker. Emits elapsed seconds to both parties once per
/// second; an offer still unanswered past the ring timeout is declined with
/// status `timed-out` and the call removed.
fn spawn_ticker(
    calls: Arc<DashMap<String, ActiveCall>>,
    registry: Arc<SessionRegistry>,
    call_id: String,
    caller_user: UserId,
    callee_user: UserId,
    ring_timeout: Duration,
) -> AbortHandle {
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.tick().await; // consume the immediate first tick
        loop {
            interval.tick().await;

            let (elapsed, state) = {
                let Some(call) = calls.get(&call_id) else {
                    break;
                };
                (call.started.elapsed(), call.state)
                // guard released before any await below
            };

            if state == CallState::Offered && elapsed >= ring_timeout {
                if let Some((_, call)) = calls.remove(&call_id) {
                    let declined = ServerEvent::CallDeclined {
                        call_id: call.call_id.clone(),
                        status: "timed-out".to_string(),
                    };
                    registry.send_to(&call.caller_user, declined.clone()).await;
                    registry.send_to(&call.callee_user, declined).await;
                    gauge!(crate::metrics::CALL_ACTIVE).set(calls.len() as f64);
                    info!(call_id = %call.call_id, "call timed out ringing");
                }
                break;
            }

            let duration = elapsed.as_secs();
            let tick = ServerEvent::CallDuration {
                call_id: call_id.clone(),
                duration,
            };
            registry.send_to(&caller_user, tick.clone()).await;
            registry.send_to(&callee_user, tick).await;
        }
    });
    handle.abort_handle()
}
