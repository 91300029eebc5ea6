// ============================
// crates/backend-lib/src/notify.rs
// ============================
//! Notification Fan-out
//!
//! Best-effort real-time push to one recipient and/or the currently
//! connected admins, plus exactly one durable record per call. Delivery and
//! persistence are decoupled: a recipient without a live session still gets
//! a record, and a persistence failure propagates to the caller instead of
//! vanishing.

use crate::directory::{NotificationLog, PushSender, UserDirectory};
use crate::error::AppError;
use crate::registry::SessionRegistry;
use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};
use tripline_common::{NotificationRecord, ServerEvent, UserId};

/// One fan-out request.
#[derive(Debug, Clone)]
pub struct NotifyRequest {
    pub recipient_user_id: UserId,
    pub recipient_message: Option<String>,
    pub admin_message: Option<String>,
    pub title: String,
}

/// Summary of one push dispatch.
#[derive(Debug, Clone)]
pub struct PushSummary {
    pub delivered: usize,
    pub failed: usize,
}

pub struct Notifier {
    registry: Arc<SessionRegistry>,
    users: Arc<dyn UserDirectory>,
    log: Arc<dyn NotificationLog>,
    push: Arc<dyn PushSender>,
}

impl Notifier {
    pub fn new(
        registry: Arc<SessionRegistry>,
        users: Arc<dyn UserDirectory>,
        log: Arc<dyn NotificationLog>,
        push: Arc<dyn PushSender>,
    ) -> Self {
        Self {
            registry,
            users,
            log,
            push,
        }
    }

    /// Fan a notification out to the recipient's live session (if any), to
    /// every connected admin, and into the durable log. Exactly one record
    /// per call, capturing the full admin id set whether reachable or not.
    pub async fn notify(&self, req: NotifyRequest) -> Result<NotificationRecord, AppError> {
        if let Some(message) = &req.recipient_message {
            let delivered = self
                .registry
                .send_to(
                    &req.recipient_user_id,
                    ServerEvent::Notification {
                        message: message.clone(),
                    },
                )
                .await;
            if !delivered {
                debug!(user_id = %req.recipient_user_id, "recipient offline, record only");
            }
        }

        let admins = self.users.find_admins().await?;
        let admin_recipient_ids: Vec<UserId> =
            admins.iter().map(|admin| admin.user_id.clone()).collect();

        if let Some(message) = &req.admin_message {
            for admin in &admins {
                self.registry
                    .send_to(
                        &admin.user_id,
                        ServerEvent::Notification {
                            message: message.clone(),
                        },
                    )
                    .await;
            }
        }

        let record = NotificationRecord {
            notification_id: uuid::Uuid::new_v4().to_string(),
            recipient_user_id: req.recipient_user_id,
            recipient_message: req.recipient_message,
            admin_recipient_ids,
            admin_message: req.admin_message,
            title: req.title,
            created_at: Utc::now(),
        };
        self.log.create(record.clone()).await?;

        counter!(crate::metrics::NOTIFICATIONS_RECORDED).increment(1);
        Ok(record)
    }

    /// Dispatch a push notification to every device token registered for the
    /// user. Undeliverable tokens are logged for later removal.
    pub async fn send_push(
        &self,
        user_id: &str,
        title: &str,
        body: &str,
    ) -> Result<PushSummary, AppError> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {user_id} not found")))?;

        if user.push_tokens.is_empty() {
            return Ok(PushSummary {
                delivered: 0,
                failed: 0,
            });
        }

        let outcomes = self.push.send(&user.push_tokens, title, body).await?;
        let mut summary = PushSummary {
            delivered: 0,
            failed: 0,
        };
        for outcome in outcomes {
            if outcome.delivered {
                summary.delivered += 1;
            } else {
                summary.failed += 1;
                warn!(
                    user_id,
                    token = %outcome.token,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "push token undeliverable"
                );
            }
        }
        Ok(summary)
    }
}
