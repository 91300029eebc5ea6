// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! shared between the tripline realtime server and its clients.
//! This module defines the WebSocket protocol messages and the plain
//! data records exchanged with the surrounding CRUD services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical user identity, as issued by the user directory.
pub type UserId = String;

/// Transport connection identifier, unique per WebSocket connection.
pub type ConnId = String;

/// Trip identifier.
pub type TripId = String;

/// Account role attached to a connected session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Participant,
}

/// Recognized call kinds for the signaling relay.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    /// Parse the wire representation. Anything but the two recognized
    /// kinds is rejected by the relay.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "audio" => Some(CallKind::Audio),
            "video" => Some(CallKind::Video),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Audio => "audio",
            CallKind::Video => "video",
        }
    }
}

/// Trip lifecycle state. `Cancelled` is terminal and never reassigned by
/// the status sweep.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TripStatus {
    Planned,
    Ongoing,
    Completed,
    Cancelled,
}

/// One recorded coordinate sample. Immutable once recorded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// Profile fields served by the user directory.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserProfile {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub push_tokens: Vec<String>,
    /// Set while a trip created by this teacher is ongoing.
    #[serde(default)]
    pub trip_ongoing: bool,
    #[serde(default)]
    pub license_expires_at: Option<DateTime<Utc>>,
    /// Cleared by the daily sweep once `license_expires_at` has passed.
    #[serde(default = "default_true")]
    pub license_active: bool,
}

fn default_true() -> bool {
    true
}

/// Trip fields served by the trip directory.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TripRecord {
    pub trip_id: TripId,
    pub created_by: UserId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: TripStatus,
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub is_deleted: bool,
}

/// Durable record written by the notification fan-out. Append-only; the
/// read/ack flag is owned by surrounding CRUD code.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NotificationRecord {
    pub notification_id: String,
    pub recipient_user_id: UserId,
    pub recipient_message: Option<String>,
    /// Every admin id known at fan-out time, reachable or not.
    pub admin_recipient_ids: Vec<UserId>,
    pub admin_message: Option<String>,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Start a call with another user.
    /// # Fields
    /// * `to_user_id` - Target of the call
    /// * `offer` - Opaque SDP offer payload
    /// * `request_type` - Call kind; validated by the relay
    #[serde(rename = "call-offer")]
    CallOffer {
        #[serde(rename = "toUserId")]
        to_user_id: UserId,
        offer: serde_json::Value,
        #[serde(rename = "requestType")]
        request_type: String,
    },
    /// SDP answer back to the offerer.
    #[serde(rename = "call-answer")]
    CallAnswer {
        #[serde(rename = "toUserId")]
        to_user_id: UserId,
        answer: serde_json::Value,
    },
    /// Callee accepted the incoming call.
    #[serde(rename = "call-accept")]
    CallAccept {
        #[serde(rename = "toUserId")]
        to_user_id: UserId,
    },
    /// Callee declined the incoming call.
    #[serde(rename = "call-decline")]
    CallDecline {
        #[serde(rename = "toUserId")]
        to_user_id: UserId,
    },
    /// ICE candidate for an in-flight negotiation. Delivered to the
    /// target session only.
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(rename = "toUserId")]
        to_user_id: UserId,
        candidate: serde_json::Value,
    },
    /// Hang up. Accepted under either ordering of the pair.
    #[serde(rename = "end-call")]
    EndCall {
        #[serde(rename = "toUserId")]
        to_user_id: UserId,
    },
    /// Device-side coordinate sample for the sender's own track.
    #[serde(rename = "location-update")]
    LocationUpdate { latitude: f64, longitude: f64 },
}

/// Events emitted by the server to connected sessions. Variant names keep
/// the event names of the mobile clients' protocol.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "incoming_call")]
    IncomingCall {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "callerId")]
        caller_id: UserId,
        message: String,
    },
    #[serde(rename = "call_accepted")]
    CallAccepted {
        #[serde(rename = "callId")]
        call_id: String,
        status: String,
    },
    #[serde(rename = "call_declined")]
    CallDeclined {
        #[serde(rename = "callId")]
        call_id: String,
        status: String,
    },
    #[serde(rename = "offer")]
    Offer {
        from: UserId,
        offer: serde_json::Value,
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "requestType")]
        request_type: CallKind,
    },
    #[serde(rename = "offer-answer")]
    OfferAnswer {
        from: UserId,
        answer: serde_json::Value,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        from: UserId,
        candidate: serde_json::Value,
    },
    #[serde(rename = "call-duration")]
    CallDuration {
        #[serde(rename = "callId")]
        call_id: String,
        /// Elapsed seconds since the offer was relayed.
        duration: u64,
    },
    #[serde(rename = "call-ended")]
    CallEnded {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "totalSeconds")]
        total_seconds: u64,
    },
    #[serde(rename = "locationRequest")]
    LocationRequest {
        #[serde(rename = "userId")]
        user_id: UserId,
        name: String,
    },
    #[serde(rename = "locationUpdated")]
    LocationUpdated {
        #[serde(rename = "userId")]
        user_id: UserId,
        latitude: f64,
        longitude: f64,
        #[serde(rename = "isTrackingEnabled")]
        is_tracking_enabled: bool,
        time: DateTime<Utc>,
    },
    #[serde(rename = "notification")]
    Notification { message: String },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}
