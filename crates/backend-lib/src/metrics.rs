// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for Prometheus metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_DISCONNECTION: &str = "ws.disconnection";
pub const WS_ACTIVE: &str = "ws.active";
pub const CALL_STARTED: &str = "call.started";
pub const CALL_ENDED: &str = "call.ended";
pub const CALL_ACTIVE: &str = "call.active";
pub const LOCATION_SAMPLES: &str = "location.samples";
pub const LOCATION_TRACKS_EXPIRED: &str = "location.tracks_expired";
pub const NOTIFICATIONS_RECORDED: &str = "notification.recorded";
pub const TRIP_SWEEPS: &str = "trip.sweeps";
pub const TRIP_TRANSITIONS: &str = "trip.transitions";
