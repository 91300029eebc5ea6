// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level
    pub log_level: String,
    /// Trip status sweep interval in seconds
    pub status_sweep_secs: u64,
    /// Daily sweep interval in seconds (license expiry, completed-trip cleanup)
    pub daily_sweep_secs: u64,
    /// Location-track expiry sweep interval in seconds
    pub expiry_sweep_secs: u64,
    /// Seconds an unanswered call offer may ring before timing out
    pub ring_timeout_secs: u64,
    /// Default tracking window in minutes when a request names none
    pub default_window_mins: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().unwrap(),
            log_level: "info".to_string(),
            status_sweep_secs: 60,
            daily_sweep_secs: 60 * 60 * 24,
            expiry_sweep_secs: 60,
            ring_timeout_secs: 30,
            default_window_mins: 60,
        }
    }
}

impl Settings {
    /// Load settings from defaults, then `config.toml`, then `TRIPLINE_*`
    /// environment variables, later sources winning.
    pub fn load() -> Result<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("TRIPLINE_"))
            .extract()?;

        Ok(settings)
    }
}
