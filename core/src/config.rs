//! Process-level runtime configuration.
//!
//! Everything here is read once at startup and injected into the session
//! manager and orchestrator, so tests can substitute values without touching
//! the environment.

use std::time::Duration;

use tracing::warn;

pub const SESSION_TTL_ENV: &str = "SWITCHBOARD_SESSION_TTL_MS";
pub const RUNNING_MAX_ENV: &str = "SWITCHBOARD_RUNNING_MAX_MS";
pub const SWEEP_INTERVAL_ENV: &str = "SWITCHBOARD_SWEEP_INTERVAL_MS";
pub const DISK_RESUME_ENV: &str = "SWITCHBOARD_DISK_RESUME";
pub const RESUME_SECRET_ENV: &str = "SWITCHBOARD_RESUME_SECRET";
pub const ALLOW_BYPASS_ENV: &str = "SWITCHBOARD_ALLOW_BYPASS_PERMISSIONS";
pub const ALLOW_SENSITIVE_ENV: &str = "SWITCHBOARD_ALLOW_SENSITIVE_DETAILS";

const DEFAULT_SESSION_TTL_MS: u64 = 30 * 60 * 1000;
const DEFAULT_RUNNING_MAX_MS: u64 = 4 * 60 * 60 * 1000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60 * 1000;
const DEFAULT_PERMISSION_TIMEOUT_MS: u64 = 60 * 1000;
const DEFAULT_INIT_TIMEOUT_MS: u64 = 30 * 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Idle sessions older than this are deleted by the sweeper.
    pub session_ttl: Duration,
    /// Running/waiting sessions older than this are failed by the sweeper.
    pub running_session_max: Duration,
    pub sweep_interval: Duration,
    /// Disk-resume is opt-in via the literal value `"1"`.
    pub disk_resume_enabled: bool,
    /// HMAC secret for resume tokens; `None` when unset or blank.
    pub resume_secret: Option<String>,
    pub allow_bypass_permissions: bool,
    pub allow_sensitive_details: bool,
    pub permission_request_timeout: Duration,
    pub session_init_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_millis(DEFAULT_SESSION_TTL_MS),
            running_session_max: Duration::from_millis(DEFAULT_RUNNING_MAX_MS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            disk_resume_enabled: false,
            resume_secret: None,
            allow_bypass_permissions: false,
            allow_sensitive_details: false,
            permission_request_timeout: Duration::from_millis(DEFAULT_PERMISSION_TIMEOUT_MS),
            session_init_timeout: Duration::from_millis(DEFAULT_INIT_TIMEOUT_MS),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let mut config = RuntimeConfig::default();
        if let Some(ms) = positive_millis(SESSION_TTL_ENV) {
            config.session_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = positive_millis(RUNNING_MAX_ENV) {
            config.running_session_max = Duration::from_millis(ms);
        }
        if let Some(ms) = positive_millis(SWEEP_INTERVAL_ENV) {
            config.sweep_interval = Duration::from_millis(ms);
        }
        config.disk_resume_enabled =
            std::env::var(DISK_RESUME_ENV).is_ok_and(|v| v == "1");
        config.resume_secret = std::env::var(RESUME_SECRET_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        config.allow_bypass_permissions = bool_flag(ALLOW_BYPASS_ENV);
        config.allow_sensitive_details = bool_flag(ALLOW_SENSITIVE_ENV);
        config
    }
}

/// Parse a positive-integer millisecond variable; anything else falls back
/// to the built-in default (with a warning, so misconfiguration is visible).
fn positive_millis(var: &str) -> Option<u64> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(ms),
        _ => {
            warn!("ignoring invalid value for {var}: {raw:?}");
            None
        }
    }
}

fn bool_flag(var: &str) -> bool {
    std::env::var(var).is_ok_and(|v| {
        let v = v.trim();
        v == "1" || v.eq_ignore_ascii_case("true")
    })
}
