use std::time::Duration;

use rand::Rng;

/// Retry back-off schedule for transient stream errors: 1s → 2s → 4s.
///
/// Deterministic on purpose: callers surface the exact delay in a
/// `progress` event so pollers can observe the retry cadence.
pub(crate) fn backoff(attempt: u32) -> Duration {
    let base_delay_ms = 1_000u64 << (attempt.saturating_sub(1).min(16));
    Duration::from_millis(base_delay_ms)
}

/// Short random hex suffix used to make permission request ids unique.
pub(crate) fn random_hex_suffix() -> String {
    let n: u32 = rand::rng().random();
    format!("{n:08x}")
}
