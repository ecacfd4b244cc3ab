//! Shared helpers for the adapters.

use std::time::Duration;

use rand::Rng;

/// Delay before retry `attempt` (1-based): `initial * 2^(attempt-1)` capped at
/// `max`, spread by +/- 25% jitter so refreshes of many viewers do not align.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let initial_ms = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

    let base = initial_ms.saturating_mul(1u64 << attempt.clamp(1, 16).saturating_sub(1));
    let capped = base.min(max_ms);
    let jitter_range = capped / 4;
    let random_offset = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..=(jitter_range * 2))
    } else {
        0
    };
    Duration::from_millis((capped.saturating_sub(jitter_range) + random_offset).min(max_ms))
}

pub async fn backoff(attempt: u32, initial: Duration, max: Duration) {
    tokio::time::sleep(backoff_delay(attempt, initial, max)).await;
}
