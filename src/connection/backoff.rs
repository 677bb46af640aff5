use std::time::Duration;

use rand::Rng;

/// Binary exponential backoff with full jitter: a retry waits a uniform
/// random duration in `[0, min(2^n * 1000ms, max_backoff))`. Retry zero
/// waits nothing.
pub fn backoff_with_jitter(retry_number: u32, max_backoff: Duration) -> Duration {
    if retry_number == 0 || max_backoff.is_zero() {
        return Duration::ZERO;
    }
    let max_ms = max_backoff.as_millis() as u64;
    let base = if retry_number >= 54 || (max_ms >> retry_number) < 1000 {
        max_ms
    } else {
        1000u64 << retry_number
    };
    Duration::from_millis(rand::thread_rng().gen_range(0..base))
}
