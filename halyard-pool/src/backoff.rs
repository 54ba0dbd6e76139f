//! Connect backoff.

use std::time::Duration;

use rand::Rng;

/// Base delay after the first failed connection attempt.
const BASE: Duration = Duration::from_millis(100);

/// Ceiling for the exponential curve.
const MAX: Duration = Duration::from_secs(60);

/// Growth factor per consecutive failure.
const FACTOR: f64 = 1.25;

/// Jitter applied to every computed delay, as a fraction of the delay.
const JITTER: f64 = 0.03;

/// Delay before the next connection attempt after `attempts` consecutive
/// failures.
///
/// `min(60 s, 100 ms * 1.25^(attempts - 1))`, with a fresh uniform ±3 %
/// jitter sampled on every call.
pub(crate) fn connection_creation_backoff(attempts: u32) -> Duration {
    debug_assert!(attempts >= 1, "backoff requires at least one failed attempt");
    let exponent = attempts.saturating_sub(1).min(64) as i32;
    let delay = BASE.as_secs_f64() * FACTOR.powi(exponent);
    let capped = delay.min(MAX.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(-JITTER..=JITTER);
    Duration::from_secs_f64(capped * (1.0 + jitter))
}
