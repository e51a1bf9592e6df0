//! Jittered exponential backoff used by the connect retry loop

use rand::Rng;
use std::time::Duration;

/// jitter_backoff returns a random wait in `[min, min(max, min * 2^attempt)]`
///
/// The result is never below `min`. A `max` below `min` is treated as `min`.
pub fn jitter_backoff(min: Duration, max: Duration, attempt: u32) -> Duration {
    jitter_backoff_with(&mut rand::thread_rng(), min, max, attempt)
}

/// jitter_backoff_with is `jitter_backoff` drawing from a caller-supplied
/// random source, so a seeded rng yields a deterministic schedule
pub fn jitter_backoff_with<R: Rng + ?Sized>(
    rng: &mut R,
    min: Duration,
    max: Duration,
    attempt: u32,
) -> Duration {
    let cap = max.max(min);

    // min * 2^attempt, saturating at the cap
    let unjittered = 2u32
        .checked_pow(attempt)
        .and_then(|factor| min.checked_mul(factor))
        .map_or(cap, |d| d.min(cap));

    if unjittered <= min {
        return min;
    }

    let span = u64::try_from((unjittered - min).as_nanos()).unwrap_or(u64::MAX);
    min + Duration::from_nanos(rng.gen_range(0..=span))
}
