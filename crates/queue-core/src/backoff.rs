//! Jittered exponential backoff, shared by the empty-claim sleep and the
//! failure-retry delay (spec §4.5 step 3 and step 6 use the same shape).

use std::time::Duration;

/// `min(cap, base * 2^(attempt - 1)) + jitter`, `attempt` is 1-based.
/// Jitter is up to 25% of the computed delay, so repeated failures don't
/// retry in lockstep across workers.
pub fn compute_delay(base: Duration, cap: Duration, attempt: u32, rng: &mut fastrand::Rng) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let scaled = base.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
    let delay = scaled.min(cap);
    let jitter_upper_ms = (delay.as_millis() / 4) as u64;
    let jitter_ms = if jitter_upper_ms == 0 {
        0
    } else {
        rng.u64(0..=jitter_upper_ms)
    };
    delay + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut rng = fastrand::Rng::with_seed(0);
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(5);
        let d1 = compute_delay(base, cap, 1, &mut rng);
        let d2 = compute_delay(base, cap, 2, &mut rng);
        let d3 = compute_delay(base, cap, 3, &mut rng);
        assert!(d1 >= base && d1 < base * 2);
        assert!(d2 >= base * 2 && d2 < base * 3);
        assert!(d3 >= base * 4 && d3 < base * 5);
    }

    #[test]
    fn never_exceeds_cap_plus_jitter() {
        let mut rng = fastrand::Rng::with_seed(1);
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(5);
        let d = compute_delay(base, cap, 20, &mut rng);
        assert!(d <= cap + cap / 4);
    }
}
