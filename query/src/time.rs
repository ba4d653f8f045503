use once_cell::sync::Lazy;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// A duration meaning "never": data that never goes stale, entries that are
/// never garbage collected.
pub const INFINITE: Duration = Duration::MAX;

// The single reference point for every timestamp the engine hands out.
// Wall-clock millis are sampled once; everything after is measured on the
// monotonic tokio clock, so a paused test clock drives staleness too.
static CLOCK_EPOCH: Lazy<(Instant, u64)> = Lazy::new(|| {
  let wall = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map_or(0, |d| d.as_millis() as u64);
  (Instant::now(), wall)
});

/// Milliseconds since the Unix epoch, monotonic within the process.
#[inline]
pub fn now_millis() -> u64 {
  let (anchor, wall) = *CLOCK_EPOCH;
  wall + Instant::now().saturating_duration_since(anchor).as_millis() as u64
}

#[inline]
pub(crate) fn is_valid_timeout(duration: Duration) -> bool {
  duration != INFINITE
}

/// Time left until data updated at `updated_at` becomes stale.
pub(crate) fn time_until_stale(updated_at: u64, stale_time: Duration) -> Duration {
  if !is_valid_timeout(stale_time) {
    return INFINITE;
  }
  let stale_at = updated_at.saturating_add(stale_time.as_millis() as u64);
  Duration::from_millis(stale_at.saturating_sub(now_millis()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn infinite_stale_time_never_elapses() {
    assert_eq!(time_until_stale(now_millis(), INFINITE), INFINITE);
  }

  #[test]
  fn zero_stale_time_is_already_elapsed() {
    assert_eq!(time_until_stale(now_millis(), Duration::ZERO), Duration::ZERO);
  }
}
