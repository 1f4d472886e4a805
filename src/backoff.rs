//! Retry pacing shared by the discovery restarts and push delivery.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter: `base * 2^min(attempt, 4)`, capped at `max`,
/// plus up to one second of random jitter.
pub fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
   let exponential = base * (1 << attempt.min(4));
   let delay = exponential.min(max);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_delay_grows_then_caps() {
      let base = Duration::from_secs(2);
      let max = Duration::from_secs(20);

      let first = retry_delay(0, base, max);
      assert!(first >= base && first < base + Duration::from_secs(1));

      let third = retry_delay(2, base, max);
      assert!(third >= Duration::from_secs(8) && third < Duration::from_secs(9));

      for attempt in [4, 10, u32::MAX] {
         let delay = retry_delay(attempt, base, max);
         assert!(delay >= max && delay < max + Duration::from_secs(1));
      }
   }
}
