// =============================================================================
// Ingestion Pipelines — fetch/receive → normalize → batch → upsert
// =============================================================================
//
// Five structurally identical loops, one per metric family. Transient errors
// never kill a loop: a consecutive-error counter stretches the sleep between
// attempts, and the loop resumes on the next success.
// =============================================================================

pub mod funding;
pub mod open_interest;
pub mod price;
pub mod trade_count;
pub mod volume;

use std::time::Duration;

/// Backoff over the cap kicks in after this many consecutive failures.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Absolute ceiling on any backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Consecutive-error backoff shared by every pipeline loop.
///
/// The delay grows linearly with the error streak and is capped at
/// min(5 x cadence, 300 s); after five straight failures the loop sits at the
/// cap until something succeeds.
pub struct BackoffPolicy {
    cadence: Duration,
    consecutive_errors: u32,
}

impl BackoffPolicy {
    pub fn new(cadence: Duration) -> Self {
        Self {
            cadence,
            consecutive_errors: 0,
        }
    }

    /// Reset the streak after a successful cycle.
    pub fn on_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Record a failure and return how long the loop should sleep.
    pub fn on_error(&mut self) -> Duration {
        self.consecutive_errors += 1;
        let streak = self.consecutive_errors.min(MAX_CONSECUTIVE_ERRORS);
        let delay = self.cadence.saturating_mul(streak);
        delay.min(self.cadence.saturating_mul(MAX_CONSECUTIVE_ERRORS)).min(MAX_BACKOFF)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = BackoffPolicy::new(Duration::from_secs(60));
        assert_eq!(b.on_error(), Duration::from_secs(60));
        assert_eq!(b.on_error(), Duration::from_secs(120));
        assert_eq!(b.on_error(), Duration::from_secs(180));
        assert_eq!(b.on_error(), Duration::from_secs(240));
        // 5 x 60 = 300 hits both the 5x-cadence cap and the absolute cap.
        assert_eq!(b.on_error(), Duration::from_secs(300));
        assert_eq!(b.on_error(), Duration::from_secs(300));
        b.on_success();
        assert_eq!(b.consecutive_errors(), 0);
        assert_eq!(b.on_error(), Duration::from_secs(60));
    }

    #[test]
    fn backoff_respects_absolute_ceiling_for_slow_cadence() {
        let mut b = BackoffPolicy::new(Duration::from_secs(120));
        b.on_error();
        b.on_error();
        // 3 x 120 = 360 would exceed the 300 s ceiling.
        assert_eq!(b.on_error(), Duration::from_secs(300));
    }
}
