use chrono::{DateTime, Duration, Utc};

/// Client-side cooldown between successive booking submissions.
///
/// The guard holds only the window length. The last-booking instant lives in
/// the booking store's persisted cache (single writer), so the cooldown
/// survives a restart. Both checks are pure projections of `now`; a UI
/// countdown re-evaluates `remaining_secs` per tick instead of running its
/// own timer.
#[derive(Debug, Clone, Copy)]
pub struct CooldownGuard {
    window_secs: i64,
}

impl CooldownGuard {
    pub fn new(window_secs: i64) -> Self {
        Self { window_secs }
    }

    /// Whether a new submission is allowed at `now`.
    pub fn can_submit(&self, last_booking: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        self.remaining_secs(last_booking, now) == 0
    }

    /// Whole seconds left before the next submission is allowed (rounded
    /// up), or 0 when the window has passed.
    pub fn remaining_secs(
        &self,
        last_booking: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> i64 {
        let Some(last) = last_booking else {
            return 0;
        };
        let left = last + Duration::seconds(self.window_secs) - now;
        let ms = left.num_milliseconds();
        if ms <= 0 {
            0
        } else {
            (ms + 999) / 1000
        }
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_no_previous_booking_allows() {
        let guard = CooldownGuard::new(15);
        assert!(guard.can_submit(None, t0()));
        assert_eq!(guard.remaining_secs(None, t0()), 0);
    }

    #[test]
    fn test_blocked_inside_window() {
        let guard = CooldownGuard::new(15);
        let now = t0() + Duration::seconds(10);
        assert!(!guard.can_submit(Some(t0()), now));
        assert_eq!(guard.remaining_secs(Some(t0()), now), 5);
    }

    #[test]
    fn test_allowed_after_window() {
        let guard = CooldownGuard::new(15);
        assert!(guard.can_submit(Some(t0()), t0() + Duration::seconds(16)));
    }

    #[test]
    fn test_boundary_exactly_at_window_end() {
        // now == last + window → no time left, submission allowed.
        let guard = CooldownGuard::new(15);
        let now = t0() + Duration::seconds(15);
        assert_eq!(guard.remaining_secs(Some(t0()), now), 0);
        assert!(guard.can_submit(Some(t0()), now));
    }

    #[test]
    fn test_fractional_seconds_round_up() {
        let guard = CooldownGuard::new(15);
        let now = t0() + Duration::milliseconds(14_500);
        assert_eq!(guard.remaining_secs(Some(t0()), now), 1);
        assert!(!guard.can_submit(Some(t0()), now));
    }
}
