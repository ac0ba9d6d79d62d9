//! Property tests for retry backoff schedules.

use std::time::Duration;

use convergent_exec::RetryPolicy;
use proptest::prelude::*;

proptest! {
    #[test]
    fn schedule_is_bounded_and_monotonic(
        attempts in 1u32..20,
        initial_ms in 1u64..5_000,
        max_ms in 1u64..120_000,
        multiplier in 1.5f64..4.0,
    ) {
        let policy = RetryPolicy::new("prop")
            .with_max_attempts(attempts)
            .with_initial_backoff(Duration::from_millis(initial_ms))
            .with_max_backoff(Duration::from_millis(max_ms))
            .with_multiplier(multiplier);

        let schedule = policy.backoff_schedule();
        prop_assert_eq!(schedule.len() as u32, attempts - 1);
        for wait in &schedule {
            prop_assert!(*wait <= Duration::from_millis(max_ms));
        }
        for pair in schedule.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn doubling_schedule_matches_closed_form(attempts in 2u32..8) {
        let policy = RetryPolicy::remote_shell("ssh")
            .with_max_attempts(attempts)
            .with_max_backoff(Duration::from_secs(3600));
        let schedule = policy.backoff_schedule();
        for (i, wait) in schedule.iter().enumerate() {
            prop_assert_eq!(*wait, Duration::from_secs(1 << i));
        }
    }
}
