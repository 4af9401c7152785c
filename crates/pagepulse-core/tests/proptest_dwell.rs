//! Property-based tests for dwell-time accounting.

use proptest::prelude::*;

use pagepulse_core::dwell::DwellTimer;

fn arb_toggles() -> impl Strategy<Value = Vec<(bool, u64)>> {
    prop::collection::vec((any::<bool>(), 0u64..10_000), 0..50)
}

proptest! {
    /// Visible time equals the sum of the visible intervals, however the
    /// toggles repeat.
    #[test]
    fn accumulates_only_visible_intervals(toggles in arb_toggles(), tail in 0u64..10_000) {
        let mut now = 0u64;
        let mut timer = DwellTimer::new(now);
        let mut visible = false;
        let mut expected = 0u64;

        for (show, gap) in toggles {
            if visible {
                expected += gap;
            }
            now += gap;
            if show {
                timer.on_visible(now);
            } else {
                timer.on_hidden(now);
            }
            visible = show;
        }
        if visible {
            expected += tail;
        }
        now += tail;

        prop_assert_eq!(timer.snapshot_and_reset(now), expected);
        prop_assert_eq!(timer.is_accumulating(), visible);
        prop_assert_eq!(timer.snapshot_and_reset(now), 0);
    }

    #[test]
    fn visible_never_exceeds_total(toggles in arb_toggles()) {
        let mut now = 0u64;
        let mut timer = DwellTimer::new(now);
        for (show, gap) in toggles {
            now += gap;
            if show {
                timer.on_visible(now);
            } else {
                timer.on_hidden(now);
            }
        }
        let visible = timer.snapshot_and_reset(now);
        let total = timer.begin_page(now);
        prop_assert!(visible <= total);
    }

    #[test]
    fn backwards_clock_saturates(start in 1_000u64..1_000_000, back in 1u64..1_000) {
        let mut timer = DwellTimer::new(start);
        timer.on_visible(start);
        timer.on_hidden(start - back.min(start));
        prop_assert_eq!(timer.accumulated_ms(), 0);
        prop_assert_eq!(timer.begin_page(start - back.min(start)), 0);
    }
}

#[test]
fn visible_hidden_visible_example() {
    let mut timer = DwellTimer::new(0);
    timer.on_visible(0);
    timer.on_hidden(2_000);
    timer.on_visible(2_500);
    assert_eq!(timer.snapshot_and_reset(3_500), 3_000);
}
