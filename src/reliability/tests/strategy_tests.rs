//! Tests for the retry-timing strategies.

use std::time::Duration;

use chrono::TimeDelta;
use proptest::prelude::*;
use rstest::rstest;

use super::{minutes, t0};
use crate::reliability::{RetryPolicy, RetryStrategy};

const CONSTANT: RetryPolicy = RetryPolicy {
    strategy: RetryStrategy::ConstantInterval,
    max_attempts: 3,
    timeout_budget_minutes: 30,
};

fn backoff(initial_minutes: u64, max_minutes: u64) -> RetryStrategy {
    RetryStrategy::ExponentialBackoff {
        initial_delay: Duration::from_secs(initial_minutes * 60),
        max_delay: Duration::from_secs(max_minutes * 60),
    }
}

#[test]
fn constant_interval_yields_three_slots_then_stops() {
    let first = CONSTANT.next_attempt(t0(), 1, t0()).expect("first slot");
    let second = CONSTANT.next_attempt(t0(), 2, first).expect("second slot");
    let third = CONSTANT.next_attempt(t0(), 3, second).expect("third slot");

    assert_eq!(first, t0() + minutes(10));
    assert_eq!(second, t0() + minutes(20));
    assert_eq!(third, t0() + minutes(30));
    assert!(first < second && second < third);
    assert_eq!(CONSTANT.next_attempt(t0(), 4, third), None);
}

#[rstest]
#[case(minutes(-5), Some(minutes(10)))]
#[case(minutes(9), Some(minutes(10)))]
#[case(minutes(25), Some(minutes(30)))]
#[case(minutes(30) + TimeDelta::seconds(1), None)]
#[case(minutes(60), None)]
fn constant_interval_picks_first_boundary_after_now(
    #[case] offset: TimeDelta,
    #[case] expected: Option<TimeDelta>,
) {
    let next = CONSTANT.next_attempt(t0(), 1, t0() + offset);
    assert_eq!(next, expected.map(|d| t0() + d));
}

#[rstest]
#[case(0, 30)]
#[case(3, 0)]
fn constant_interval_rejects_degenerate_input(#[case] max_attempts: u32, #[case] budget: u32) {
    let next = RetryStrategy::ConstantInterval.next_attempt(t0(), 1, max_attempts, budget, t0());
    assert_eq!(next, None);
}

#[test]
fn constant_interval_clamps_attempts() {
    // One minute split into more slots than milliseconds would yield a zero
    // step without the clamp.
    let next =
        RetryStrategy::ConstantInterval.next_attempt(t0(), 1, u32::MAX, 1, t0());
    assert_eq!(next, Some(t0() + TimeDelta::milliseconds(1)));
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(7)]
#[case(u32::MAX)]
fn send_once_never_retries(#[case] attempts: u32) {
    assert_eq!(
        RetryStrategy::SendOnce.next_attempt(t0(), attempts, 5, 30, t0()),
        None
    );
    assert_eq!(RetryPolicy::send_once().next_attempt(t0(), attempts, t0()), None);
}

#[test]
fn exponential_backoff_doubles_then_caps() {
    let strategy = backoff(1, 4);
    let at = |attempts, now| strategy.next_attempt(t0(), attempts, 10, 30, now);

    assert_eq!(at(1, t0()), Some(t0() + minutes(1)));
    assert_eq!(at(2, t0() + minutes(1)), Some(t0() + minutes(3)));
    assert_eq!(at(3, t0() + minutes(3)), Some(t0() + minutes(7)));
    assert_eq!(at(4, t0() + minutes(7)), Some(t0() + minutes(11)));
    assert_eq!(at(9, t0() + minutes(29)), None);
}

#[test]
fn exponential_backoff_skips_boundaries_already_passed() {
    let strategy = backoff(1, 4);
    let next = strategy.next_attempt(t0(), 1, 10, 30, t0() + minutes(8));
    assert_eq!(next, Some(t0() + minutes(11)));
}

proptest! {
    #[test]
    fn proposals_never_decrease(
        max_attempts in 1_u32..50,
        budget in 1_u32..600,
        attempts in 1_u32..50,
        first in 0_i64..36_000,
        gap in 0_i64..36_000,
    ) {
        let earlier = t0() + TimeDelta::seconds(first);
        let later = earlier + TimeDelta::seconds(gap);
        for strategy in [RetryStrategy::ConstantInterval, backoff(1, 8)] {
            let a = strategy.next_attempt(t0(), attempts, max_attempts, budget, earlier);
            let b = strategy.next_attempt(t0(), attempts, max_attempts, budget, later);
            if let (Some(a), Some(b)) = (a, b) {
                prop_assert!(a <= b);
            }
            if a.is_none() {
                prop_assert!(b.is_none(), "a budget never comes back once exhausted");
            }
            if let Some(a) = a {
                prop_assert!(a > earlier);
                let ceiling = t0()
                    + minutes(i64::from(budget))
                    + TimeDelta::seconds(5);
                prop_assert!(a < ceiling);
            }
        }
    }
}
