//! Bounded retry wrapper for CAS-loop mutators (`spec.md` §4.6).

use crate::error::{ErrorKind, ListError, RetryStats};
use core::ops::ControlFlow;

/// Runs `attempt` up to `limit` times. `attempt` returns
/// `ControlFlow::Break(value)` once its CAS sequence lands, or
/// `ControlFlow::Continue(kind)` to record the inner error kind observed
/// on this try and loop again.
///
/// Between attempts this spins/yields via a [`crossbeam_utils::Backoff`]
/// (skipped under `loom`, where real scheduling hints would just bloat
/// the state space `loom::model` has to explore without adding any
/// interleaving it couldn't already reach) — contended CAS loops settle
/// faster when the loser backs off instead of immediately retrying the
/// same compare-and-swap.
///
/// On exhaustion, returns [`ListError::OverRetry`] carrying a histogram of
/// every `kind` seen, so callers can log or assert on which inner error
/// dominated the contention.
pub(crate) fn retry<T>(
    limit: u32,
    mut attempt: impl FnMut(u32) -> ControlFlow<T, ErrorKind>,
) -> Result<T, ListError> {
    let mut stats = RetryStats::new();
    #[cfg(not(loom))]
    let backoff = crossbeam_utils::Backoff::new();
    for i in 0..limit {
        match attempt(i) {
            ControlFlow::Break(value) => return Ok(value),
            ControlFlow::Continue(kind) => {
                stats.record(kind);
                #[cfg(not(loom))]
                backoff.spin();
            }
        }
    }
    Err(ListError::OverRetry {
        attempts: limit,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeds_before_budget() {
        let mut tries = 0;
        let result = retry(10, |_| {
            tries += 1;
            if tries == 3 {
                ControlFlow::Break(tries)
            } else {
                ControlFlow::Continue(ErrorKind::CasConflictOnAdd)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn over_retry_carries_stats() {
        let result: Result<(), _> = retry(5, |_| ControlFlow::Continue(ErrorKind::Marked));
        match result {
            Err(ListError::OverRetry { attempts, stats }) => {
                assert_eq!(attempts, 5);
                assert_eq!(stats.count(ErrorKind::Marked), 5);
            }
            _ => panic!("expected OverRetry"),
        }
    }
}
