// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for waiting on conditions in tests

use std::future::Future;
use std::time::Duration;
use std::time::Instant;

/// Result of one check of a condition by [`wait_for_condition()`]
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// the condition is not yet true; keep waiting
    NotYet,
    /// the condition can never become true; stop waiting
    Failed(E),
}

/// Error returned by [`wait_for_condition()`]
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition")]
    PermanentError(E),
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// `poll_max` has elapsed
///
/// `cond` is invoked every `poll_interval`.  It returns `Ok(T)` when the
/// condition holds, `Err(CondCheckError::NotYet)` to keep waiting, and
/// `Err(CondCheckError::Failed(e))` to give up immediately.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e))
            }
            Err(CondCheckError::NotYet) => (),
        }

        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        tokio::time::sleep(*poll_interval).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_succeeds_eventually() {
        let calls = AtomicUsize::new(0);
        let result = wait_for_condition::<_, (), _, _>(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CondCheckError::NotYet)
                } else {
                    Ok("done")
                }
            },
            &Duration::from_millis(1),
            &Duration::from_secs(30),
        )
        .await
        .unwrap();
        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_times_out() {
        let result = wait_for_condition::<(), (), _, _>(
            || async { Err(CondCheckError::NotYet) },
            &Duration::from_millis(1),
            &Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(Error::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_permanent_error() {
        let result = wait_for_condition::<(), _, _, _>(
            || async { Err(CondCheckError::Failed("boom")) },
            &Duration::from_millis(1),
            &Duration::from_secs(30),
        )
        .await;
        assert!(matches!(result, Err(Error::PermanentError("boom"))));
    }
}
