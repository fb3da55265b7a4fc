//! Timer-driven runtime shared by the periodic workers.
//!
//! A periodic worker is a loop that waits for the next tick, runs one pass
//! and logs the result. A failed or panicking pass never ends the loop; the
//! next tick simply tries again. Every pass works purely through conditional
//! store updates, so a worker can be stopped and restarted at any time.

use std::{fmt, future::Future, panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt;
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    config::ConfigError,
    metrics,
    panic::WorkerPanic,
    reliability::DeliveryError,
    store::StoreError,
};

/// Failure of a single worker pass.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The configuration snapshot was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The store refused or timed out.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A delivery-state operation failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Run `pass` every `period` until `shutdown` is cancelled.
///
/// The first pass runs immediately and a zero period is raised to one
/// millisecond. Late ticks are delayed rather than bunched up. A pass that
/// is already running when shutdown is requested is allowed to finish.
pub async fn run_periodic<F, Fut, T, E>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut pass: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: fmt::Debug,
    E: fmt::Display,
{
    let mut ticker = time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(worker = name, ?period, "worker started");
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,

            _ = ticker.tick() => {}
        }

        match AssertUnwindSafe(pass()).catch_unwind().await {
            Ok(Ok(report)) => debug!(worker = name, ?report, "worker pass finished"),
            Ok(Err(e)) => warn!(worker = name, error = %e, "worker pass failed; retrying next tick"),
            Err(payload) => {
                let panic = WorkerPanic::new(name, payload);
                metrics::inc_worker_panics(panic.worker());
                error!(worker = name, panic = %panic.message(), "worker pass panicked");
            }
        }
    }
    debug!(worker = name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use rstest::rstest;
    use tracing::Instrument;
    use tracing_test::traced_test;

    use super::*;

    #[rstest]
    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn panicking_pass_does_not_stop_the_loop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let counter = Arc::clone(&runs);
        let handle = tokio::spawn(run_periodic(
            "test",
            Duration::from_secs(1),
            shutdown.clone(),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    assert!(n != 0, "first pass fails");
                    Ok::<_, WorkerError>(n)
                }
            },
        )
        .in_current_span());

        time::sleep(Duration::from_millis(2500)).await;
        shutdown.cancel();
        handle.await.expect("worker task");

        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert!(logs_contain("worker pass panicked"));
        assert!(logs_contain("first pass fails"));
    }

    #[rstest]
    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn failed_pass_is_logged_and_retried() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let counter = Arc::clone(&runs);
        let handle = tokio::spawn(run_periodic(
            "test",
            Duration::from_secs(1),
            shutdown.clone(),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(WorkerError::Store(StoreError::Unavailable("offline".into())))
                }
            },
        )
        .in_current_span());

        time::sleep(Duration::from_millis(1500)).await;
        shutdown.cancel();
        handle.await.expect("worker task");

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(logs_contain("retrying next tick"));
    }
}
