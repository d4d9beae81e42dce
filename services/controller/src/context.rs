//! Shared state handed to every reconcile of one controller.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use cadence_reconcile::{RequeueBackoff, DEFAULT_BACKOFF_MAX};
use kube::runtime::controller::Action;
use tokio::sync::{oneshot, watch};

use crate::Outcome;

pub struct ControllerContext<R> {
    pub reconciler: R,
    backoff: Mutex<RequeueBackoff>,
    resync: Duration,
}

impl<R> ControllerContext<R> {
    pub fn new(reconciler: R, resync: Duration) -> Self {
        Self {
            reconciler,
            backoff: Mutex::new(RequeueBackoff::default()),
            resync,
        }
    }

    /// Record a failed reconcile and return the delay before the next one.
    pub fn requeue_after_failure(&self, key: &str) -> Duration {
        self.backoff
            .lock()
            .map(|mut backoff| backoff.record_failure(key))
            .unwrap_or(DEFAULT_BACKOFF_MAX)
    }

    /// Forget the failures of a key after a successful reconcile.
    pub fn reset(&self, key: &str) {
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.clear(key);
        }
    }

    pub fn action_for(&self, outcome: Outcome) -> Action {
        match outcome {
            Outcome::Active => Action::requeue(self.resync),
            Outcome::NotFound | Outcome::Terminal => Action::await_change(),
        }
    }
}

/// Resolve once the shutdown flag flips or its sender is dropped.
///
/// `Controller::graceful_shutdown_on` wants a `Sync` future, which a
/// `watch::Receiver::changed` future is not; a relay task bridges the two.
pub(crate) fn shutdown_signal(
    mut shutdown: watch::Receiver<bool>,
) -> impl Future<Output = ()> + Send + Sync + 'static {
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        let _ = tx.send(());
    });
    async move {
        let _ = rx.await;
    }
}
