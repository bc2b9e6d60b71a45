//! Supervision trees.
//!
//! A [`Supervisor`] owns a dying signal, an optional failure cause, and
//! the set of tasks spawned under it. Cancelling a supervisor marks it
//! and every descendant created through [`Supervisor::child`] as dying.
//! Nothing is aborted: tasks observe death at their own suspension
//! points through [`Supervisor::dying`].
//!
//! ```text
//! root (server)
//!   └── listener
//!         ├── connection 1
//!         │     ├── read pump
//!         │     ├── write pump
//!         │     └── channel handlers...
//!         └── connection 2
//! ```
//!
//! A child's failures are recorded on the child only. Whoever owns the
//! child is expected to `wait()` on it from a task running under the
//! parent, which is how failures travel upward when they should.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::trace;

/// The first failure recorded by a supervisor.
///
/// Cloneable so that every caller of [`Supervisor::wait`] observes the
/// same error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0:#}")]
pub struct TaskFailure(Arc<anyhow::Error>);

impl TaskFailure {
    fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    /// The underlying error.
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }
}

struct Inner {
    token: CancellationToken,
    tracker: TaskTracker,
    failure: Mutex<Option<TaskFailure>>,
}

impl Inner {
    fn record(&self, err: anyhow::Error) {
        let mut slot = self.failure.lock().expect("failure lock");
        if slot.is_none() {
            *slot = Some(TaskFailure::new(err));
        }
    }
}

/// A node in a supervision tree. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a root supervisor.
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    fn with_token(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                token,
                tracker: TaskTracker::new(),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Create a child that dies whenever this supervisor dies.
    ///
    /// The child has its own task set and failure slot. Cancelling the
    /// child does not affect the parent or the child's siblings.
    pub fn child(&self) -> Self {
        Self::with_token(self.inner.token.child_token())
    }

    /// Run `task` under this supervisor.
    ///
    /// An error returned by the task is recorded (first one wins) but
    /// siblings keep running.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            if let Err(err) = task.await {
                inner.record(err);
            }
        });
    }

    /// Run `task` under this supervisor; if it fails, cancel the
    /// supervisor with that failure as the cause.
    pub fn spawn_critical<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            if let Err(err) = task.await {
                this.cancel(Some(err));
            }
        });
    }

    /// Mark this supervisor and all of its descendants as dying.
    ///
    /// Idempotent: once dying, later calls (and their causes) are
    /// ignored.
    pub fn cancel(&self, cause: Option<anyhow::Error>) {
        if self.inner.token.is_cancelled() {
            return;
        }
        if let Some(err) = cause {
            trace!(error = %err, "supervisor cancelled with cause");
            self.inner.record(err);
        }
        self.inner.token.cancel();
    }

    /// Whether this supervisor (or an ancestor) has been cancelled.
    pub fn is_dying(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once this supervisor (or an ancestor) is cancelled.
    pub fn dying(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// The first recorded failure, if any.
    pub fn failure(&self) -> Option<TaskFailure> {
        self.inner.failure.lock().expect("failure lock").clone()
    }

    /// Number of tasks still running under this supervisor.
    pub fn active(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Wait for every task spawned under this supervisor to return.
    ///
    /// Returns the first failure recorded, either a task error or a
    /// cancellation cause.
    pub async fn wait(&self) -> Result<(), TaskFailure> {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        match self.failure() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("dying", &self.is_dying())
            .field("active", &self.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn wait_with_no_tasks_returns_ok() {
        let sup = Supervisor::new();
        assert!(sup.wait().await.is_ok());
    }

    #[tokio::test]
    async fn wait_returns_first_failure() {
        let sup = Supervisor::new();
        sup.spawn(async { Err(anyhow::anyhow!("first")) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sup.spawn(async { Err(anyhow::anyhow!("second")) });

        let err = sup.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[tokio::test]
    async fn failure_does_not_cancel_siblings() {
        let sup = Supervisor::new();
        let finished = Arc::new(AtomicBool::new(false));

        sup.spawn(async { Err(anyhow::anyhow!("boom")) });
        let flag = finished.clone();
        sup.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert!(sup.wait().await.is_err());
        assert!(!sup.is_dying());
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn critical_failure_cancels_siblings() {
        let sup = Supervisor::new();

        let watcher = sup.clone();
        sup.spawn(async move {
            watcher.dying().await;
            Ok(())
        });
        sup.spawn_critical(async { Err(anyhow::anyhow!("fatal")) });

        let err = tokio::time::timeout(Duration::from_secs(1), sup.wait())
            .await
            .expect("siblings unwound")
            .unwrap_err();
        assert_eq!(err.to_string(), "fatal");
        assert!(sup.is_dying());
    }

    #[tokio::test]
    async fn cancel_propagates_to_children() {
        let root = Supervisor::new();
        let child = root.child();
        let grandchild = child.child();

        root.cancel(None);

        assert!(child.is_dying());
        assert!(grandchild.is_dying());
    }

    #[tokio::test]
    async fn child_cancel_does_not_reach_parent() {
        let root = Supervisor::new();
        let child = root.child();

        child.cancel(None);

        assert!(child.is_dying());
        assert!(!root.is_dying());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_first_cause_wins() {
        let sup = Supervisor::new();
        sup.cancel(Some(anyhow::anyhow!("first cause")));
        sup.cancel(Some(anyhow::anyhow!("second cause")));
        sup.cancel(None);

        let err = sup.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "first cause");
    }

    #[tokio::test]
    async fn wait_blocks_until_tasks_observe_death() {
        let sup = Supervisor::new();
        let unwound = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let worker = sup.clone();
            let counter = unwound.clone();
            sup.spawn(async move {
                worker.dying().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        sup.cancel(None);
        sup.wait().await.unwrap();
        assert_eq!(unwound.load(Ordering::SeqCst), 3);
        assert_eq!(sup.active(), 0);
    }

    #[tokio::test]
    async fn child_failure_is_not_recorded_on_parent() {
        let root = Supervisor::new();
        let child = root.child();
        child.spawn(async { Err(anyhow::anyhow!("child failed")) });

        assert!(child.wait().await.is_err());
        assert!(root.failure().is_none());
    }
}
