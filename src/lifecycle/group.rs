//! Structured concurrency for listener tasks.
//!
//! # Responsibilities
//! - Spawn tasks against one shared cancellation signal
//! - Record the first failure as the group's cause
//! - Run per-task shutdown hooks once cancellation is observed
//! - Expose "cancelled" and "fully stopped" as separate events
//!
//! # Design Decisions
//! - Cancellation is cooperative: a hook must unblock its task (close the
//!   listener, stop the accept loop); the signal alone interrupts nothing
//! - First cause wins; later causes are dropped, not merged
//! - A task returning `Ok(())` never clears a recorded cause
//! - A child group keeps its own cause; cancelling the parent cancels the
//!   child, a failing child cancels the parent, and the parent's running
//!   count includes the child's tasks

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::error::{EdgeError, EdgeResult};

type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, EdgeResult<()>> + Send>;

/// A set of concurrent tasks sharing one cancellation cause.
///
/// Cheap to clone; every clone refers to the same group.
#[derive(Clone)]
pub struct WorkerGroup {
    inner: Arc<Inner>,
}

struct Inner {
    cause: OnceLock<EdgeError>,
    cancelled: watch::Sender<bool>,
    running: watch::Sender<usize>,
    parent: Option<WorkerGroup>,
    children: Mutex<Vec<Weak<Inner>>>,
}

/// Handle given to each task to observe the group's cancellation.
#[derive(Clone)]
pub struct WorkerContext {
    cancelled: watch::Receiver<bool>,
}

impl WorkerContext {
    /// Resolves once the group has been cancelled.
    pub async fn cancelled(&self) {
        wait_true(self.cancelled.clone()).await
    }

    /// Tell if the group has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

impl WorkerGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<WorkerGroup>) -> Self {
        let (cancelled, _) = watch::channel(false);
        let (running, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(Inner {
                cause: OnceLock::new(),
                cancelled,
                running,
                parent,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a group supervised by this one.
    ///
    /// The child is cancelled with this group, and its failures cancel
    /// this group with the child's cause.
    pub fn child(&self) -> WorkerGroup {
        let child = Self::with_parent(Some(self.clone()));
        {
            let mut children = self.children();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        if self.is_cancelled() {
            child.cancel(self.err().unwrap_or(EdgeError::Cancelled));
        }
        child
    }

    fn children(&self) -> std::sync::MutexGuard<'_, Vec<Weak<Inner>>> {
        self.inner.children.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Context for tasks not spawned through [`WorkerGroup::go`].
    pub fn context(&self) -> WorkerContext {
        WorkerContext {
            cancelled: self.inner.cancelled.subscribe(),
        }
    }

    /// Run `task` concurrently against the group's context.
    pub fn go<F, Fut>(&self, task: F)
    where
        F: FnOnce(WorkerContext) -> Fut,
        Fut: Future<Output = EdgeResult<()>> + Send + 'static,
    {
        self.spawn(task, None);
    }

    /// Run `task` concurrently, and `shutdown` once the group is cancelled.
    ///
    /// The hook is skipped if the task finishes before cancellation.
    pub fn go_with_shutdown<F, Fut, S, SFut>(&self, task: F, shutdown: S)
    where
        F: FnOnce(WorkerContext) -> Fut,
        Fut: Future<Output = EdgeResult<()>> + Send + 'static,
        S: FnOnce() -> SFut + Send + 'static,
        SFut: Future<Output = EdgeResult<()>> + Send + 'static,
    {
        let hook: ShutdownHook = Box::new(move || Box::pin(shutdown()));
        self.spawn(task, Some(hook));
    }

    fn spawn<F, Fut>(&self, task: F, hook: Option<ShutdownHook>)
    where
        F: FnOnce(WorkerContext) -> Fut,
        Fut: Future<Output = EdgeResult<()>> + Send + 'static,
    {
        let fut = task(self.context());
        let (finished_tx, finished_rx) = watch::channel(false);

        let guard = self.track();
        let group = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = fut.await {
                group.fail(err);
            }
            let _ = finished_tx.send(true);
        });

        if let Some(hook) = hook {
            let guard = self.track();
            let ctx = self.context();
            let group = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                tokio::select! {
                    _ = ctx.cancelled() => {
                        if let Err(err) = hook().await {
                            if !err.is_benign() {
                                tracing::warn!(error = %err, "Shutdown hook failed");
                            }
                            group.escalate(err);
                        }
                    }
                    _ = wait_true(finished_rx) => {}
                }
            });
        }
    }

    /// This group followed by its ancestors.
    fn lineage(&self) -> impl Iterator<Item = &WorkerGroup> {
        std::iter::successors(Some(self), |g| g.inner.parent.as_ref())
    }

    fn track(&self) -> TaskGuard {
        for g in self.lineage() {
            g.inner.running.send_modify(|n| *n += 1);
        }
        TaskGuard {
            group: self.clone(),
        }
    }

    fn fail(&self, err: EdgeError) {
        if !err.is_benign() {
            tracing::error!(error = %err, "Worker failed");
            crate::observability::metrics::record_worker_failure();
        }
        self.escalate(err);
    }

    /// Cancel with `err`, then pass non-benign causes up to the parent.
    fn escalate(&self, err: EdgeError) {
        self.cancel(err.clone());
        if let Some(parent) = &self.inner.parent {
            if !err.is_benign() {
                parent.escalate(err);
            }
        }
    }

    /// Cancel the group and its children with `cause`.
    ///
    /// Idempotent: only the first cause is recorded.
    pub fn cancel(&self, cause: EdgeError) {
        let _ = self.inner.cause.set(cause);
        if self.inner.cancelled.send_replace(true) {
            return;
        }

        let children: Vec<_> = self.children().iter().filter_map(Weak::upgrade).collect();
        if children.is_empty() {
            return;
        }
        let cause = self.err().unwrap_or(EdgeError::Cancelled);
        for inner in children {
            WorkerGroup { inner }.cancel(cause.clone());
        }
    }

    /// The recorded cause, without blocking.
    pub fn err(&self) -> Option<EdgeError> {
        self.inner.cause.get().cloned()
    }

    /// Tell if the group has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.context().cancelled().await
    }

    /// Resolves once every spawned task has returned.
    pub async fn done(&self) {
        let mut rx = self.inner.running.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Number of tasks (and pending hooks) still running.
    pub fn running(&self) -> usize {
        *self.inner.running.borrow()
    }

    /// Wait for every task to return, then report the recorded cause.
    ///
    /// Benign causes (intentional cancellation, closed listeners) are
    /// reported as success.
    pub async fn wait(&self) -> EdgeResult<()> {
        self.done().await;
        match self.err() {
            Some(err) if !err.is_benign() => Err(err),
            _ => Ok(()),
        }
    }

    /// Give freshly spawned tasks `healthy` to fail.
    ///
    /// A failure inside the window is awaited to completion and returned,
    /// so start-up errors surface synchronously.
    pub async fn settle(&self, healthy: Duration) -> EdgeResult<()> {
        if !healthy.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(healthy) => {}
                _ = self.cancelled() => return self.wait().await,
            }
        }
        match self.err() {
            Some(err) if !err.is_benign() => Err(err),
            _ => Ok(()),
        }
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("running", &self.running())
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.inner.cause.get())
            .field("child", &self.inner.parent.is_some())
            .finish()
    }
}

async fn wait_true(mut rx: watch::Receiver<bool>) {
    // the sender lives as long as the group
    let _ = rx.wait_for(|v| *v).await;
}

/// Decrements the running count when the task ends, even by panic.
struct TaskGuard {
    group: WorkerGroup,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.group.fail(EdgeError::Worker("task panicked".into()));
        }
        for g in self.group.lineage() {
            g.inner.running.send_modify(|n| *n -= 1);
        }
    }
}
