use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Serial task executor
///
/// Tasks run one at a time, in the order they were posted, on a single
/// spawned tokio task. Each task runs to completion (including its awaits)
/// before the next one starts. A panicking task is logged and skipped.
///
/// The worker exits once every handle has been dropped and the backlog is
/// drained. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct TaskQueue {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Task>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();

        let worker_name = name.clone();
        tokio::spawn(async move {
            trace!("Task queue {} started", worker_name);
            while let Some(task) = rx.recv().await {
                if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                    warn!("Task queue {}: task panicked", worker_name);
                }
            }
            trace!("Task queue {} stopped", worker_name);
        });

        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post a future to run after every previously posted task
    pub fn post<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(task)).is_err() {
            debug!("Task queue {} is gone, task dropped", self.name);
        }
    }

    /// Post a plain closure
    pub fn post_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(async move { f() });
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("name", &self.name).finish()
    }
}
