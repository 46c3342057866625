//! Execution contexts and observer plumbing
//!
//! Every channel works with three serial contexts built from [`TaskQueue`]:
//! the media-engine context, the signaling outbox and the application
//! [`EventQueue`]. Observer callbacks and operation results are only ever
//! delivered on an `EventQueue`, never on the caller's stack.

mod observers;
mod queue;

pub use observers::ObserverList;
pub use queue::TaskQueue;

use std::future::Future;
use std::sync::{Arc, Weak};

/// Application-facing callback queue
///
/// Cloning yields another handle to the same queue. A client usually
/// shares one queue between all of its channels.
#[derive(Clone, Debug)]
pub struct EventQueue {
    queue: TaskQueue,
}

impl EventQueue {
    /// Create a new event queue. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self {
            queue: TaskQueue::new("event-queue"),
        }
    }

    /// Run `f` on the event queue
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.post_fn(f);
    }

    /// Run an async task on the event queue
    pub fn post_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.queue.post(task);
    }

    /// Run `f` with the target if it is still alive when the task runs
    ///
    /// A target that has been dropped in the meantime turns the task into a
    /// no-op.
    pub fn post_weak<T, F>(&self, target: Weak<T>, f: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce(Arc<T>) + Send + 'static,
    {
        self.queue.post_fn(move || {
            if let Some(target) = target.upgrade() {
                f(target);
            }
        });
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    async fn flush(queue: &EventQueue) {
        let (tx, rx) = oneshot::channel();
        queue.post(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_tasks_run_in_order() {
        let queue = EventQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = seen.clone();
            queue.post(move || seen.lock().push(i));
        }
        flush(&queue).await;

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_async_task_blocks_followers() {
        let queue = TaskQueue::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let s = seen.clone();
        queue.post(async move {
            let _ = gate_rx.await;
            s.lock().push("first");
        });
        let s = seen.clone();
        queue.post_fn(move || s.lock().push("second"));

        tokio::task::yield_now().await;
        assert!(seen.lock().is_empty());

        gate_tx.send(()).unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        queue.post_fn(move || {
            let _ = done_tx.send(());
        });
        done_rx.await.unwrap();
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_post_weak_skips_dropped_target() {
        let queue = EventQueue::new();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        queue.post_task(async move {
            let _ = gate_rx.await;
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let target = Arc::new(String::from("channel"));

        let c = calls.clone();
        queue.post_weak(Arc::downgrade(&target), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(target);

        gate_tx.send(()).unwrap();
        flush(&queue).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stop_queue() {
        let queue = EventQueue::new();
        queue.post(|| panic!("observer bug"));
        flush(&queue).await;
    }

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct Observer(&'static str);

    impl Named for Observer {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_observer_list_dedup_and_remove() {
        let list: ObserverList<dyn Named> = ObserverList::new();
        let a: Arc<dyn Named> = Arc::new(Observer("a"));
        let b: Arc<dyn Named> = Arc::new(Observer("b"));

        list.add(a.clone());
        list.add(a.clone());
        list.add(b.clone());
        assert_eq!(list.len(), 2);

        let unknown: Arc<dyn Named> = Arc::new(Observer("a"));
        list.remove(&unknown);
        assert_eq!(list.len(), 2);

        list.remove(&a);
        let names: Vec<String> = list.snapshot().iter().map(|o| o.name().to_string()).collect();
        assert_eq!(names, vec!["b"]);
    }
}
