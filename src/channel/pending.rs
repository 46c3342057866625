use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Result, SessionError};
use crate::events::EventQueue;

/// Result of an asynchronous channel operation
///
/// Resolves exactly once, on the channel's event queue. If the channel is
/// dropped before the operation completes the result is
/// [`SessionError::Aborted`].
#[must_use = "the operation result is only observable through the Pending"]
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Completion side of a [`Pending`]
///
/// Consumed on resolution, so a second completion cannot be expressed.
#[derive(Debug)]
pub struct Responder<T> {
    tx: oneshot::Sender<Result<T>>,
    events: EventQueue,
}

/// Create a linked responder/pending pair delivering on `events`
pub fn pending<T: Send + 'static>(events: &EventQueue) -> (Responder<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Responder {
            tx,
            events: events.clone(),
        },
        Pending { rx },
    )
}

impl<T: Send + 'static> Responder<T> {
    pub fn resolve(self, result: Result<T>) {
        let tx = self.tx;
        self.events.post(move || {
            // The caller may have dropped its Pending; nothing to deliver to
            let _ = tx.send(result);
        });
    }

    pub fn succeed(self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn fail(self, error: SessionError) {
        self.resolve(Err(error));
    }
}

impl<T: Send + 'static> Pending<T> {
    /// An operation that has already failed
    pub fn failed(events: &EventQueue, error: SessionError) -> Self {
        let (responder, pending) = pending(events);
        responder.fail(error);
        pending
    }

    /// An operation that has already succeeded
    pub fn ready(events: &EventQueue, value: T) -> Self {
        let (responder, pending) = pending(events);
        responder.succeed(value);
        pending
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SessionError::Aborted(
                "Channel dropped before the operation completed".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_once() {
        let events = EventQueue::new();
        let (responder, pending) = pending::<u32>(&events);
        responder.succeed(7);
        assert_eq!(pending.await, Ok(7));
    }

    #[tokio::test]
    async fn test_failed_and_ready() {
        let events = EventQueue::new();
        let busy = Pending::<()>::failed(&events, SessionError::Busy("publish".into()));
        assert_eq!(busy.await, Err(SessionError::Busy("publish".into())));
        assert_eq!(Pending::ready(&events, "id".to_string()).await.unwrap(), "id");
    }

    #[tokio::test]
    async fn test_dropped_responder_aborts() {
        let events = EventQueue::new();
        let (responder, pending) = pending::<()>(&events);
        drop(responder);
        assert!(matches!(pending.await, Err(SessionError::Aborted(_))));
    }
}
