//! Single-assignment result cell shared between a producer and any number of waiters.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

struct Inner<T, E> {
    slot: watch::Sender<Option<Result<T, E>>>,
}

/// A result that settles exactly once.
///
/// `resolve` and `reject` only commit while the cell is pending; later calls are ignored.
/// Every future returned by [`Deferred::wait`] observes the same settlement.
pub struct Deferred<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.slot.borrow() {
            None => "pending",
            Some(Ok(_)) => "fulfilled",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner { slot }),
        }
    }

    /// Fulfils the cell. Returns `false` when it had already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Rejects the cell. Returns `false` when it had already settled.
    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    pub fn settled(&self) -> bool {
        self.inner.slot.borrow().is_some()
    }

    /// Current settlement without waiting.
    pub fn peek(&self) -> Option<Result<T, E>> {
        self.inner.slot.borrow().clone()
    }

    /// Future for the eventual settlement. Can be called any number of times.
    pub fn wait(&self) -> impl Future<Output = Result<T, E>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        async move {
            let mut rx = inner.slot.subscribe();
            loop {
                if let Some(outcome) = rx.borrow_and_update().clone() {
                    return outcome;
                }
                // `inner` owns the sender, so the channel cannot close under us.
                if rx.changed().await.is_err() {
                    futures::future::pending::<()>().await;
                }
            }
        }
    }

    fn settle(&self, outcome: Result<T, E>) -> bool {
        self.inner.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn first_settlement_wins() {
        let deferred: Deferred<u32, String> = Deferred::new();
        assert!(!deferred.settled());

        assert!(deferred.reject("boom".into()));
        assert!(deferred.settled());
        assert!(!deferred.resolve(7));
        assert!(!deferred.reject("again".into()));

        assert_eq!(deferred.peek(), Some(Err("boom".to_string())));
    }

    #[test]
    fn resolve_then_reject_keeps_value() {
        let deferred: Deferred<u32, String> = Deferred::new();
        deferred.resolve(3);
        deferred.reject("late".into());
        assert_eq!(deferred.peek(), Some(Ok(3)));
    }

    #[test]
    fn waiters_wake_on_settlement() {
        let deferred: Deferred<u32, String> = Deferred::new();
        let mut first = task::spawn(deferred.wait());
        let mut second = task::spawn(deferred.wait());

        assert_pending!(first.poll());
        assert_pending!(second.poll());

        deferred.resolve(42);

        assert!(first.is_woken());
        assert_ready_eq!(first.poll(), Ok(42));
        assert_ready_eq!(second.poll(), Ok(42));
    }

    #[tokio::test]
    async fn wait_after_settlement_is_immediate() {
        let deferred: Deferred<&'static str, String> = Deferred::new();
        deferred.resolve("done");
        assert_eq!(deferred.wait().await, Ok("done"));
        assert_eq!(deferred.clone().wait().await, Ok("done"));
    }
}
