//! Shared state with change notification.
//!
//! Every event-driven readiness source in the I/O context (stream pipes, accept queues,
//! datagram queues, name lookups) is a `Shared<S>`: a mutex-protected state plus a
//! [`Notify`] that is fired after every mutation.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;

use super::poll::Subscribe;

#[derive(Debug)]
pub struct Shared<S> {
    state: Mutex<S>,
    notify: Notify,
}

impl<S> Shared<S> {
    pub fn new(state: S) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            notify: Notify::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the state and wake every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let result = f(&mut self.lock());
        self.notify.notify_waiters();
        result
    }

    /// Wait until `check` yields a value.
    ///
    /// The waiter is registered before the state is inspected, so a notification that
    /// races with the check is never lost.
    pub async fn wait_for<R>(&self, mut check: impl FnMut(&mut S) -> Option<R>) -> R {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = check(&mut self.lock());
            if let Some(result) = outcome {
                self.notify.notify_waiters();
                return result;
            }
            notified.await;
        }
    }
}

/// Event-driven readiness over a [`Shared`] state.
///
/// Holds only a weak reference: once the owning resource is gone the source reports
/// ready, so no waiter can hang on a dropped resource.
pub struct Readiness<S> {
    shared: Weak<Shared<S>>,
    check: fn(&S) -> bool,
}

impl<S> Readiness<S> {
    pub fn new(shared: &Arc<Shared<S>>, check: fn(&S) -> bool) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            check,
        }
    }
}

impl<S: Send + 'static> Subscribe for Readiness<S> {
    fn is_ready(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => (self.check)(&shared.lock()),
            None => true,
        }
    }

    fn wait(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(shared) = self.shared.upgrade() {
                let check = self.check;
                shared.wait_for(|state| check(state).then_some(())).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_for_wakes_on_update() {
        let shared = Shared::new(0u32);
        let waiter = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { shared.wait_for(|n| (*n >= 3).then_some(*n)).await })
        };

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            shared.update(|n| *n += 1);
        }

        let seen = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter hung")
            .unwrap();
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn test_readiness_of_dropped_source_is_ready() {
        let shared = Shared::new(false);
        let readiness = Readiness::new(&shared, |ready| *ready);
        assert!(!readiness.is_ready());

        drop(shared);
        assert!(readiness.is_ready());
        readiness.wait().await;
    }
}
