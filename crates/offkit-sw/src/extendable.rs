//! Event lifetime extension.
//!
//! A handler registers its async work with [`ExtendableEvent::wait_until`];
//! the host must not tear the agent down until [`ExtendableEvent::settle`]
//! has resolved.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::future::Future;
use tracing::trace;

/// An event whose lifetime is extended by the work registered on it.
pub struct ExtendableEvent<'a> {
    name: &'static str,
    pending: Vec<BoxFuture<'a, ()>>,
}

impl<'a> ExtendableEvent<'a> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Keep the event alive until `work` completes.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'a,
    {
        self.pending.push(work.boxed());
    }

    /// Number of registered, not yet settled futures.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drive all registered work to completion. Returns how many futures ran.
    pub async fn settle(self) -> usize {
        let count = self.pending.len();
        trace!(event = self.name, pending = count, "Settling event");
        join_all(self.pending).await;
        count
    }
}

impl std::fmt::Debug for ExtendableEvent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendableEvent")
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_settle_waits_for_all_work() {
        let done = AtomicUsize::new(0);
        let mut event = ExtendableEvent::new("push");

        for delay in [5, 1, 3] {
            let done = &done;
            event.wait_until(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(event.pending(), 3);
        assert_eq!(done.load(Ordering::SeqCst), 0);

        assert_eq!(event.settle().await, 3);
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_settle_without_work() {
        let event = ExtendableEvent::new("activate");
        assert_eq!(event.settle().await, 0);
    }
}
