//! One-shot broadcast signal.
//!
//! A `Latch` is fired at most once with a value. Any number of `LatchWaiter`
//! clones can wait for it, including waiters that subscribe after it fired.

use tokio::sync::watch;

pub struct Latch<T> {
    tx: watch::Sender<Option<T>>,
}

#[derive(Clone)]
pub struct LatchWaiter<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Latch<T> {
    pub fn new() -> (Self, LatchWaiter<T>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, LatchWaiter { rx })
    }

    /// Resolve the latch. Consumes it, so it can only happen once.
    pub fn fire(self, value: T) {
        self.tx.send_replace(Some(value));
    }
}

impl<T: Clone> LatchWaiter<T> {
    /// Wait for the latch to fire.
    ///
    /// Returns `None` if the latch was dropped without firing.
    pub async fn wait(&self) -> Option<T> {
        let mut rx = self.rx.clone();
        // An error only means the sender is gone; it may still have fired first.
        let _ = rx.wait_for(Option::is_some).await;
        let value = rx.borrow().clone();
        value
    }

    pub fn is_fired(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn every_waiter_observes_the_value() {
        let (latch, waiter) = Latch::<u32>::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let waiter = waiter.clone();
                tokio::spawn(async move { waiter.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_fired());
        latch.fire(7);

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(7));
        }
    }

    #[tokio::test]
    async fn late_waiters_see_the_value_immediately() {
        let (latch, waiter) = Latch::new();
        latch.fire("done".to_string());
        assert!(waiter.is_fired());
        assert_eq!(waiter.wait().await.as_deref(), Some("done"));
        assert_eq!(waiter.clone().wait().await.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn dropped_latch_releases_waiters() {
        let (latch, waiter) = Latch::<u32>::new();
        drop(latch);
        assert_eq!(waiter.wait().await, None);
    }
}
