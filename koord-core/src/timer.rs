//! Cancellable delayed tasks for the election timers.
//!
//! A [`DelayedTask`] delivers one message to a mailbox after a delay. Arming
//! it again aborts the pending delivery; every arm gets a new generation so a
//! fire that was already queued when the timer was re-armed can be told apart
//! and ignored.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct DelayedTask {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl DelayedTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `make(generation)` on `tx` after `delay`, cancelling any
    /// pending delivery. Returns the new generation.
    pub fn arm<T, F>(&mut self, delay: Duration, tx: mpsc::UnboundedSender<T>, make: F) -> u64
    where
        T: Send + 'static,
        F: FnOnce(u64) -> T + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(make(generation));
        }));
        generation
    }

    /// Abort the pending delivery (if any) and invalidate queued fires
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation += 1;
    }

    /// True if `generation` belongs to the latest arm and was not cancelled
    pub fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && generation == self.generation
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DelayedTask::new();
        let gen = timer.arm(Duration::from_millis(100), tx, |g| g);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, gen);
        assert!(timer.is_current(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DelayedTask::new();
        let first = timer.arm(Duration::from_millis(100), tx.clone(), |g| g);
        let second = timer.arm(Duration::from_millis(200), tx, |g| g);
        assert_ne!(first, second);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, second);
        assert!(!timer.is_current(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_invalidates_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let mut timer = DelayedTask::new();
        let gen = timer.arm(Duration::from_millis(50), tx, |g| g);
        timer.cancel();
        assert!(!timer.is_current(gen));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
