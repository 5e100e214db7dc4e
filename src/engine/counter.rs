use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Length of the repeated upload pattern.
pub const REPEAT_SIZE: usize = 1024;

/// Per-direction cumulative byte counter shared between many I/O workers and
/// one sampler. Writers call [`Counter::add`], the sampler reads deltas with
/// [`Counter::total`]. The counter also carries the direction's one-shot
/// cancellation signal so that every chunk and worker observes the same stop.
pub struct Counter {
    total: AtomicU64,
    cancel: watch::Sender<bool>,
    repeat: Bytes,
}

impl Counter {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            total: AtomicU64::new(0),
            cancel,
            // Uniformly distributed sequence of bits for upload fill.
            repeat: Bytes::from(vec![0xAA; REPEAT_SIZE]),
        }
    }

    pub fn add(&self, delta: u64) {
        self.total.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Close the cancellation signal. Idempotent; the open -> closed
    /// transition happens at most once.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the direction is cancelled. Safe to poll from any number
    /// of workers concurrently.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        // The sender lives as long as self, so wait_for only fails after
        // cancellation has already been observed.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// The shared 1 KiB upload pattern. Cloning is a refcount bump.
    pub fn repeat(&self) -> Bytes {
        self.repeat.clone()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}
