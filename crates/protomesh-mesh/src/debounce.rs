//! Event debouncing
//!
//! Shared by the reconciler and the distribution server. Events are gathered
//! until the stream has been quiet for `quiet_period`, or until `max_wait` has
//! elapsed since the first gathered event, then handed over as one batch.
//! Batches are pushed one at a time: the next batch is not gathered until the
//! previous push has completed.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Debounce timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Time without events before a batch is pushed
    pub quiet_period: Duration,
    /// Longest a batch may be held back under continuous events
    pub max_wait: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(1000),
            max_wait: Duration::from_millis(10_000),
        }
    }
}

impl DebounceConfig {
    pub fn new(quiet_period: Duration, max_wait: Duration) -> Self {
        Self {
            quiet_period,
            max_wait: max_wait.max(quiet_period),
        }
    }
}

/// Batches events received on a channel
pub struct Debouncer<E> {
    config: DebounceConfig,
    rx: mpsc::Receiver<E>,
}

impl<E> Debouncer<E> {
    pub fn new(config: DebounceConfig, rx: mpsc::Receiver<E>) -> Self {
        Self { config, rx }
    }

    /// Run until every sender is dropped
    ///
    /// Events still pending when the channel closes are pushed before
    /// returning.
    pub async fn run<F, Fut>(mut self, mut push: F)
    where
        F: FnMut(Vec<E>) -> Fut,
        Fut: Future<Output = ()>,
    {
        while let Some(first) = self.rx.recv().await {
            let started = Instant::now();
            let mut last = started;
            let mut batch = vec![first];
            let mut closed = false;

            loop {
                let deadline = (last + self.config.quiet_period).min(started + self.config.max_wait);
                tokio::select! {
                    event = self.rx.recv() => match event {
                        Some(event) => {
                            batch.push(event);
                            last = Instant::now();
                        }
                        None => {
                            closed = true;
                            break;
                        }
                    },
                    _ = sleep_until(deadline) => break,
                }
            }

            debug!(
                events = batch.len(),
                waited_ms = started.elapsed().as_millis() as u64,
                "Pushing debounced batch"
            );
            push(batch).await;

            if closed {
                break;
            }
        }
    }
}
