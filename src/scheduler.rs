//! Background worker that fires delayed retry attempts.
//!
//! A single dedicated thread runs a current-thread tokio runtime; each
//! scheduled job becomes a sleep future in a [`FuturesUnordered`], so
//! scheduling never blocks the calling thread and delays overlap freely.
//! The owner must call [`RetryScheduler::shutdown`] to release the thread;
//! scheduling after shutdown is rejected so callers can fail a would-be
//! retry immediately instead of dropping it silently. Jobs still pending at
//! shutdown are discarded.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send>;

struct DelayedJob {
    delay: Duration,
    run: Job,
}

/// Returned by [`RetryScheduler::schedule`] once the scheduler has shut down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("retry scheduler has been shut down")]
pub struct SchedulerClosed;

/// Single-threaded delayed-job scheduler for retry attempts.
#[derive(Debug)]
pub struct RetryScheduler {
    tx: Mutex<Option<mpsc::UnboundedSender<DelayedJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    /// Spawn the worker thread.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = std::thread::Builder::new()
            .name("callguard-retry".into())
            .spawn(move || run_worker(rx))
            .expect("failed to spawn retry scheduler thread");
        Self { tx: Mutex::new(Some(tx)), worker: Mutex::new(Some(worker)) }
    }

    /// Run `job` after `delay` on the worker thread. Never blocks.
    pub fn schedule(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<(), SchedulerClosed> {
        let guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                tx.send(DelayedJob { delay, run: Box::new(job) }).map_err(|_| SchedulerClosed)
            }
            None => Err(SchedulerClosed),
        }
    }

    /// Stop the worker and wait for it to exit. Idempotent; pending jobs are
    /// dropped, and later `schedule` calls return [`SchedulerClosed`].
    pub fn shutdown(&self) {
        let sender = {
            let mut guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.take()
        };
        drop(sender);
        let worker = {
            let mut guard = self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.take()
        };
        if let Some(handle) = worker {
            if handle.join().is_err() {
                tracing::error!("retry scheduler worker panicked");
            }
        }
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        // Closing the channel lets the worker exit on its own; joining here
        // could block an unrelated thread, so shutdown() stays explicit.
        let mut guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.take();
    }
}

fn run_worker(mut rx: mpsc::UnboundedReceiver<DelayedJob>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "failed to build retry scheduler runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let mut pending: FuturesUnordered<_> = FuturesUnordered::new();
        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(DelayedJob { delay, run }) => {
                        pending.push(async move {
                            tokio::time::sleep(delay).await;
                            run
                        });
                    }
                    None => break,
                },
                Some(run) = pending.next(), if !pending.is_empty() => {
                    run();
                }
            }
        }
        tracing::debug!(dropped = pending.len(), "retry scheduler stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn fires_job_after_delay() {
        let scheduler = RetryScheduler::new();
        let (done_tx, done_rx) = std_mpsc::channel();

        let start = Instant::now();
        scheduler
            .schedule(Duration::from_millis(20), move || {
                done_tx.send(start.elapsed()).unwrap();
            })
            .unwrap();

        let elapsed = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed >= Duration::from_millis(15), "fired too early: {elapsed:?}");
        scheduler.shutdown();
    }

    #[test]
    fn overlapping_delays_fire_independently() {
        let scheduler = RetryScheduler::new();
        let (done_tx, done_rx) = std_mpsc::channel();

        for (label, delay) in [("slow", 60u64), ("fast", 5u64)] {
            let tx = done_tx.clone();
            scheduler
                .schedule(Duration::from_millis(delay), move || {
                    tx.send(label).unwrap();
                })
                .unwrap();
        }

        // The short delay must not queue behind the long one.
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fast");
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "slow");
        scheduler.shutdown();
    }

    #[test]
    fn schedule_after_shutdown_is_rejected() {
        let scheduler = RetryScheduler::new();
        scheduler.shutdown();
        let result = scheduler.schedule(Duration::from_millis(1), || {});
        assert_eq!(result, Err(SchedulerClosed));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let scheduler = RetryScheduler::new();
        scheduler.shutdown();
        scheduler.shutdown();
    }

    #[test]
    fn many_jobs_all_fire() {
        let scheduler = RetryScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = std_mpsc::channel();

        for _ in 0..50 {
            let fired = fired.clone();
            let done_tx = done_tx.clone();
            scheduler
                .schedule(Duration::from_millis(1), move || {
                    if fired.fetch_add(1, Ordering::SeqCst) + 1 == 50 {
                        done_tx.send(()).unwrap();
                    }
                })
                .unwrap();
        }

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 50);
        scheduler.shutdown();
    }
}
