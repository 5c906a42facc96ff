//! Background garbage collection of expired limiter state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

/// State that can drop expired entries on demand.
///
/// Implementations must make overlapping calls safe; the in-memory limiters
/// skip a sweep if another one is still running.
pub trait Sweep: Send + Sync {
    /// Remove expired entries and return how many were removed.
    fn sweep_expired(&self) -> usize;
}

/// Spawns recurring sweeps on the tokio runtime.
pub struct Sweeper;

impl Sweeper {
    /// Sweep `target` every `interval` until the returned handle is stopped
    /// or dropped. The first sweep runs one full interval after spawning.
    pub fn spawn(
        name: impl Into<String>,
        target: Arc<dyn Sweep>,
        interval: Duration,
    ) -> SweepHandle {
        let name = name.into();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task_name = name.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = IntervalStream::new(ticker);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                        let removed = target.sweep_expired();
                        debug!(limiter = %task_name, removed, "Sweep finished");
                    }
                }
            }
        });

        info!(limiter = %name, interval_ms = interval.as_millis() as u64, "Started sweeper");

        SweepHandle {
            name,
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}

/// Cancellable handle to a running sweeper.
pub struct SweepHandle {
    name: String,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the sweeper and wait for an in-progress sweep to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!(limiter = %self.name, "Stopped sweeper");
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
