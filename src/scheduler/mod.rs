//! Interval scheduler: periodic jobs with jitter and clean shutdown
//!
//! Each job runs its tick inline in its own task, so a task type never
//! overlaps with itself; a tick that would fire while the previous one is
//! still running is deferred. Shutdown cancels ticks mid-flight.

use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct Scheduler {
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Scheduler {
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a named periodic job. `jitter` is a fraction of the interval
    /// (0.1 = up to 10% extra delay per tick) to de-synchronize tasks that
    /// share an interval.
    pub fn spawn<F, Fut>(&self, name: &'static str, interval: Duration, jitter: f64, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            info!(job = name, interval_secs = interval.as_secs(), "scheduler job started");
            loop {
                let delay = jittered(interval, jitter);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => break,
                }
                tokio::select! {
                    _ = job() => {}
                    _ = shutdown_rx.recv() => {
                        debug!(job = name, "tick cancelled by shutdown");
                        break;
                    }
                }
            }
            debug!(job = name, "scheduler job stopped");
        });
        self.handles.lock().push(handle);
    }

    /// Stop all jobs, cancelling any in-flight tick, and wait for the tasks
    /// to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn jittered(interval: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return interval;
    }
    let extra = rand::thread_rng().gen_range(0.0..jitter.min(1.0));
    interval.mul_f64(1.0 + extra)
}
