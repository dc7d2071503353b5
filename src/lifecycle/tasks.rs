//! Scheduled background work.
//!
//! Watchdogs and sweeps run as Tokio tasks on Tokio's timer, so tests can
//! drive them with `tokio::time::pause` and `advance`.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// A spawned task that is aborted when this handle is dropped.
#[derive(Debug)]
pub struct ScheduledTask(JoinHandle<()>);

impl ScheduledTask {
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawn `task` without delay; it dies with the returned handle.
pub fn spawn_scoped<F>(task: F) -> ScheduledTask
where
    F: Future<Output = ()> + Send + 'static,
{
    ScheduledTask(tokio::spawn(task))
}

/// Run `task` once after `delay`, unless the handle is dropped first.
pub fn spawn_after<F>(delay: Duration, task: F) -> ScheduledTask
where
    F: Future<Output = ()> + Send + 'static,
{
    spawn_scoped(async move {
        tokio::time::sleep(delay).await;
        task.await;
    })
}

/// Run `tick` every `period` until shutdown is signalled.
pub fn spawn_every<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => tick(),
                _ = shutdown.recv() => {
                    tracing::debug!(task = name, "Periodic task stopping");
                    break;
                }
            }
        }
    })
}
