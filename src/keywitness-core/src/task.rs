//! Periodic background tasks with bounded shutdown.
//!
//! Each layer that reconciles on a timer owns a [`TaskSlot`]. The task
//! checks a cancellation flag every tick; `stop` signals it and waits at most
//! `stop_timeout` (never less than one tick) before aborting it.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::WitnessError;

/// A running periodic task.
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period` on the current tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Result<Self, WitnessError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| WitnessError::NoRuntime)?;
        let (cancel, mut cancelled) = watch::channel(false);

        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; reconcile one period later.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if *cancelled.borrow() {
                            break;
                        }
                        tick().await;
                    }
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(task = name, "periodic task exited");
        });

        debug!(task = name, period_ms = period.as_millis() as u64, "periodic task started");
        Ok(Self {
            name,
            period,
            cancel,
            handle,
        })
    }

    /// Signal cancellation and wait for the task to exit.
    pub async fn stop(self, stop_timeout: Duration) {
        if self.cancel.send(true).is_err() {
            debug!(task = self.name, "periodic task already exited");
        }
        let bound = stop_timeout.max(self.period);
        let mut handle = self.handle;

        match tokio::time::timeout(bound, &mut handle).await {
            Ok(_) => debug!(task = self.name, "periodic task stopped"),
            Err(_) => {
                warn!(
                    task = self.name,
                    timeout_ms = bound.as_millis() as u64,
                    "periodic task did not stop in time, aborting"
                );
                handle.abort();
            },
        }
    }
}

/// Holder for at most one running task.
#[derive(Default)]
pub struct TaskSlot(Mutex<Option<PeriodicTask>>);

impl TaskSlot {
    fn lock(&self) -> MutexGuard<'_, Option<PeriodicTask>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a task unless one is already running.
    pub fn start<F, Fut>(&self, name: &'static str, period: Duration, tick: F) -> Result<(), WitnessError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(WitnessError::AlreadyRunning {
                component: name.to_string(),
            });
        }
        *slot = Some(PeriodicTask::spawn(name, period, tick)?);
        Ok(())
    }

    /// Stop the running task, if any.
    pub async fn stop(&self, stop_timeout: Duration) {
        let task = self.lock().take();
        if let Some(task) = task {
            task.stop(stop_timeout).await;
        }
    }

    /// Whether a task is held.
    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }
}
