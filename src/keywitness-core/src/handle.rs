//! A single handle over whichever pipeline layers are active.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::counter::CountEvent;
use crate::error::WitnessError;
use crate::types::{CompromiseStatus, CountReading};
use crate::validator::ValidationStats;

/// Common surface of the validator, integrity chain and hardware binding.
///
/// The orchestrator holds an `Arc<dyn WitnessCounter>` for the outermost
/// active layer.
#[async_trait]
pub trait WitnessCounter: Send + Sync {
    /// Current count, tainted once integrity is lost.
    fn count(&self) -> CountReading;

    /// Notify when the count grows by at least `threshold`.
    fn subscribe(&self, threshold: u64) -> Result<mpsc::Receiver<CountEvent>, WitnessError>;

    /// Compromise flag and reason.
    fn is_compromised(&self) -> CompromiseStatus;

    /// Reconciliation statistics.
    fn validation_stats(&self) -> ValidationStats;

    /// Run one reconciliation step.
    async fn tick(&self);

    /// Start the background tick task.
    fn start(self: Arc<Self>) -> Result<(), WitnessError>;

    /// Stop the background task (bounded wait) and close subscribers.
    async fn stop(&self);
}
