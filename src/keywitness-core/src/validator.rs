//! Cross-source reconciliation of two independent event counts.
//!
//! The primary source sees every event the OS delivers, including injected
//! ones. The reference source sits closer to the hardware and only sees
//! physical presses. Each tick compares the growth of both: primary growth the
//! reference cannot account for is counted as synthetic.
//!
//! In strict mode only reference-confirmed events are credited to the
//! validated count. Without a reference source the validator degrades to
//! permissive mode and says so in its stats.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ValidatorConfig;
use crate::counter::{CountEvent, EventCounter};
use crate::error::WitnessError;
use crate::handle::WitnessCounter;
use crate::task::TaskSlot;
use crate::types::{CompromiseStatus, CountReading};

/// Reference source as seen by the validator.
#[derive(Debug, Clone)]
pub enum ReferenceSource {
    /// Reference counter is live.
    Available(Arc<EventCounter>),
    /// Reference could not be started.
    Unavailable {
        /// Why it is unavailable.
        reason: String,
    },
}

/// Outcome of a single reconciliation tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Primary growth since the previous tick.
    pub primary_delta: u64,
    /// Reference growth since the previous tick.
    pub reference_delta: u64,
    /// Events credited to the validated count.
    pub credited: u64,
    /// Primary events the reference could not account for.
    pub synthetic: u64,
    /// Reference events beyond primary growth this tick.
    pub reference_surplus: u64,
}

/// Comparison of two absolute counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossValidation {
    /// Primary count.
    pub primary_count: i64,
    /// Reference count.
    pub reference_count: i64,
    /// `primary - reference`.
    pub discrepancy: i64,
    /// Whether the primary exceeds the reference.
    pub synthetic_detected: bool,
    /// Discrepancy as a percentage of the primary count.
    pub synthetic_percentage: f64,
}

/// Compare two absolute counts.
pub fn cross_validate(primary: i64, reference: i64) -> CrossValidation {
    let discrepancy = primary.saturating_sub(reference);
    let synthetic_percentage = if primary > 0 && discrepancy > 0 {
        discrepancy as f64 / primary as f64 * 100.0
    } else {
        0.0
    };
    CrossValidation {
        primary_count: primary,
        reference_count: reference,
        discrepancy,
        synthetic_detected: discrepancy > 0,
        synthetic_percentage,
    }
}

/// Reconciliation statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationStats {
    /// Current primary count.
    pub primary_count: u64,
    /// Current reference count (0 without a reference).
    pub reference_count: u64,
    /// Validated count.
    pub validated_count: u64,
    /// Cumulative synthetic events.
    pub total_synthetic_detected: u64,
    /// `primary - reference` right now.
    pub discrepancy: i64,
    /// Cumulative synthetic events as a percentage of primary.
    pub synthetic_percentage: f64,
    /// Whether a reference source is live.
    pub reference_available: bool,
    /// Whether only reference-confirmed events are credited.
    pub strict_mode: bool,
    /// Why the validator runs degraded, if it does.
    pub degraded_reason: Option<String>,
    /// Cumulative reference events beyond primary growth.
    pub reference_surplus_total: u64,
    /// Reconciliation ticks performed.
    pub ticks: u64,
}

struct ValidatorState {
    last_primary: u64,
    last_reference: u64,
    total_synthetic: u64,
    strict: bool,
    surplus_total: u64,
    ticks: u64,
}

/// Reconciles a primary and a reference counter into a validated count.
pub struct CrossSourceValidator {
    primary: Arc<EventCounter>,
    reference: Option<Arc<EventCounter>>,
    degraded_reason: Option<String>,
    validated: EventCounter,
    config: ValidatorConfig,
    state: Mutex<ValidatorState>,
    task: TaskSlot,
    stop_timeout: Duration,
}

impl CrossSourceValidator {
    /// Create a validator. An unavailable reference forces permissive mode.
    pub fn new(primary: Arc<EventCounter>, reference: ReferenceSource, config: ValidatorConfig) -> Self {
        let (reference, degraded_reason) = match reference {
            ReferenceSource::Available(counter) => (Some(counter), None),
            ReferenceSource::Unavailable { reason } => {
                warn!(
                    reason = %reason,
                    "Reference source unavailable, validator running in permissive mode"
                );
                (None, Some(reason))
            },
        };
        let strict = config.strict && reference.is_some();

        // Start from the counters' current values so pre-existing events are not credited.
        let last_primary = primary.count();
        let last_reference = reference.as_ref().map_or(0, |r| r.count());

        info!(
            strict,
            reference_available = reference.is_some(),
            tick_ms = config.tick_interval.as_millis() as u64,
            "CrossSourceValidator: created"
        );

        Self {
            primary,
            reference,
            degraded_reason,
            validated: EventCounter::new(),
            config,
            state: Mutex::new(ValidatorState {
                last_primary,
                last_reference,
                total_synthetic: 0,
                strict,
                surplus_total: 0,
                ticks: 0,
            }),
            task: TaskSlot::default(),
            stop_timeout: Duration::from_secs(1),
        }
    }

    /// Bound on waiting for the background task to exit.
    #[must_use]
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ValidatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration in use.
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Run one reconciliation step.
    pub fn reconcile(&self) -> TickOutcome {
        let primary_now = self.primary.count();
        let reference_now = self.reference.as_ref().map(|r| r.count());

        let mut state = self.lock();
        state.ticks += 1;

        let primary_delta = primary_now.saturating_sub(state.last_primary);
        state.last_primary = primary_now;

        let mut outcome = TickOutcome {
            primary_delta,
            ..TickOutcome::default()
        };

        match reference_now {
            Some(reference_now) => {
                let reference_delta = reference_now.saturating_sub(state.last_reference);
                state.last_reference = reference_now;
                outcome.reference_delta = reference_delta;

                // A surplus is reported but never offsets later primary growth.
                outcome.synthetic = primary_delta.saturating_sub(reference_delta);
                outcome.reference_surplus = reference_delta.saturating_sub(primary_delta);
                state.total_synthetic += outcome.synthetic;
                state.surplus_total += outcome.reference_surplus;

                outcome.credited = if state.strict {
                    reference_delta
                } else {
                    primary_delta
                };
            },
            None => {
                outcome.credited = primary_delta;
            },
        }

        if outcome.credited > 0 {
            self.validated.add(outcome.credited);
        }

        if outcome.synthetic > 0 {
            warn!(
                synthetic = outcome.synthetic,
                total_synthetic = state.total_synthetic,
                primary_delta,
                reference_delta = outcome.reference_delta,
                "Synthetic events detected"
            );
        }
        if outcome.reference_surplus > 0 {
            debug!(
                surplus = outcome.reference_surplus,
                surplus_total = state.surplus_total,
                "Reference source ahead of primary"
            );
        }

        outcome
    }

    /// Switch between strict and permissive crediting.
    pub fn set_strict(&self, strict: bool) -> Result<(), WitnessError> {
        if strict && self.reference.is_none() {
            return Err(WitnessError::ReferenceUnavailable {
                reason: self
                    .degraded_reason
                    .clone()
                    .unwrap_or_else(|| "no reference source".to_string()),
            });
        }
        let mut state = self.lock();
        if state.strict != strict {
            info!(strict, "Validator mode changed");
            state.strict = strict;
        }
        Ok(())
    }

    /// Whether strict crediting is active.
    pub fn is_strict(&self) -> bool {
        self.lock().strict
    }

    /// Whether a reference source is live.
    pub fn reference_available(&self) -> bool {
        self.reference.is_some()
    }

    /// Validated count.
    pub fn validated_count(&self) -> u64 {
        self.validated.count()
    }

    /// Subscribe to validated-count growth.
    pub fn subscribe(&self, threshold: u64) -> Result<mpsc::Receiver<CountEvent>, WitnessError> {
        self.validated.subscribe(threshold)
    }

    /// End every validated-count subscription.
    pub fn close_subscribers(&self) {
        self.validated.close_subscribers();
    }

    /// Whether any synthetic events have been detected.
    pub fn synthetic_detected(&self) -> bool {
        self.lock().total_synthetic > 0
    }

    /// Reconciliation statistics.
    pub fn validation_stats(&self) -> ValidationStats {
        let state = self.lock();
        let primary_count = self.primary.count();
        let reference_count = self.reference.as_ref().map_or(0, |r| r.count());
        let synthetic_percentage = if primary_count > 0 {
            state.total_synthetic as f64 / primary_count as f64 * 100.0
        } else {
            0.0
        };

        ValidationStats {
            primary_count,
            reference_count,
            validated_count: self.validated.count(),
            total_synthetic_detected: state.total_synthetic,
            discrepancy: cross_validate(to_i64(primary_count), to_i64(reference_count)).discrepancy,
            synthetic_percentage,
            reference_available: self.reference.is_some(),
            strict_mode: state.strict,
            degraded_reason: self.degraded_reason.clone(),
            reference_surplus_total: state.surplus_total,
            ticks: state.ticks,
        }
    }
}

#[async_trait]
impl WitnessCounter for CrossSourceValidator {
    fn count(&self) -> CountReading {
        CountReading::Trusted {
            count: self.validated_count(),
        }
    }

    fn subscribe(&self, threshold: u64) -> Result<mpsc::Receiver<CountEvent>, WitnessError> {
        CrossSourceValidator::subscribe(self, threshold)
    }

    fn is_compromised(&self) -> CompromiseStatus {
        CompromiseStatus::intact()
    }

    fn validation_stats(&self) -> ValidationStats {
        CrossSourceValidator::validation_stats(self)
    }

    async fn tick(&self) {
        self.reconcile();
    }

    fn start(self: Arc<Self>) -> Result<(), WitnessError> {
        let weak = Arc::downgrade(&self);
        self.task.start("cross-source-validator", self.config.tick_interval, move || {
            let validator = weak.upgrade();
            async move {
                if let Some(validator) = validator {
                    validator.reconcile();
                }
            }
        })
    }

    async fn stop(&self) {
        self.task.stop(self.stop_timeout).await;
        self.close_subscribers();
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
