//! Tamper-evident integrity chain over the validated count.
//!
//! Every validated increment advances a SHA-256 hash chain and re-MACs the
//! state under a per-session random key:
//!
//! ```text
//! chain_hash' = SHA-256(chain_hash || update_counter || now_ns || validated_count)
//! update_counter' = update_counter + 1
//! mac' = HMAC(key, validated_count || update_counter' || chain_hash')
//! ```
//!
//! The MAC is verified before every state-changing operation. A mismatch
//! moves the chain to the terminal compromised state; from then on counts
//! read as tainted and sealing is refused.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keywitness_anchor::serde_hex;
use keywitness_crypto::{constant_time_eq, MacTranscript, Sha256Transcript, Transcript};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};
use zeroize::Zeroizing;

use crate::config::TimingConfig;
use crate::counter::CountEvent;
use crate::error::WitnessError;
use crate::handle::WitnessCounter;
use crate::task::TaskSlot;
use crate::timing::{AnomalyReason, AnomalyReport, TimingAnalyzer, TimingVerdict};
use crate::types::{unix_nanos, CompromiseStatus, CountReading};
use crate::validator::{CrossSourceValidator, TickOutcome, ValidationStats};

/// A MACed point-in-time capture of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Validated count.
    pub count: u64,
    /// Chain updates so far.
    pub update_counter: u64,
    /// Chain head.
    #[serde(with = "serde_hex")]
    pub chain_hash: [u8; 32],
    /// `HMAC(key, ts_ns || count || update_counter || chain_hash)`.
    #[serde(with = "serde_hex")]
    pub mac: [u8; 32],
}

/// Result of recording one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Count after recording.
    pub reading: CountReading,
    /// Timing analysis, absent when the chain is compromised.
    pub verdict: Option<TimingVerdict>,
}

impl RecordedEvent {
    pub(crate) fn tainted(reason: impl Into<String>) -> Self {
        Self {
            reading: CountReading::Tainted {
                reason: reason.into(),
            },
            verdict: None,
        }
    }

    /// Intact chain and clean timing.
    pub fn is_legitimate(&self) -> bool {
        !self.reading.is_tainted() && self.verdict.as_ref().is_some_and(TimingVerdict::is_clean)
    }

    /// Primary timing anomaly, if any.
    pub fn anomaly(&self) -> Option<AnomalyReason> {
        self.verdict.as_ref().and_then(|v| v.primary)
    }
}

/// Public view of the chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainView {
    /// Validated count.
    pub count: u64,
    /// Chain updates so far.
    pub update_counter: u64,
    /// Chain head.
    pub chain_hash: [u8; 32],
}

#[derive(Debug, Clone)]
enum ChainStatus {
    Active,
    Compromised { reason: String, at: DateTime<Utc> },
}

struct ChainState {
    key: Zeroizing<[u8; 32]>,
    chain_hash: [u8; 32],
    update_counter: u64,
    mac: [u8; 32],
    status: ChainStatus,
    timing: TimingAnalyzer,
    snapshots: Vec<SealedSnapshot>,
}

/// Hash chain plus MAC over a validator's count, with timing analysis.
pub struct IntegrityChain {
    validator: CrossSourceValidator,
    state: Mutex<ChainState>,
    task: TaskSlot,
    stop_timeout: Duration,
}

fn random_32() -> Result<[u8; 32], WitnessError> {
    let mut out = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut out)
        .map_err(|e| WitnessError::Entropy {
            reason: e.to_string(),
        })?;
    Ok(out)
}

fn state_mac(key: &[u8], count: u64, update_counter: u64, chain_hash: &[u8; 32]) -> Result<[u8; 32], WitnessError> {
    Ok(MacTranscript::new(key)?
        .put_u64(count)
        .put_u64(update_counter)
        .put_bytes(chain_hash)
        .finish())
}

fn snapshot_mac(key: &[u8], ts_ns: i64, count: u64, update_counter: u64, chain_hash: &[u8; 32]) -> Result<[u8; 32], WitnessError> {
    Ok(MacTranscript::new(key)?
        .put_i64(ts_ns)
        .put_u64(count)
        .put_u64(update_counter)
        .put_bytes(chain_hash)
        .finish())
}

impl IntegrityChain {
    /// Create a chain over `validator` with a fresh random key and head.
    pub fn new(validator: CrossSourceValidator, timing: TimingConfig) -> Result<Self, WitnessError> {
        let key = Zeroizing::new(random_32()?);
        let chain_hash = random_32()?;
        let mac = state_mac(key.as_ref(), validator.validated_count(), 0, &chain_hash)?;

        info!(
            strict = validator.is_strict(),
            reference_available = validator.reference_available(),
            "IntegrityChain: initialized"
        );

        Ok(Self {
            validator,
            state: Mutex::new(ChainState {
                key,
                chain_hash,
                update_counter: 0,
                mac,
                status: ChainStatus::Active,
                timing: TimingAnalyzer::new(timing),
                snapshots: Vec::new(),
            }),
            task: TaskSlot::default(),
            stop_timeout: Duration::from_secs(1),
        })
    }

    /// Bound on waiting for the background task to exit.
    #[must_use]
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn compromise(state: &mut ChainState, reason: &str) {
        if let ChainStatus::Active = state.status {
            error!(
                reason = %reason,
                update_counter = state.update_counter,
                "Integrity chain COMPROMISED"
            );
            state.status = ChainStatus::Compromised {
                reason: reason.to_string(),
                at: Utc::now(),
            };
        }
    }

    fn verify_locked(&self, state: &mut ChainState, context: &str) -> bool {
        if let ChainStatus::Compromised { .. } = state.status {
            return false;
        }
        let count = self.validator.validated_count();
        let intact = match state_mac(state.key.as_ref(), count, state.update_counter, &state.chain_hash) {
            Ok(expected) => constant_time_eq(&expected, &state.mac),
            Err(_) => false,
        };
        if !intact {
            Self::compromise(state, &format!("MAC verification failed during {context}"));
        }
        intact
    }

    fn advance_locked(&self, state: &mut ChainState) {
        let count = self.validator.validated_count();
        state.chain_hash = Sha256Transcript::new()
            .put_bytes(&state.chain_hash)
            .put_u64(state.update_counter)
            .put_i64(unix_nanos(&Utc::now()))
            .put_u64(count)
            .finish();
        state.update_counter += 1;
        match state_mac(state.key.as_ref(), count, state.update_counter, &state.chain_hash) {
            Ok(mac) => state.mac = mac,
            Err(e) => Self::compromise(state, &format!("MAC computation failed: {e}")),
        }
    }

    fn compromised_reason(state: &ChainState) -> Option<String> {
        match &state.status {
            ChainStatus::Active => None,
            ChainStatus::Compromised { reason, .. } => Some(reason.clone()),
        }
    }

    /// Verify the current MAC. A mismatch latches the compromised state.
    pub fn verify(&self) -> bool {
        let mut state = self.lock();
        self.verify_locked(&mut state, "verify")
    }

    /// Reconcile the validator and advance the chain if anything was credited.
    pub fn reconcile(&self) -> Result<TickOutcome, WitnessError> {
        let mut state = self.lock();
        if !self.verify_locked(&mut state, "reconcile") {
            return Err(WitnessError::Compromised {
                reason: Self::compromised_reason(&state).unwrap_or_default(),
            });
        }
        let outcome = self.validator.reconcile();
        if outcome.credited > 0 {
            self.advance_locked(&mut state);
        }
        Ok(outcome)
    }

    /// Record one key event: verify, analyse timing, advance the chain.
    pub fn record_event(&self, at: Instant) -> RecordedEvent {
        let mut state = self.lock();
        if !self.verify_locked(&mut state, "recording") {
            return RecordedEvent::tainted(Self::compromised_reason(&state).unwrap_or_default());
        }

        let verdict = state.timing.on_event_detailed(at);
        if let Some(reason) = verdict.primary {
            debug!(reason = %reason, interval_ms = ?verdict.interval.map(|d| d.as_millis()), "Timing anomaly");
        }
        self.advance_locked(&mut state);

        RecordedEvent {
            reading: CountReading::Trusted {
                count: self.validator.validated_count(),
            },
            verdict: Some(verdict),
        }
    }

    /// Validated count, or the compromise reason.
    pub fn count(&self) -> CountReading {
        let mut state = self.lock();
        if self.verify_locked(&mut state, "read") {
            CountReading::Trusted {
                count: self.validator.validated_count(),
            }
        } else {
            CountReading::Tainted {
                reason: Self::compromised_reason(&state).unwrap_or_default(),
            }
        }
    }

    /// Capture a MACed snapshot and append it to the snapshot log.
    #[instrument(skip(self))]
    pub fn seal(&self) -> Result<SealedSnapshot, WitnessError> {
        let mut state = self.lock();
        if !self.verify_locked(&mut state, "seal") {
            return Err(WitnessError::Compromised {
                reason: Self::compromised_reason(&state).unwrap_or_default(),
            });
        }

        let timestamp = Utc::now();
        let count = self.validator.validated_count();
        let mac = snapshot_mac(
            state.key.as_ref(),
            unix_nanos(&timestamp),
            count,
            state.update_counter,
            &state.chain_hash,
        )?;
        let snapshot = SealedSnapshot {
            timestamp,
            count,
            update_counter: state.update_counter,
            chain_hash: state.chain_hash,
            mac,
        };
        state.snapshots.push(snapshot.clone());

        debug!(count, update_counter = snapshot.update_counter, "Sealed snapshot");
        Ok(snapshot)
    }

    /// Check a snapshot's own MAC. Does not affect the compromise state.
    pub fn verify_snapshot(&self, snapshot: &SealedSnapshot) -> bool {
        let state = self.lock();
        match snapshot_mac(
            state.key.as_ref(),
            unix_nanos(&snapshot.timestamp),
            snapshot.count,
            snapshot.update_counter,
            &snapshot.chain_hash,
        ) {
            Ok(expected) => constant_time_eq(&expected, &snapshot.mac),
            Err(_) => false,
        }
    }

    /// Compromise flag and reason.
    pub fn is_compromised(&self) -> CompromiseStatus {
        match &self.lock().status {
            ChainStatus::Active => CompromiseStatus::intact(),
            ChainStatus::Compromised { reason, .. } => CompromiseStatus {
                compromised: true,
                reason: reason.clone(),
            },
        }
    }

    /// When the chain was compromised.
    pub fn compromised_at(&self) -> Option<DateTime<Utc>> {
        match &self.lock().status {
            ChainStatus::Active => None,
            ChainStatus::Compromised { at, .. } => Some(*at),
        }
    }

    /// All snapshots sealed so far, oldest first.
    pub fn snapshots(&self) -> Vec<SealedSnapshot> {
        self.lock().snapshots.clone()
    }

    /// Chain head.
    pub fn view(&self) -> ChainView {
        let state = self.lock();
        ChainView {
            count: self.validator.validated_count(),
            update_counter: state.update_counter,
            chain_hash: state.chain_hash,
        }
    }

    /// Chain updates so far.
    pub fn update_counter(&self) -> u64 {
        self.lock().update_counter
    }

    /// Timing analysis summary.
    pub fn anomaly_report(&self) -> AnomalyReport {
        self.lock().timing.report()
    }

    /// Reconciliation statistics of the underlying validator.
    pub fn validation_stats(&self) -> ValidationStats {
        self.validator.validation_stats()
    }

    /// Subscribe to validated-count growth.
    pub fn subscribe(&self, threshold: u64) -> Result<mpsc::Receiver<CountEvent>, WitnessError> {
        self.validator.subscribe(threshold)
    }

    /// Switch validator crediting mode.
    pub fn set_strict(&self, strict: bool) -> Result<(), WitnessError> {
        self.validator.set_strict(strict)
    }

    /// Whether the validator has a live reference source.
    pub fn reference_available(&self) -> bool {
        self.validator.reference_available()
    }

    /// Latch the compromised state from an outer layer.
    pub(crate) fn mark_compromised(&self, reason: &str) {
        Self::compromise(&mut self.lock(), reason);
    }

    /// MAC arbitrary fields under the integrity key.
    pub(crate) fn keyed_mac(
        &self,
        fields: impl FnOnce(MacTranscript) -> MacTranscript,
    ) -> Result<[u8; 32], WitnessError> {
        let state = self.lock();
        Ok(fields(MacTranscript::new(state.key.as_ref())?).finish())
    }

    /// Copy of the integrity key for sealing to a trust anchor.
    pub(crate) fn sealing_material(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.lock().key.to_vec())
    }

    pub(crate) fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub(crate) fn tick_interval(&self) -> Duration {
        self.validator.config().tick_interval
    }

    pub(crate) fn close_subscribers(&self) {
        self.validator.close_subscribers();
    }
}

#[async_trait]
impl WitnessCounter for IntegrityChain {
    fn count(&self) -> CountReading {
        IntegrityChain::count(self)
    }

    fn subscribe(&self, threshold: u64) -> Result<mpsc::Receiver<CountEvent>, WitnessError> {
        IntegrityChain::subscribe(self, threshold)
    }

    fn is_compromised(&self) -> CompromiseStatus {
        IntegrityChain::is_compromised(self)
    }

    fn validation_stats(&self) -> ValidationStats {
        IntegrityChain::validation_stats(self)
    }

    async fn tick(&self) {
        if let Err(e) = self.reconcile() {
            debug!(error = %e, "Integrity chain tick skipped");
        }
    }

    fn start(self: Arc<Self>) -> Result<(), WitnessError> {
        let weak = Arc::downgrade(&self);
        self.task.start("integrity-chain", self.tick_interval(), move || {
            let chain = weak.upgrade();
            async move {
                if let Some(chain) = chain {
                    chain.tick().await;
                }
            }
        })
    }

    async fn stop(&self) {
        self.task.stop(self.stop_timeout).await;
        self.close_subscribers();
    }
}
