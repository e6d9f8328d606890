//! Hardware trust binding.
//!
//! Binds an [`IntegrityChain`] to a [`TrustAnchor`]:
//!
//! - the anchor's monotonic counter advances on every recorded event, and a
//!   value that fails to increase latches the chain as compromised;
//! - a binding hash folds the hardware counter and validated count together;
//! - periodic quotes sign the chain state;
//! - the integrity key is sealed to the anchor's platform state.
//!
//! Without an anchor, or when it fails to open, the binding runs in
//! software-only mode and reports `hardware_available = false` everywhere.
//! Transient anchor errors after startup are counted and logged but never
//! change the trust state.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keywitness_anchor::{serde_hex, Attestation, HardwareType, TrustAnchor};
use keywitness_crypto::{constant_time_eq, Sha256Transcript, Transcript};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{BindingConfig, WitnessConfig};
use crate::counter::CountEvent;
use crate::error::WitnessError;
use crate::handle::WitnessCounter;
use crate::integrity::{IntegrityChain, RecordedEvent, SealedSnapshot};
use crate::source::SourceSelection;
use crate::task::TaskSlot;
use crate::timing::AnomalyReport;
use crate::types::{unix_nanos, CompromiseStatus, CountReading};
use crate::validator::{CrossSourceValidator, ValidationStats};

/// Binding nonce length.
const NONCE_LEN: usize = 16;

/// A sealed snapshot bound to hardware state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    /// The chain snapshot.
    pub base: SealedSnapshot,
    /// Anchor monotonic counter when sealed.
    pub hw_counter: u64,
    /// Anchor device identity (empty in software-only mode).
    #[serde(with = "serde_hex")]
    pub device_id: Vec<u8>,
    /// Binding chain head.
    #[serde(with = "serde_hex")]
    pub binding_hash: [u8; 32],
    /// Whether an anchor was bound.
    pub hardware_available: bool,
    /// Whether that anchor is real hardware. False for the software anchor,
    /// whose quotes and counter carry no hardware guarantee.
    pub hardware_backed: bool,
    /// Quote over the snapshot state, when attestation is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Attestation>,
    /// Integrity-key MAC over the base MAC and the hardware fields.
    #[serde(with = "serde_hex")]
    pub binding_mac: [u8; 32],
}

/// Hardware binding status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustStatus {
    /// Whether an anchor is bound.
    pub available: bool,
    /// Anchor type, if bound.
    pub hardware_type: Option<HardwareType>,
    /// Whether the anchor is real hardware.
    pub hardware_backed: bool,
    /// Anchor manufacturer.
    pub manufacturer: Option<String>,
    /// Anchor firmware version.
    pub firmware_version: Option<String>,
    /// Last observed hardware counter.
    pub hw_counter: u64,
    /// Hex device identity.
    pub device_id: String,
    /// Time of the last periodic quote.
    pub last_quote_at: Option<DateTime<Utc>>,
    /// Whether the integrity key is sealed to the anchor.
    pub sealed_key: bool,
    /// Hex binding chain head.
    pub binding_chain: String,
    /// Transient anchor failures since startup.
    pub anchor_faults: u64,
    /// Integrity chain state.
    pub compromise: CompromiseStatus,
}

pub(crate) struct BindingState {
    pub(crate) anchor: Option<Arc<dyn TrustAnchor>>,
    pub(crate) device_id: Vec<u8>,
    pub(crate) hw_counter: u64,
    pub(crate) binding_chain: [u8; 32],
    sealed_key: Option<Vec<u8>>,
    last_quote: Option<Attestation>,
    last_quote_at: Option<Instant>,
    pub(crate) anchor_faults: u64,
    pub(crate) checkpoints: Vec<HardwareSnapshot>,
}

/// Layer 3: an integrity chain bound to a trust anchor.
pub struct HardwareTrustBinding {
    chain: IntegrityChain,
    config: BindingConfig,
    state: Mutex<BindingState>,
    task: TaskSlot,
}

/// `SHA-256("attestation-v1" || count || hw_counter || binding || ts_ns)`.
#[must_use]
pub fn attestation_digest(count: u64, hw_counter: u64, binding_hash: &[u8; 32], ts_nanos: i64) -> [u8; 32] {
    Sha256Transcript::with_domain(b"attestation-v1")
        .put_u64(count)
        .put_u64(hw_counter)
        .put_bytes(binding_hash)
        .put_i64(ts_nanos)
        .finish()
}

fn initial_binding(device_id: &[u8], hw_counter: u64) -> Result<[u8; 32], WitnessError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| WitnessError::Entropy {
            reason: e.to_string(),
        })?;
    Ok(Sha256Transcript::with_domain(b"binding-v1")
        .put_prefixed(device_id)
        .put_u64(hw_counter)
        .put_bytes(&nonce)
        .finish())
}

impl HardwareTrustBinding {
    /// Bind `chain` to `anchor`, falling back to software-only mode.
    pub async fn new(
        chain: IntegrityChain,
        anchor: Option<Arc<dyn TrustAnchor>>,
        config: BindingConfig,
    ) -> Result<Self, WitnessError> {
        let mut state = BindingState {
            anchor: None,
            device_id: Vec::new(),
            hw_counter: 0,
            binding_chain: [0u8; 32],
            sealed_key: None,
            last_quote: None,
            last_quote_at: None,
            anchor_faults: 0,
            checkpoints: Vec::new(),
        };

        match anchor {
            Some(anchor) => match Self::bind_anchor(&chain, &anchor, &config).await {
                Ok((device_id, hw_counter, sealed_key)) => {
                    info!(
                        hardware_type = ?anchor.hardware_type(),
                        manufacturer = %anchor.manufacturer(),
                        device_id = %hex::encode(&device_id),
                        hw_counter,
                        sealed_key = sealed_key.is_some(),
                        "HardwareTrustBinding: anchor bound"
                    );
                    if !anchor.hardware_type().is_hardware_backed() {
                        warn!("Trust anchor is software-only; evidence carries no hardware guarantee");
                    }
                    state.anchor = Some(anchor);
                    state.device_id = device_id;
                    state.hw_counter = hw_counter;
                    state.sealed_key = sealed_key;
                },
                Err(e) => {
                    warn!(error = %e, "Trust anchor unavailable, running in software-only mode");
                },
            },
            None => warn!("No trust anchor, running in software-only mode"),
        }

        state.binding_chain = initial_binding(&state.device_id, state.hw_counter)?;

        Ok(Self {
            chain,
            config,
            state: Mutex::new(state),
            task: TaskSlot::default(),
        })
    }

    /// Assemble the full pipeline over `sources` from `config`.
    pub async fn from_config(
        config: &WitnessConfig,
        sources: SourceSelection,
        anchor: Option<Arc<dyn TrustAnchor>>,
    ) -> Result<Self, WitnessError> {
        config.validate()?;
        let validator = CrossSourceValidator::new(sources.primary, sources.reference, config.validator.clone())
            .with_stop_timeout(config.stop_timeout);
        let chain = IntegrityChain::new(validator, config.timing.clone())?.with_stop_timeout(config.stop_timeout);
        Self::new(chain, anchor, config.binding.clone()).await
    }

    async fn bind_anchor(
        chain: &IntegrityChain,
        anchor: &Arc<dyn TrustAnchor>,
        config: &BindingConfig,
    ) -> Result<(Vec<u8>, u64, Option<Vec<u8>>), WitnessError> {
        anchor.open().await?;

        let identity = async {
            let device_id = anchor.device_id().await?;
            let hw_counter = if config.use_hw_counter {
                anchor.get_counter().await?
            } else {
                0
            };
            Ok::<_, WitnessError>((device_id, hw_counter))
        }
        .await;

        let (device_id, hw_counter) = match identity {
            Ok(v) => v,
            Err(e) => {
                if let Err(close_err) = anchor.close().await {
                    debug!(error = %close_err, "Anchor close after failed bind");
                }
                return Err(e);
            },
        };

        let sealed_key = if config.seal_integrity_key {
            let material = chain.sealing_material();
            match anchor.seal(&material, &config.seal_policy).await {
                Ok(blob) => Some(blob),
                Err(e) => {
                    warn!(error = %e, "Failed to seal integrity key to trust anchor");
                    None
                },
            }
        } else {
            None
        };

        Ok((device_id, hw_counter, sealed_key))
    }

    /// The bound integrity chain.
    pub fn chain(&self) -> &IntegrityChain {
        &self.chain
    }

    /// Binding configuration.
    pub fn config(&self) -> &BindingConfig {
        &self.config
    }

    pub(crate) async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, BindingState> {
        self.state.lock().await
    }

    fn fold(state: &mut BindingState, count: u64) {
        state.binding_chain = Sha256Transcript::new()
            .put_bytes(&state.binding_chain)
            .put_u64(state.hw_counter)
            .put_u64(count)
            .put_i64(unix_nanos(&Utc::now()))
            .finish();
    }

    async fn quote_if_due(&self, state: &mut BindingState) {
        if !self.config.use_attestation {
            return;
        }
        let Some(anchor) = state.anchor.clone() else {
            return;
        };
        let due = state
            .last_quote_at
            .map_or(true, |at| at.elapsed() >= self.config.quote_interval);
        if !due {
            return;
        }

        let count = self.chain.view().count;
        let digest = attestation_digest(count, state.hw_counter, &state.binding_chain, unix_nanos(&Utc::now()));
        match anchor.quote(&digest, &self.config.seal_policy).await {
            Ok(quote) => {
                debug!(count, hw_counter = state.hw_counter, "Periodic quote taken");
                state.last_quote = Some(quote);
                state.last_quote_at = Some(Instant::now());
            },
            Err(e) => {
                state.anchor_faults += 1;
                warn!(error = %e, faults = state.anchor_faults, "Periodic quote failed");
            },
        }
    }

    /// Record one key event through the chain and advance the hardware counter.
    pub async fn record_event(&self, at: Instant) -> RecordedEvent {
        let mut state = self.state.lock().await;
        let recorded = self.chain.record_event(at);
        if recorded.reading.is_tainted() {
            return recorded;
        }
        let Some(anchor) = state.anchor.clone() else {
            return recorded;
        };

        if self.config.use_hw_counter {
            match anchor.increment_counter().await {
                Ok(value) if value <= state.hw_counter => {
                    error!(
                        previous = state.hw_counter,
                        observed = value,
                        "Hardware counter rollback detected"
                    );
                    self.chain.mark_compromised(&format!(
                        "hardware counter rollback: {} -> {}",
                        state.hw_counter, value
                    ));
                    return RecordedEvent {
                        reading: self.chain.count(),
                        verdict: recorded.verdict,
                    };
                },
                Ok(value) => state.hw_counter = value,
                Err(e) => {
                    state.anchor_faults += 1;
                    warn!(error = %e, faults = state.anchor_faults, "Hardware counter increment failed");
                },
            }
        }

        let count = recorded.reading.trusted().unwrap_or_default();
        Self::fold(&mut state, count);
        self.quote_if_due(&mut state).await;
        recorded
    }

    /// Reconcile the chain, then take a quote if one is due.
    pub async fn tick(&self) {
        let mut state = self.state.lock().await;
        if let Err(e) = self.chain.reconcile() {
            debug!(error = %e, "Binding tick skipped");
            return;
        }
        self.quote_if_due(&mut state).await;
    }

    fn binding_mac(&self, snapshot: &HardwareSnapshot) -> Result<[u8; 32], WitnessError> {
        self.chain.keyed_mac(|t| {
            t.put_bytes(b"hw-snapshot-v1")
                .put_bytes(&snapshot.base.mac)
                .put_u64(snapshot.hw_counter)
                .put_prefixed(&snapshot.device_id)
                .put_bytes(&snapshot.binding_hash)
                .put_bool(snapshot.hardware_available)
                .put_bool(snapshot.hardware_backed)
        })
    }

    /// Seal the chain and bind the snapshot to the current hardware state.
    #[instrument(skip(self))]
    pub async fn seal_with_hardware(&self) -> Result<HardwareSnapshot, WitnessError> {
        let mut state = self.state.lock().await;
        let base = self.chain.seal()?;
        let hardware_available = state.anchor.is_some();
        let hardware_backed = state
            .anchor
            .as_ref()
            .is_some_and(|a| a.hardware_type().is_hardware_backed());

        let attestation = match state.anchor.clone() {
            Some(anchor) if self.config.use_attestation => {
                let digest = attestation_digest(
                    base.count,
                    state.hw_counter,
                    &state.binding_chain,
                    unix_nanos(&base.timestamp),
                );
                match anchor.quote(&digest, &self.config.seal_policy).await {
                    Ok(quote) => Some(quote),
                    Err(e) => {
                        state.anchor_faults += 1;
                        warn!(error = %e, "Snapshot quote failed, sealing without attestation");
                        None
                    },
                }
            },
            _ => None,
        };

        let mut snapshot = HardwareSnapshot {
            base,
            hw_counter: state.hw_counter,
            device_id: state.device_id.clone(),
            binding_hash: state.binding_chain,
            hardware_available,
            hardware_backed,
            attestation,
            binding_mac: [0u8; 32],
        };
        snapshot.binding_mac = self.binding_mac(&snapshot)?;
        state.checkpoints.push(snapshot.clone());

        debug!(
            count = snapshot.base.count,
            hw_counter = snapshot.hw_counter,
            attested = snapshot.attestation.is_some(),
            "Hardware snapshot sealed"
        );
        Ok(snapshot)
    }

    /// Verify a hardware snapshot: MACs, device, counter, quote.
    pub async fn verify_hardware_snapshot(&self, snapshot: &HardwareSnapshot) -> Result<(), WitnessError> {
        let state = self.state.lock().await;
        self.verify_snapshot_locked(&state, snapshot)
    }

    pub(crate) fn verify_snapshot_locked(
        &self,
        state: &BindingState,
        snapshot: &HardwareSnapshot,
    ) -> Result<(), WitnessError> {
        if !self.chain.verify_snapshot(&snapshot.base) {
            return Err(WitnessError::integrity("snapshot MAC mismatch"));
        }
        if !constant_time_eq(&self.binding_mac(snapshot)?, &snapshot.binding_mac) {
            return Err(WitnessError::integrity("binding MAC mismatch"));
        }
        if snapshot.hardware_available
            && state.anchor.is_some()
            && !constant_time_eq(&snapshot.device_id, &state.device_id)
        {
            return Err(WitnessError::DeviceMismatch);
        }

        if let Some(attestation) = &snapshot.attestation {
            if attestation.monotonic_counter < snapshot.hw_counter {
                return Err(WitnessError::CounterRollback {
                    expected: snapshot.hw_counter,
                    observed: attestation.monotonic_counter,
                });
            }
            let expected = attestation_digest(
                snapshot.base.count,
                snapshot.hw_counter,
                &snapshot.binding_hash,
                unix_nanos(&snapshot.base.timestamp),
            );
            if !constant_time_eq(&attestation.data, &expected) {
                return Err(WitnessError::AttestationMismatch {
                    reason: "quote does not cover snapshot state".into(),
                });
            }
            if !constant_time_eq(&attestation.device_id, &snapshot.device_id) {
                return Err(WitnessError::DeviceMismatch);
            }
            if !attestation.verify_signature()? {
                return Err(WitnessError::SignatureInvalid {
                    reason: "snapshot quote signature".into(),
                });
            }
        }
        Ok(())
    }

    /// Record one event for each key press in a batch, stopping at compromise.
    pub async fn record_events(&self, times: &[Instant]) -> Vec<RecordedEvent> {
        let mut out = Vec::with_capacity(times.len());
        for at in times {
            let recorded = self.record_event(*at).await;
            let tainted = recorded.reading.is_tainted();
            out.push(recorded);
            if tainted {
                break;
            }
        }
        out
    }

    /// Binding and anchor status.
    pub async fn trust_status(&self) -> TrustStatus {
        let state = self.state.lock().await;
        let anchor = state.anchor.as_ref();
        TrustStatus {
            available: anchor.is_some(),
            hardware_type: anchor.map(|a| a.hardware_type()),
            hardware_backed: anchor.is_some_and(|a| a.hardware_type().is_hardware_backed()),
            manufacturer: anchor.map(|a| a.manufacturer()),
            firmware_version: anchor.map(|a| a.firmware_version()),
            hw_counter: state.hw_counter,
            device_id: hex::encode(&state.device_id),
            last_quote_at: state.last_quote.as_ref().map(|q| q.created_at),
            sealed_key: state.sealed_key.is_some(),
            binding_chain: hex::encode(state.binding_chain),
            anchor_faults: state.anchor_faults,
            compromise: self.chain.is_compromised(),
        }
    }

    /// Most recent periodic quote.
    pub async fn last_quote(&self) -> Option<Attestation> {
        self.state.lock().await.last_quote.clone()
    }

    /// Unseal the stored key blob and compare it with the live integrity key.
    ///
    /// Returns `Ok(false)` when nothing is sealed.
    pub async fn verify_sealed_key(&self) -> Result<bool, WitnessError> {
        let state = self.state.lock().await;
        let (Some(anchor), Some(blob)) = (state.anchor.as_ref(), state.sealed_key.as_ref()) else {
            return Ok(false);
        };
        let unsealed = zeroize::Zeroizing::new(anchor.unseal(blob).await?);
        Ok(constant_time_eq(&unsealed, &self.chain.sealing_material()))
    }

    /// Stop ticking and close the anchor.
    pub async fn close(&self) {
        self.task.stop(self.chain.stop_timeout()).await;
        self.chain.close_subscribers();
        let state = self.state.lock().await;
        if let Some(anchor) = &state.anchor {
            if let Err(e) = anchor.close().await {
                warn!(error = %e, "Failed to close trust anchor");
            }
        }
        info!(hw_counter = state.hw_counter, "HardwareTrustBinding: closed");
    }

    /// Timing analysis summary.
    pub fn anomaly_report(&self) -> AnomalyReport {
        self.chain.anomaly_report()
    }
}

#[async_trait]
impl WitnessCounter for HardwareTrustBinding {
    fn count(&self) -> CountReading {
        self.chain.count()
    }

    fn subscribe(&self, threshold: u64) -> Result<mpsc::Receiver<CountEvent>, WitnessError> {
        self.chain.subscribe(threshold)
    }

    fn is_compromised(&self) -> CompromiseStatus {
        self.chain.is_compromised()
    }

    fn validation_stats(&self) -> ValidationStats {
        self.chain.validation_stats()
    }

    async fn tick(&self) {
        HardwareTrustBinding::tick(self).await;
    }

    fn start(self: Arc<Self>) -> Result<(), WitnessError> {
        let weak = Arc::downgrade(&self);
        self.task.start("hardware-binding", self.chain.tick_interval(), move || {
            let binding = weak.upgrade();
            async move {
                if let Some(binding) = binding {
                    HardwareTrustBinding::tick(&binding).await;
                }
            }
        })
    }

    async fn stop(&self) {
        self.task.stop(self.chain.stop_timeout()).await;
        self.chain.close_subscribers();
    }
}

impl std::fmt::Debug for HardwareTrustBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareTrustBinding")
            .field("config", &self.config)
            .field("running", &self.task.is_running())
            .finish_non_exhaustive()
    }
}
