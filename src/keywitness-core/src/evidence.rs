//! Signed session evidence.
//!
//! An [`EvidenceRecord`] summarises one session: final count, chain head,
//! hardware binding, every hardware checkpoint, validation and timing
//! statistics. The record is signed with the session's integrity key; when
//! an anchor is bound it is also quoted over `SHA-256(signature)`, so anyone
//! holding the anchor public key can check where it came from.

use chrono::{DateTime, Utc};
use keywitness_anchor::{serde_hex, Attestation};
use keywitness_crypto::{constant_time_eq, sha256, MacTranscript, Transcript};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::binding::{HardwareSnapshot, HardwareTrustBinding};
use crate::error::WitnessError;
use crate::timing::AnomalyReport;
use crate::types::unix_nanos;
use crate::validator::ValidationStats;

/// Evidence format version.
pub const EVIDENCE_VERSION: u32 = 1;

/// Session identity and bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Caller-chosen session id.
    pub session_id: String,
    /// Session start.
    pub started_at: DateTime<Utc>,
    /// Session end; defaults to export time.
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionInfo {
    /// A session starting now.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Exported session evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Format version.
    pub version: u32,
    /// Session id.
    pub session_id: String,
    /// Session start.
    pub started_at: DateTime<Utc>,
    /// Session end.
    pub ended_at: DateTime<Utc>,
    /// Validated count, absent when the chain is compromised.
    pub final_count: Option<u64>,
    /// Whether the chain was compromised.
    pub compromised: bool,
    /// Why, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compromise_reason: Option<String>,
    /// Whether an anchor was bound.
    pub hardware_available: bool,
    /// Whether the anchor is real hardware.
    pub hardware_backed: bool,
    /// Validator crediting mode at export.
    pub strict_mode: bool,
    /// Whether the reference source was live.
    pub reference_available: bool,
    /// Anchor device identity.
    #[serde(with = "serde_hex")]
    pub device_id: Vec<u8>,
    /// Anchor counter at export.
    pub hw_counter: u64,
    /// Integrity chain head.
    #[serde(with = "serde_hex")]
    pub final_chain_hash: [u8; 32],
    /// Binding chain head.
    #[serde(with = "serde_hex")]
    pub binding_hash: [u8; 32],
    /// Integrity chain updates.
    pub update_counter: u64,
    /// Hardware snapshots, oldest first.
    pub checkpoints: Vec<HardwareSnapshot>,
    /// Reconciliation statistics.
    pub validation_stats: ValidationStats,
    /// Timing analysis summary.
    pub anomaly_report: AnomalyReport,
    /// Anchor quote over `SHA-256(signature)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_attestation: Option<Attestation>,
    /// Integrity-key MAC over the record.
    #[serde(with = "serde_hex")]
    pub signature: [u8; 32],
}

impl EvidenceRecord {
    /// Feed the signed fields into `t`.
    fn signed_fields(&self, t: MacTranscript) -> MacTranscript {
        let stats = &self.validation_stats;
        let timing = &self.anomaly_report;
        let mut t = t
            .put_bytes(b"evidence-v1")
            .put_prefixed(self.session_id.as_bytes())
            .put_i64(unix_nanos(&self.started_at))
            .put_i64(unix_nanos(&self.ended_at))
            .put_bool(self.final_count.is_some())
            .put_u64(self.final_count.unwrap_or(0))
            .put_bool(self.compromised)
            .put_bool(self.hardware_available)
            .put_bool(self.hardware_backed)
            .put_bool(self.strict_mode)
            .put_bool(self.reference_available)
            .put_u64(self.hw_counter)
            .put_prefixed(&self.device_id)
            .put_bytes(&self.final_chain_hash)
            .put_bytes(&self.binding_hash)
            .put_u64(self.update_counter)
            .put_u64(self.checkpoints.len() as u64);
        for cp in &self.checkpoints {
            t = t.put_bytes(&cp.base.mac).put_bytes(&cp.binding_mac);
        }

        t = t
            .put_u64(stats.primary_count)
            .put_u64(stats.reference_count)
            .put_u64(stats.validated_count)
            .put_u64(stats.total_synthetic_detected)
            .put_u64(stats.reference_surplus_total)
            .put_u64(stats.ticks)
            .put_bool(stats.reference_available)
            .put_bool(stats.strict_mode)
            .put_bool(stats.degraded_reason.is_some())
            .put_prefixed(stats.degraded_reason.as_deref().unwrap_or_default().as_bytes());

        t = t
            .put_u64(timing.total_events)
            .put_u64(timing.anomalous_events)
            .put_u64(u64::from(timing.consecutive_identical))
            .put_bool(timing.suspected_scripted)
            .put_bool(timing.suspected_hardware_emulation)
            .put_bool(timing.coefficient_of_variation.is_some())
            .put_u64(timing.coefficient_of_variation.map_or(0, micro_units))
            .put_u64(timing.reason_counts.interval_too_fast)
            .put_u64(timing.reason_counts.consecutive_identical)
            .put_u64(timing.reason_counts.repeating_pattern)
            .put_u64(timing.reason_counts.variance_too_low)
            .put_u64(timing.reason_codes.len() as u64);
        for code in &timing.reason_codes {
            t = t.put_prefixed(code.as_bytes());
        }
        t
    }

    /// Derived percentages must agree with the signed counts.
    fn check_derived(&self) -> Result<(), WitnessError> {
        let stats = &self.validation_stats;
        let timing = &self.anomaly_report;
        let synthetic = percentage(stats.total_synthetic_detected, stats.primary_count);
        let anomalous = percentage(timing.anomalous_events, timing.total_events);
        if (synthetic - stats.synthetic_percentage).abs() > 1e-6
            || (anomalous - timing.anomaly_percentage).abs() > 1e-6
        {
            return Err(WitnessError::evidence("percentages disagree with signed counts"));
        }
        for cp in &self.checkpoints {
            if cp.hardware_available != self.hardware_available || cp.hardware_backed != self.hardware_backed {
                return Err(WitnessError::evidence("checkpoint hardware flags disagree with record"));
            }
        }
        Ok(())
    }

    /// Pretty JSON in field declaration order.
    pub fn to_json(&self) -> Result<String, WitnessError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a record produced by [`EvidenceRecord::to_json`].
    pub fn from_json(json: &str) -> Result<Self, WitnessError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Intact chain with no sign of scripting or emulated hardware.
    #[must_use]
    pub fn is_human_likely(&self) -> bool {
        !self.compromised
            && !self.anomaly_report.suspected_scripted
            && !self.anomaly_report.suspected_hardware_emulation
    }

    /// Check the final quote against the signature, without the integrity key.
    ///
    /// Returns `Ok(false)` when no quote is attached.
    pub fn verify_attestation(&self) -> Result<bool, WitnessError> {
        let Some(attestation) = &self.final_attestation else {
            return Ok(false);
        };
        if !constant_time_eq(&attestation.data, &sha256(&self.signature)) {
            return Err(WitnessError::AttestationMismatch {
                reason: "final quote does not cover the evidence signature".into(),
            });
        }
        if !attestation.verify_signature()? {
            return Err(WitnessError::SignatureInvalid {
                reason: "final quote signature".into(),
            });
        }
        Ok(true)
    }
}

impl HardwareTrustBinding {
    /// Export signed evidence for `session`.
    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    pub async fn export_evidence(&self, session: &SessionInfo) -> Result<EvidenceRecord, WitnessError> {
        let mut state = self.lock_state().await;
        let chain = self.chain();
        let compromise = chain.is_compromised();
        let view = chain.view();
        let stats = chain.validation_stats();

        let mut record = EvidenceRecord {
            version: EVIDENCE_VERSION,
            session_id: session.session_id.clone(),
            started_at: session.started_at,
            ended_at: session.ended_at.unwrap_or_else(Utc::now),
            final_count: chain.count().trusted(),
            compromised: compromise.compromised,
            compromise_reason: compromise.compromised.then(|| compromise.reason.clone()),
            hardware_available: state.anchor.is_some(),
            hardware_backed: state
                .anchor
                .as_ref()
                .is_some_and(|a| a.hardware_type().is_hardware_backed()),
            strict_mode: stats.strict_mode,
            reference_available: stats.reference_available,
            device_id: state.device_id.clone(),
            hw_counter: state.hw_counter,
            final_chain_hash: view.chain_hash,
            binding_hash: state.binding_chain,
            update_counter: view.update_counter,
            checkpoints: state.checkpoints.clone(),
            validation_stats: stats,
            anomaly_report: chain.anomaly_report(),
            final_attestation: None,
            signature: [0u8; 32],
        };
        record.signature = chain.keyed_mac(|t| record.signed_fields(t))?;

        if self.config().use_attestation {
            if let Some(anchor) = state.anchor.clone() {
                match anchor
                    .quote(&sha256(&record.signature), &self.config().seal_policy)
                    .await
                {
                    Ok(quote) => record.final_attestation = Some(quote),
                    Err(e) => {
                        state.anchor_faults += 1;
                        warn!(error = %e, "Final evidence quote failed");
                    },
                }
            }
        }

        info!(
            final_count = ?record.final_count,
            compromised = record.compromised,
            checkpoints = record.checkpoints.len(),
            attested = record.final_attestation.is_some(),
            "Evidence exported"
        );
        Ok(record)
    }

    /// Verify a record produced by this binding.
    ///
    /// Checks, in order: the signature, derived fields against the signed
    /// ones, every checkpoint, monotonic checkpoint timestamps and counts,
    /// then the final quote if present.
    pub async fn verify_evidence(&self, record: &EvidenceRecord) -> Result<(), WitnessError> {
        let expected = self.chain().keyed_mac(|t| record.signed_fields(t))?;
        if !constant_time_eq(&expected, &record.signature) {
            return Err(WitnessError::SignatureInvalid {
                reason: "evidence signature".into(),
            });
        }

        record.check_derived()?;

        {
            let state = self.lock_state().await;
            for cp in &record.checkpoints {
                self.verify_snapshot_locked(&state, cp)?;
            }
        }

        for pair in record.checkpoints.windows(2) {
            let (prev, next) = (&pair[0].base, &pair[1].base);
            if next.timestamp < prev.timestamp {
                return Err(WitnessError::evidence("checkpoint timestamps go backwards"));
            }
            if next.count < prev.count || next.update_counter < prev.update_counter {
                return Err(WitnessError::evidence("checkpoint counts go backwards"));
            }
            if pair[1].hw_counter < pair[0].hw_counter {
                return Err(WitnessError::CounterRollback {
                    expected: pair[0].hw_counter,
                    observed: pair[1].hw_counter,
                });
            }
        }

        if let (Some(last), Some(final_count)) = (record.checkpoints.last(), record.final_count) {
            if last.base.count > final_count {
                return Err(WitnessError::evidence("final count below last checkpoint"));
            }
        }

        record.verify_attestation()?;
        Ok(())
    }
}

/// Fixed-point encoding of a ratio for signing; JSON floats need not
/// round-trip bit for bit.
fn micro_units(v: f64) -> u64 {
    (v * 1_000_000.0).round() as u64
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keywitness_anchor::{SoftwareAnchor, TrustAnchor};

    use super::*;
    use crate::config::{BindingConfig, TimingConfig, ValidatorConfig};
    use crate::counter::EventCounter;
    use crate::integrity::IntegrityChain;
    use crate::validator::{CrossSourceValidator, ReferenceSource};
    use crate::WitnessCounter;

    async fn session(anchor: Option<Arc<dyn TrustAnchor>>) -> (Arc<EventCounter>, Arc<EventCounter>, HardwareTrustBinding) {
        let primary = Arc::new(EventCounter::new());
        let reference = Arc::new(EventCounter::new());
        let validator = CrossSourceValidator::new(
            Arc::clone(&primary),
            ReferenceSource::Available(Arc::clone(&reference)),
            ValidatorConfig::default(),
        );
        let chain = IntegrityChain::new(validator, TimingConfig::default()).unwrap();
        let binding = HardwareTrustBinding::new(chain, anchor, BindingConfig::default())
            .await
            .unwrap();
        (primary, reference, binding)
    }

    #[tokio::test]
    async fn test_export_and_verify() {
        let anchor: Arc<dyn TrustAnchor> = Arc::new(SoftwareAnchor::new());
        let (p, r, binding) = session(Some(anchor)).await;

        for _ in 0..3 {
            p.add(4);
            r.add(4);
            binding.tick().await;
            binding.seal_with_hardware().await.unwrap();
        }

        let record = binding.export_evidence(&SessionInfo::new("s-1")).await.unwrap();
        assert_eq!(record.final_count, Some(12));
        assert_eq!(record.checkpoints.len(), 3);
        assert!(record.hardware_available);
        assert!(!record.hardware_backed);
        assert!(record.final_attestation.is_some());
        binding.verify_evidence(&record).await.unwrap();
        assert!(record.verify_attestation().unwrap());
    }

    #[tokio::test]
    async fn test_json_round_trip_still_verifies() {
        let (p, r, binding) = session(None).await;
        p.add(2);
        r.add(2);
        WitnessCounter::tick(&binding).await;
        binding.seal_with_hardware().await.unwrap();

        let record = binding.export_evidence(&SessionInfo::new("s-2")).await.unwrap();
        let json = record.to_json().unwrap();
        let back = EvidenceRecord::from_json(&json).unwrap();
        binding.verify_evidence(&back).await.unwrap();
        assert!(json.find("\"version\"").unwrap() < json.find("\"signature\"").unwrap());
    }

    #[tokio::test]
    async fn test_tampered_record_rejected() {
        let (p, r, binding) = session(None).await;
        p.add(5);
        r.add(5);
        binding.tick().await;
        let record = binding.export_evidence(&SessionInfo::new("s-3")).await.unwrap();

        let mut t = record.clone();
        t.final_count = Some(500);
        assert!(matches!(
            binding.verify_evidence(&t).await,
            Err(WitnessError::SignatureInvalid { .. })
        ));

        let mut t = record;
        t.session_id.push('x');
        assert!(binding.verify_evidence(&t).await.is_err());
    }

    #[tokio::test]
    async fn test_trust_flags_and_statistics_are_signed() {
        let anchor: Arc<dyn TrustAnchor> = Arc::new(SoftwareAnchor::new());
        let (p, r, binding) = session(Some(anchor)).await;
        p.add(8);
        r.add(5);
        binding.tick().await;
        let t0 = std::time::Instant::now();
        for i in 0..6u64 {
            binding.record_event(t0 + std::time::Duration::from_millis(5 * i)).await;
        }
        binding.seal_with_hardware().await.unwrap();

        let record = binding.export_evidence(&SessionInfo::new("s-5")).await.unwrap();
        assert!(!record.is_human_likely());
        assert_eq!(record.validation_stats.total_synthetic_detected, 3);
        binding.verify_evidence(&record).await.unwrap();

        let tampers: Vec<(&str, Box<dyn Fn(&mut EvidenceRecord)>)> = vec![
            ("hardware_backed", Box::new(|r: &mut EvidenceRecord| r.hardware_backed = true)),
            ("strict_mode", Box::new(|r: &mut EvidenceRecord| r.strict_mode = !r.strict_mode)),
            ("reference_available", Box::new(|r: &mut EvidenceRecord| r.reference_available = !r.reference_available)),
            ("total_synthetic_detected", Box::new(|r: &mut EvidenceRecord| r.validation_stats.total_synthetic_detected = 0)),
            ("validated_count", Box::new(|r: &mut EvidenceRecord| r.validation_stats.validated_count += 1)),
            ("suspected_scripted", Box::new(|r: &mut EvidenceRecord| r.anomaly_report.suspected_scripted = !r.anomaly_report.suspected_scripted)),
            (
                "suspected_hardware_emulation",
                Box::new(|r: &mut EvidenceRecord| r.anomaly_report.suspected_hardware_emulation = !r.anomaly_report.suspected_hardware_emulation),
            ),
            ("anomalous_events", Box::new(|r: &mut EvidenceRecord| r.anomaly_report.anomalous_events = 0)),
            ("interval_too_fast", Box::new(|r: &mut EvidenceRecord| r.anomaly_report.reason_counts.interval_too_fast = 0)),
            ("reason_codes", Box::new(|r: &mut EvidenceRecord| r.anomaly_report.reason_codes.clear())),
        ];
        for (field, tamper) in tampers {
            let mut t = record.clone();
            tamper(&mut t);
            assert!(
                matches!(binding.verify_evidence(&t).await, Err(WitnessError::SignatureInvalid { .. })),
                "{field} change went unnoticed"
            );
        }

        let mut t = record.clone();
        t.validation_stats.synthetic_percentage = 0.0;
        assert!(binding.verify_evidence(&t).await.is_err());

        let mut t = record;
        t.hardware_backed = true;
        t.validation_stats.total_synthetic_detected = 0;
        t.anomaly_report.suspected_scripted = false;
        t.anomaly_report.suspected_hardware_emulation = false;
        assert!(t.is_human_likely());
        assert!(binding.verify_evidence(&t).await.is_err());
    }

    #[tokio::test]
    async fn test_compromised_export_has_no_count() {
        let (_, _, binding) = session(None).await;
        binding.chain().mark_compromised("hardware counter rollback: 5 -> 4");
        let record = binding.export_evidence(&SessionInfo::new("s-4")).await.unwrap();

        assert!(record.compromised);
        assert_eq!(record.final_count, None);
        assert!(!record.is_human_likely());
        assert!(record.compromise_reason.unwrap().contains("rollback"));
    }
}
