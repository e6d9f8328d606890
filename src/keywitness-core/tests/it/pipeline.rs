//! End-to-end pipeline tests: sources, validator, chain, binding, evidence.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keywitness_anchor::{
    AnchorCapabilities, AnchorError, Attestation, HardwareType, SealPolicy, SoftwareAnchor, TrustAnchor,
};
use keywitness_core::{
    select_sources, CountReading, HardwareTrustBinding, SessionInfo, SimulatedSource, SourceLayer,
    WitnessConfig, WitnessCounter, WitnessError,
};

/// Software anchor whose counter replays a script before falling through.
struct ScriptedAnchor {
    inner: SoftwareAnchor,
    script: Mutex<VecDeque<Result<u64, ()>>>,
}

impl ScriptedAnchor {
    fn new(script: impl IntoIterator<Item = Result<u64, ()>>) -> Self {
        Self {
            inner: SoftwareAnchor::new(),
            script: Mutex::new(script.into_iter().collect()),
        }
    }
}

#[async_trait]
impl TrustAnchor for ScriptedAnchor {
    fn hardware_type(&self) -> HardwareType {
        self.inner.hardware_type()
    }

    fn capabilities(&self) -> AnchorCapabilities {
        self.inner.capabilities()
    }

    fn manufacturer(&self) -> String {
        "scripted".into()
    }

    fn firmware_version(&self) -> String {
        self.inner.firmware_version()
    }

    async fn open(&self) -> Result<(), AnchorError> {
        self.inner.open().await
    }

    async fn close(&self) -> Result<(), AnchorError> {
        self.inner.close().await
    }

    async fn device_id(&self) -> Result<Vec<u8>, AnchorError> {
        self.inner.device_id().await
    }

    async fn get_counter(&self) -> Result<u64, AnchorError> {
        self.inner.get_counter().await
    }

    async fn increment_counter(&self) -> Result<u64, AnchorError> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(value)) => Ok(value),
            Some(Err(())) => Err(AnchorError::counter("transient bus error")),
            None => self.inner.increment_counter().await,
        }
    }

    async fn seal(&self, data: &[u8], policy: &SealPolicy) -> Result<Vec<u8>, AnchorError> {
        self.inner.seal(data, policy).await
    }

    async fn unseal(&self, blob: &[u8]) -> Result<Vec<u8>, AnchorError> {
        self.inner.unseal(blob).await
    }

    async fn quote(&self, data: &[u8], policy: &SealPolicy) -> Result<Attestation, AnchorError> {
        self.inner.quote(data, policy).await
    }
}

/// Anchor that cannot be opened.
struct DeadAnchor;

#[async_trait]
impl TrustAnchor for DeadAnchor {
    fn hardware_type(&self) -> HardwareType {
        HardwareType::TpmDiscrete
    }

    fn capabilities(&self) -> AnchorCapabilities {
        AnchorCapabilities::default()
    }

    fn manufacturer(&self) -> String {
        "none".into()
    }

    fn firmware_version(&self) -> String {
        "0".into()
    }

    async fn open(&self) -> Result<(), AnchorError> {
        Err(AnchorError::HardwareNotAvailable {
            reason: "no TPM device".into(),
        })
    }

    async fn close(&self) -> Result<(), AnchorError> {
        Ok(())
    }

    async fn device_id(&self) -> Result<Vec<u8>, AnchorError> {
        Err(AnchorError::NotOpen)
    }

    async fn get_counter(&self) -> Result<u64, AnchorError> {
        Err(AnchorError::NotOpen)
    }

    async fn increment_counter(&self) -> Result<u64, AnchorError> {
        Err(AnchorError::NotOpen)
    }

    async fn seal(&self, _data: &[u8], _policy: &SealPolicy) -> Result<Vec<u8>, AnchorError> {
        Err(AnchorError::NotOpen)
    }

    async fn unseal(&self, _blob: &[u8]) -> Result<Vec<u8>, AnchorError> {
        Err(AnchorError::NotOpen)
    }

    async fn quote(&self, _data: &[u8], _policy: &SealPolicy) -> Result<Attestation, AnchorError> {
        Err(AnchorError::NotOpen)
    }
}

struct Rig {
    primary: SimulatedSource,
    reference: SimulatedSource,
    binding: HardwareTrustBinding,
}

async fn rig(config: &WitnessConfig, reference_up: bool, anchor: Option<Arc<dyn TrustAnchor>>) -> Rig {
    let primary = SimulatedSource::new("os-hook", SourceLayer::Primary);
    let reference = if reference_up {
        SimulatedSource::new("raw-hid", SourceLayer::Reference)
    } else {
        SimulatedSource::unavailable("raw-hid", SourceLayer::Reference, "permission denied")
    };
    let sources = select_sources(&primary, Some(&reference)).unwrap();
    let binding = HardwareTrustBinding::from_config(config, sources, anchor).await.unwrap();
    Rig {
        primary,
        reference,
        binding,
    }
}

fn software() -> Option<Arc<dyn TrustAnchor>> {
    Some(Arc::new(SoftwareAnchor::new()))
}

#[tokio::test]
async fn test_strict_mode_credits_only_confirmed_events() {
    let r = rig(&WitnessConfig::default(), true, software()).await;
    r.primary.emit(100);
    r.reference.emit(80);
    r.binding.tick().await;

    assert_eq!(r.binding.chain().count(), CountReading::Trusted { count: 80 });
    let stats = r.binding.chain().validation_stats();
    assert_eq!(stats.total_synthetic_detected, 20);
    assert_eq!(stats.discrepancy, 20);
    assert!((stats.synthetic_percentage - 20.0).abs() < 1e-9);
    assert!(stats.strict_mode);
}

#[tokio::test]
async fn test_sustained_injection_accumulates_per_tick() {
    let r = rig(&WitnessConfig::default(), true, software()).await;
    let mut at = Instant::now();
    let mut i = 0u64;
    let emulation_before = r.binding.anomaly_report().suspected_hardware_emulation;

    for tick in 1..=6u64 {
        r.primary.emit(150);
        r.reference.emit(100);
        for _ in 0..100 {
            at += Duration::from_millis(90 + (i * 37 % 113) + (i * i % 7) * 11);
            i += 1;
            r.binding.record_event(at).await;
        }
        r.binding.tick().await;

        let stats = r.binding.chain().validation_stats();
        assert_eq!(stats.validated_count, 100 * tick);
        assert_eq!(stats.total_synthetic_detected, 50 * tick);
        assert_eq!(r.binding.chain().count().trusted(), Some(100 * tick));
        assert_eq!(
            r.binding.anomaly_report().suspected_hardware_emulation,
            emulation_before
        );
    }
    assert!(!r.binding.chain().is_compromised().compromised);
}

#[tokio::test]
async fn test_permissive_mode_credits_primary() {
    let mut config = WitnessConfig::default();
    config.validator.strict = false;
    let r = rig(&config, true, software()).await;
    r.primary.emit(100);
    r.reference.emit(80);
    r.binding.tick().await;

    assert_eq!(r.binding.chain().count().trusted(), Some(100));
    assert_eq!(r.binding.chain().validation_stats().total_synthetic_detected, 20);
}

#[tokio::test]
async fn test_hardware_rollback_compromises_chain() {
    let anchor: Arc<dyn TrustAnchor> = Arc::new(ScriptedAnchor::new([Ok(5), Ok(6), Ok(4)]));
    let r = rig(&WitnessConfig::default(), true, Some(anchor)).await;
    let t0 = Instant::now();

    assert!(!r.binding.record_event(t0).await.reading.is_tainted());
    assert!(!r.binding.record_event(t0 + Duration::from_millis(150)).await.reading.is_tainted());
    let rolled = r.binding.record_event(t0 + Duration::from_millis(300)).await;

    assert!(rolled.reading.is_tainted());
    let status = r.binding.chain().is_compromised();
    assert!(status.compromised);
    assert!(status.reason.contains("rollback"));
    assert!(r.binding.seal_with_hardware().await.unwrap_err().is_integrity_violation());

    let evidence = r.binding.export_evidence(&SessionInfo::new("rollback")).await.unwrap();
    assert!(evidence.compromised);
    assert_eq!(evidence.final_count, None);
}

#[tokio::test]
async fn test_transient_anchor_fault_keeps_trust() {
    let anchor: Arc<dyn TrustAnchor> = Arc::new(ScriptedAnchor::new([Err(())]));
    let r = rig(&WitnessConfig::default(), true, Some(anchor)).await;
    let t0 = Instant::now();

    assert!(!r.binding.record_event(t0).await.reading.is_tainted());
    assert!(!r.binding.record_event(t0 + Duration::from_millis(180)).await.reading.is_tainted());

    let status = r.binding.trust_status().await;
    assert_eq!(status.anchor_faults, 1);
    assert_eq!(status.hw_counter, 1);
    assert!(!status.compromise.compromised);
}

#[tokio::test]
async fn test_degraded_session_without_reference_or_anchor() {
    let anchor: Arc<dyn TrustAnchor> = Arc::new(DeadAnchor);
    let r = rig(&WitnessConfig::default(), false, Some(anchor)).await;
    r.primary.emit(30);
    r.binding.tick().await;
    let snap = r.binding.seal_with_hardware().await.unwrap();

    assert!(!snap.hardware_available);
    assert!(snap.attestation.is_none());
    let stats = r.binding.chain().validation_stats();
    assert!(!stats.strict_mode);
    assert!(!stats.reference_available);
    assert_eq!(stats.validated_count, 30);

    let evidence = r.binding.export_evidence(&SessionInfo::new("degraded")).await.unwrap();
    assert!(!evidence.hardware_available);
    assert!(!evidence.reference_available);
    assert!(evidence.final_attestation.is_none());
    r.binding.verify_evidence(&evidence).await.unwrap();
    assert!(!r.reference.is_running());
}

#[tokio::test]
async fn test_evidence_round_trip_with_checkpoints() {
    let r = rig(&WitnessConfig::default(), true, software()).await;
    let mut at = Instant::now();
    for round in 0..4u64 {
        r.primary.emit(10);
        r.reference.emit(10);
        for i in 0..10u64 {
            at += Duration::from_millis(90 + (i * 37 + round * 11) % 140);
            r.binding.record_event(at).await;
        }
        r.binding.tick().await;
        r.binding.seal_with_hardware().await.unwrap();
    }

    let evidence = r.binding.export_evidence(&SessionInfo::new("typing")).await.unwrap();
    assert_eq!(evidence.final_count, Some(40));
    assert_eq!(evidence.checkpoints.len(), 4);
    assert_eq!(evidence.hw_counter, 40);
    assert!(evidence.is_human_likely());
    assert!(evidence.verify_attestation().unwrap());

    let parsed = keywitness_core::EvidenceRecord::from_json(&evidence.to_json().unwrap()).unwrap();
    r.binding.verify_evidence(&parsed).await.unwrap();

    let mut reordered = parsed;
    reordered.checkpoints.swap(0, 3);
    assert!(r.binding.verify_evidence(&reordered).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_background_ticks_through_dyn_handle() {
    let r = rig(&WitnessConfig::default(), true, software()).await;
    let Rig {
        primary,
        reference,
        binding,
    } = r;
    let handle: Arc<dyn WitnessCounter> = Arc::new(binding);
    let mut events = handle.subscribe(5).unwrap();

    Arc::clone(&handle).start().unwrap();
    assert!(matches!(
        Arc::clone(&handle).start(),
        Err(WitnessError::AlreadyRunning { .. })
    ));

    primary.emit(7);
    reference.emit(7);
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(handle.count(), CountReading::Trusted { count: 7 });
    assert_eq!(events.recv().await.unwrap().count, 7);

    handle.stop().await;
    primary.emit(3);
    reference.emit(3);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.count().trusted(), Some(7));
    assert!(events.recv().await.is_none());
}

#[test]
fn test_start_outside_runtime_fails() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let r = rt.block_on(rig(&WitnessConfig::default(), true, None));
    let handle: Arc<dyn WitnessCounter> = Arc::new(r.binding);
    assert!(matches!(handle.start(), Err(WitnessError::NoRuntime)));
}
