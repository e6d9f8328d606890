//! Integrity chain and snapshot properties.

use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use keywitness_core::{
    AnomalyReason, CountReading, CrossSourceValidator, EventCounter, IntegrityChain, ReferenceSource,
    SealedSnapshot, TimingAnalyzer, TimingConfig, ValidatorConfig,
};

struct Session {
    primary: Arc<EventCounter>,
    reference: Arc<EventCounter>,
    chain: IntegrityChain,
}

fn session() -> Session {
    let primary = Arc::new(EventCounter::new());
    let reference = Arc::new(EventCounter::new());
    let validator = CrossSourceValidator::new(
        Arc::clone(&primary),
        ReferenceSource::Available(Arc::clone(&reference)),
        ValidatorConfig::default(),
    );
    let chain = IntegrityChain::new(validator, TimingConfig::default()).unwrap();
    Session {
        primary,
        reference,
        chain,
    }
}

impl Session {
    fn press(&self, n: u64) {
        self.primary.add(n);
        self.reference.add(n);
        self.chain.reconcile().unwrap();
    }
}

/// Flip one bit of the snapshot's MACed content.
fn flip(snapshot: &SealedSnapshot, field: u8, bit: usize) -> SealedSnapshot {
    let mut t = snapshot.clone();
    match field % 4 {
        0 => t.count ^= 1 << (bit % 64),
        1 => t.update_counter ^= 1 << (bit % 64),
        2 => t.chain_hash[(bit / 8) % 32] ^= 1 << (bit % 8),
        _ => t.mac[(bit / 8) % 32] ^= 1 << (bit % 8),
    }
    t
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    /// A sealed snapshot verifies, before and after a JSON round trip.
    #[test]
    fn seal_round_trip(presses in prop::collection::vec(1u64..20, 0..10)) {
        let s = session();
        for n in &presses {
            s.press(*n);
        }
        let snap = s.chain.seal().unwrap();
        prop_assert_eq!(snap.count, presses.iter().sum::<u64>());
        prop_assert!(s.chain.verify_snapshot(&snap));

        let json = serde_json::to_string(&snap).unwrap();
        let back: SealedSnapshot = serde_json::from_str(&json).unwrap();
        prop_assert!(s.chain.verify_snapshot(&back));
    }

    /// Any single-bit change to a snapshot is detected.
    #[test]
    fn single_bit_tamper_detected(field in any::<u8>(), bit in 0usize..256, presses in 1u64..50) {
        let s = session();
        s.press(presses);
        let snap = s.chain.seal().unwrap();
        prop_assert!(!s.chain.verify_snapshot(&flip(&snap, field, bit)));
    }

    /// Re-verifying unchanged state never flips the compromise flag.
    #[test]
    fn verify_idempotent(presses in prop::collection::vec(1u64..20, 1..10), rounds in 1usize..20) {
        let s = session();
        for n in &presses {
            s.press(*n);
        }
        for _ in 0..rounds {
            prop_assert!(s.chain.verify());
        }
        prop_assert!(!s.chain.is_compromised().compromised);
        prop_assert_eq!(s.chain.count(), CountReading::Trusted { count: presses.iter().sum() });
    }

    /// One chain update per crediting tick, none for idle ticks.
    #[test]
    fn updates_track_crediting_ticks(presses in prop::collection::vec(0u64..5, 1..30)) {
        let s = session();
        for n in &presses {
            s.press(*n);
        }
        let crediting = presses.iter().filter(|n| **n > 0).count() as u64;
        prop_assert_eq!(s.chain.update_counter(), crediting);
    }
}

#[test]
fn test_snapshot_from_other_session_rejected() {
    let a = session();
    let b = session();
    a.press(3);
    b.press(3);
    let snap = a.chain.seal().unwrap();
    assert!(!b.chain.verify_snapshot(&snap));
}

#[test]
fn test_snapshots_are_append_only() {
    let s = session();
    s.press(1);
    let first = s.chain.seal().unwrap();
    s.press(2);
    let second = s.chain.seal().unwrap();

    let all = s.chain.snapshots();
    assert_eq!(all, vec![first.clone(), second.clone()]);
    assert!(second.update_counter > first.update_counter);
    assert_ne!(second.chain_hash, first.chain_hash);
}

fn feed(analyzer: &mut TimingAnalyzer, intervals_ms: &[u64]) -> Vec<Option<AnomalyReason>> {
    let mut t = Instant::now();
    let mut out = vec![analyzer.on_event(t)];
    for ms in intervals_ms {
        t += Duration::from_millis(*ms);
        out.push(analyzer.on_event(t));
    }
    out
}

#[test]
fn test_fast_identical_intervals_flag_too_fast_first() {
    let mut analyzer = TimingAnalyzer::new(TimingConfig::default());
    let mut t = Instant::now();
    analyzer.on_event(t);
    let mut last = None;
    for _ in 0..5 {
        t += Duration::from_millis(5);
        last = Some(analyzer.on_event_detailed(t));
    }
    let verdict = last.unwrap();
    assert_eq!(verdict.primary, Some(AnomalyReason::IntervalTooFast));
    assert!(verdict.matched.contains(&AnomalyReason::ConsecutiveIdenticalIntervals));
    assert!(analyzer.report().suspected_scripted);
}

#[test]
fn test_just_under_minimum_is_too_fast() {
    let mut analyzer = TimingAnalyzer::new(TimingConfig::default());
    let results = feed(&mut analyzer, &[19]);
    assert_eq!(results[1], Some(AnomalyReason::IntervalTooFast));
}

#[test]
fn test_uniform_intervals_suggest_emulation() {
    let mut analyzer = TimingAnalyzer::new(TimingConfig::default());
    feed(&mut analyzer, &[80; 100]);
    let report = analyzer.report();
    assert!(report.suspected_hardware_emulation);
    assert!(report.reason_codes.iter().any(|c| c == "LOW_TIMING_VARIANCE"));
    assert!(report.coefficient_of_variation.unwrap() < 0.05);
}

#[test]
fn test_irregular_human_timing_is_clean() {
    let mut analyzer = TimingAnalyzer::new(TimingConfig::default());
    let intervals = [143, 97, 211, 88, 176, 132, 264, 101, 158, 119, 305, 92, 187, 141, 226];
    let results = feed(&mut analyzer, &intervals);
    assert!(results.iter().all(Option::is_none));
    let report = analyzer.report();
    assert!(!report.suspected_scripted);
    assert!(!report.suspected_hardware_emulation);
    assert_eq!(report.anomalous_events, 0);
}
