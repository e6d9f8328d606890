//! Property tests for counting and cross-source reconciliation.

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use keywitness_core::{cross_validate, CrossSourceValidator, EventCounter, ReferenceSource, ValidatorConfig};

fn validator(primary: &Arc<EventCounter>, reference: &Arc<EventCounter>, strict: bool) -> CrossSourceValidator {
    CrossSourceValidator::new(
        Arc::clone(primary),
        ReferenceSource::Available(Arc::clone(reference)),
        ValidatorConfig {
            strict,
            ..ValidatorConfig::default()
        },
    )
}

/// Per-tick (primary, reference) growth.
fn tick_deltas() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..50, 0u64..50), 1..40)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    /// Discrepancy is exactly primary minus reference.
    #[test]
    fn cross_validate_discrepancy(p in 0i64..1_000_000, r in 0i64..1_000_000) {
        let v = cross_validate(p, r);
        prop_assert_eq!(v.discrepancy, p - r);
        prop_assert_eq!(v.synthetic_detected, p > r);
    }

    /// Percentage stays within [0, 100] and is zero when nothing is synthetic.
    #[test]
    fn cross_validate_percentage_bounded(p in 0i64..1_000_000, r in 0i64..1_000_000) {
        let v = cross_validate(p, r);
        prop_assert!((0.0..=100.0).contains(&v.synthetic_percentage));
        if p <= r {
            prop_assert_eq!(v.synthetic_percentage, 0.0);
        }
    }

    /// For a fixed reference, more primary events never mean less synthetic.
    #[test]
    fn cross_validate_monotonic_in_primary(a in 0i64..1_000_000, extra in 0i64..1_000_000, r in 0i64..1_000_000) {
        let lo = cross_validate(a, r);
        let hi = cross_validate(a + extra, r);
        prop_assert!(hi.discrepancy >= lo.discrepancy);
        prop_assert!(hi.synthetic_detected || !lo.synthetic_detected);
        prop_assert!(hi.synthetic_percentage + 1e-9 >= lo.synthetic_percentage);
    }

    /// Strict mode credits exactly what the reference saw.
    #[test]
    fn strict_credits_reference_growth(deltas in tick_deltas()) {
        let (p, r) = (Arc::new(EventCounter::new()), Arc::new(EventCounter::new()));
        let v = validator(&p, &r, true);
        let mut expected = 0;
        for (dp, dr) in &deltas {
            p.add(*dp);
            r.add(*dr);
            v.reconcile();
            expected += dr;
        }
        prop_assert_eq!(v.validated_count(), expected);
    }

    /// Permissive mode credits everything the primary saw.
    #[test]
    fn permissive_credits_primary_growth(deltas in tick_deltas()) {
        let (p, r) = (Arc::new(EventCounter::new()), Arc::new(EventCounter::new()));
        let v = validator(&p, &r, false);
        for (dp, dr) in &deltas {
            p.add(*dp);
            r.add(*dr);
            v.reconcile();
        }
        prop_assert_eq!(v.validated_count(), p.count());
    }

    /// Synthetic events never exceed primary events, and lockstep sources
    /// never produce any.
    #[test]
    fn synthetic_bounded_by_primary(deltas in tick_deltas()) {
        let (p, r) = (Arc::new(EventCounter::new()), Arc::new(EventCounter::new()));
        let v = validator(&p, &r, true);
        for (dp, dr) in &deltas {
            p.add(*dp);
            r.add(*dr);
            v.reconcile();
        }
        let stats = v.validation_stats();
        prop_assert!(stats.total_synthetic_detected <= stats.primary_count);
        prop_assert_eq!(stats.ticks, deltas.len() as u64);

        let (p2, r2) = (Arc::new(EventCounter::new()), Arc::new(EventCounter::new()));
        let lockstep = validator(&p2, &r2, true);
        for (dp, _) in &deltas {
            p2.add(*dp);
            r2.add(*dp);
            lockstep.reconcile();
        }
        prop_assert!(!lockstep.synthetic_detected());
    }
}

#[test]
fn test_concurrent_increments_are_not_lost() {
    let counter = Arc::new(EventCounter::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let c = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..1_000 {
                    c.increment();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(counter.count(), 8_000);
}

#[tokio::test]
async fn test_subscriber_sees_threshold_crossings() {
    let counter = EventCounter::new();
    let mut rx = counter.subscribe(10).unwrap();

    counter.add(9);
    assert!(rx.try_recv().is_err());
    counter.increment();
    assert_eq!(rx.recv().await.unwrap().count, 10);

    counter.add(25);
    assert_eq!(rx.recv().await.unwrap().count, 35);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_zero_threshold_rejected() {
    let counter = EventCounter::new();
    assert!(counter.subscribe(0).unwrap_err().is_contract_violation());
}

#[test]
fn test_degraded_validator_reports_reason() {
    let p = Arc::new(EventCounter::new());
    let v = CrossSourceValidator::new(
        Arc::clone(&p),
        ReferenceSource::Unavailable {
            reason: "no raw input access".into(),
        },
        ValidatorConfig::default(),
    );
    p.add(12);
    v.reconcile();

    let stats = v.validation_stats();
    assert!(!stats.strict_mode);
    assert!(!stats.reference_available);
    assert_eq!(stats.degraded_reason.as_deref(), Some("no raw input access"));
    assert_eq!(stats.validated_count, 12);
    assert!(v.set_strict(true).unwrap_err().is_degradation());
}
