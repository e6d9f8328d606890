//! Statistical timing-anomaly detection over inter-event intervals.
//!
//! Four independent rules score every interval:
//!
//! 1. **Too fast**: shorter than the minimum human interval.
//! 2. **Identical run**: a run of intervals each strictly within tolerance of the
//!    previous one.
//! 3. **Repeating pattern**: the bucketed fingerprint of a sliding window has
//!    been seen too often.
//! 4. **Low variance**: once the ring buffer is full, the coefficient of
//!    variation is below threshold.
//!
//! Every rule updates its own state on every interval. The reason returned by
//! [`TimingAnalyzer::on_event`] is the first matching rule in the order above;
//! [`TimingAnalyzer::on_event_detailed`] also reports every rule that matched.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use keywitness_crypto::{Sha256Transcript, Transcript};
use serde::{Deserialize, Serialize};

use crate::config::TimingConfig;

/// Anomaly percentage above which a report carries `HIGH_ANOMALY_RATE`.
const HIGH_ANOMALY_RATE_PERCENT: f64 = 10.0;

/// Why an interval looks non-human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyReason {
    /// Faster than a human can press keys.
    IntervalTooFast,
    /// Run of near-identical intervals.
    ConsecutiveIdenticalIntervals,
    /// The same bucketed rhythm keeps recurring.
    RepeatingTimingPattern,
    /// Timing is too regular overall.
    VarianceTooLow,
}

impl AnomalyReason {
    /// Rule evaluation order.
    pub const ALL: [Self; 4] = [
        Self::IntervalTooFast,
        Self::ConsecutiveIdenticalIntervals,
        Self::RepeatingTimingPattern,
        Self::VarianceTooLow,
    ];

    /// Stable snake_case identifier.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::IntervalTooFast => "interval_too_fast",
            Self::ConsecutiveIdenticalIntervals => "consecutive_identical_intervals",
            Self::RepeatingTimingPattern => "repeating_timing_pattern",
            Self::VarianceTooLow => "variance_too_low",
        }
    }
}

impl std::fmt::Display for AnomalyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of analysing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingVerdict {
    /// Interval since the previous event; `None` for the first event.
    pub interval: Option<Duration>,
    /// First matching rule, if any.
    pub primary: Option<AnomalyReason>,
    /// Every rule that matched, in evaluation order.
    pub matched: Vec<AnomalyReason>,
}

impl TimingVerdict {
    /// Whether the interval passed every rule.
    pub fn is_clean(&self) -> bool {
        self.primary.is_none()
    }
}

/// Per-rule match tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCounts {
    /// Rule 1 matches.
    pub interval_too_fast: u64,
    /// Rule 2 matches.
    pub consecutive_identical: u64,
    /// Rule 3 matches.
    pub repeating_pattern: u64,
    /// Rule 4 matches.
    pub variance_too_low: u64,
}

impl ReasonCounts {
    fn bump(&mut self, reason: AnomalyReason) {
        let slot = match reason {
            AnomalyReason::IntervalTooFast => &mut self.interval_too_fast,
            AnomalyReason::ConsecutiveIdenticalIntervals => &mut self.consecutive_identical,
            AnomalyReason::RepeatingTimingPattern => &mut self.repeating_pattern,
            AnomalyReason::VarianceTooLow => &mut self.variance_too_low,
        };
        *slot += 1;
    }
}

/// Summary of timing behaviour so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    /// Events analysed, including the first.
    pub total_events: u64,
    /// Events with at least one matching rule.
    pub anomalous_events: u64,
    /// `anomalous_events / total_events * 100`.
    pub anomaly_percentage: f64,
    /// Current identical-interval run length.
    pub consecutive_identical: u32,
    /// Identical runs or repeating patterns indicate automation.
    pub suspected_scripted: bool,
    /// Low variance indicates a programmable HID device.
    pub suspected_hardware_emulation: bool,
    /// Coefficient of variation over the ring buffer, once full.
    pub coefficient_of_variation: Option<f64>,
    /// Per-rule match tallies.
    pub reason_counts: ReasonCounts,
    /// Machine-readable summary codes.
    pub reason_codes: Vec<String>,
}

/// Timing analyzer state. Not internally synchronized; the owning layer
/// serializes access.
#[derive(Debug)]
pub struct TimingAnalyzer {
    config: TimingConfig,
    last_event: Option<Instant>,
    last_interval: Option<Duration>,
    identical_run: u32,
    ring: VecDeque<Duration>,
    window: VecDeque<Duration>,
    fingerprints: HashMap<u64, u32>,
    max_fingerprint_seen: u32,
    total_events: u64,
    anomalous_events: u64,
    counts: ReasonCounts,
}

impl Default for TimingAnalyzer {
    fn default() -> Self {
        Self::new(TimingConfig::default())
    }
}

impl TimingAnalyzer {
    /// Create an analyzer with the given thresholds.
    pub fn new(config: TimingConfig) -> Self {
        Self {
            ring: VecDeque::with_capacity(config.buffer_size),
            window: VecDeque::with_capacity(config.pattern_window),
            config,
            last_event: None,
            last_interval: None,
            identical_run: 0,
            fingerprints: HashMap::new(),
            max_fingerprint_seen: 0,
            total_events: 0,
            anomalous_events: 0,
            counts: ReasonCounts::default(),
        }
    }

    /// Analyse an event and return the first matching anomaly.
    pub fn on_event(&mut self, timestamp: Instant) -> Option<AnomalyReason> {
        self.on_event_detailed(timestamp).primary
    }

    /// Analyse an event and return every matching anomaly.
    pub fn on_event_detailed(&mut self, timestamp: Instant) -> TimingVerdict {
        self.total_events += 1;

        let Some(last) = self.last_event.replace(timestamp) else {
            return TimingVerdict {
                interval: None,
                primary: None,
                matched: Vec::new(),
            };
        };
        // Out-of-order timestamps read as a zero interval.
        let interval = timestamp.saturating_duration_since(last);

        let mut matched = Vec::with_capacity(AnomalyReason::ALL.len());
        if self.check_too_fast(interval) {
            matched.push(AnomalyReason::IntervalTooFast);
        }
        if self.check_identical_run(interval) {
            matched.push(AnomalyReason::ConsecutiveIdenticalIntervals);
        }
        if self.check_repeating_pattern(interval) {
            matched.push(AnomalyReason::RepeatingTimingPattern);
        }
        if self.check_low_variance(interval) {
            matched.push(AnomalyReason::VarianceTooLow);
        }

        for reason in &matched {
            self.counts.bump(*reason);
        }
        if !matched.is_empty() {
            self.anomalous_events += 1;
        }

        TimingVerdict {
            interval: Some(interval),
            primary: matched.first().copied(),
            matched,
        }
    }

    fn check_too_fast(&self, interval: Duration) -> bool {
        interval < self.config.min_human_interval
    }

    fn check_identical_run(&mut self, interval: Duration) -> bool {
        let same = self
            .last_interval
            .is_some_and(|prev| abs_diff(interval, prev) < self.config.identical_tolerance);
        self.identical_run = if same { self.identical_run + 1 } else { 1 };
        self.last_interval = Some(interval);
        self.identical_run >= self.config.identical_run_threshold
    }

    fn check_repeating_pattern(&mut self, interval: Duration) -> bool {
        self.window.push_back(interval);
        if self.window.len() < self.config.pattern_window {
            return false;
        }

        let key = self.fingerprint();
        let seen = self.fingerprints.entry(key).or_insert(0);
        *seen += 1;
        let seen = *seen;
        self.max_fingerprint_seen = self.max_fingerprint_seen.max(seen);

        self.window.pop_front();
        seen >= self.config.pattern_repeat_threshold
    }

    /// First 8 bytes of SHA-256 over the big-endian bucket indices.
    fn fingerprint(&self) -> u64 {
        let bucket_ms = self.config.pattern_bucket.as_millis().max(1);
        let mut t = Sha256Transcript::new();
        for d in &self.window {
            let bucket = i64::try_from(d.as_millis() / bucket_ms).unwrap_or(i64::MAX);
            t = t.put_i64(bucket);
        }
        let digest = t.finish();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head)
    }

    fn check_low_variance(&mut self, interval: Duration) -> bool {
        if self.ring.len() == self.config.buffer_size {
            self.ring.pop_front();
        }
        self.ring.push_back(interval);
        self.coefficient_of_variation()
            .is_some_and(|cv| cv < self.config.cv_threshold)
    }

    /// Population CV over the ring in whole milliseconds, once the ring is full.
    fn coefficient_of_variation(&self) -> Option<f64> {
        if self.ring.len() < self.config.buffer_size {
            return None;
        }
        let n = self.ring.len() as f64;
        let (sum, sum_sq) = self.ring.iter().fold((0.0, 0.0), |(s, sq), d| {
            let ms = d.as_millis() as f64;
            (s + ms, sq + ms * ms)
        });
        let mean = sum / n;
        if mean == 0.0 {
            return Some(0.0);
        }
        let variance = (sum_sq / n - mean * mean).max(0.0);
        Some(variance.sqrt() / mean)
    }

    /// Snapshot of the analysis so far.
    pub fn report(&self) -> AnomalyReport {
        let anomaly_percentage = if self.total_events > 0 {
            self.anomalous_events as f64 / self.total_events as f64 * 100.0
        } else {
            0.0
        };

        let cv = self.coefficient_of_variation();
        let identical = self.identical_run >= self.config.identical_run_threshold;
        let repeating = self.max_fingerprint_seen >= self.config.pattern_repeat_threshold;
        let low_variance = cv.is_some_and(|cv| cv < self.config.cv_threshold);

        let mut reason_codes = Vec::new();
        if identical {
            reason_codes.push("CONSECUTIVE_IDENTICAL_TIMING".to_string());
        }
        if low_variance {
            reason_codes.push("LOW_TIMING_VARIANCE".to_string());
        }
        if repeating {
            reason_codes.push("REPEATING_TIMING_PATTERN".to_string());
        }
        if anomaly_percentage > HIGH_ANOMALY_RATE_PERCENT {
            reason_codes.push("HIGH_ANOMALY_RATE".to_string());
        }

        AnomalyReport {
            total_events: self.total_events,
            anomalous_events: self.anomalous_events,
            anomaly_percentage,
            consecutive_identical: self.identical_run,
            suspected_scripted: identical || repeating,
            suspected_hardware_emulation: low_variance,
            coefficient_of_variation: cv,
            reason_counts: self.counts,
            reason_codes,
        }
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}
