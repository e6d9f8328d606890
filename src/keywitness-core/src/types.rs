//! Types shared across the pipeline layers.

use serde::{Deserialize, Serialize};

/// A count as reported by a layer that tracks integrity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CountReading {
    /// Count backed by an intact chain.
    Trusted {
        /// Validated event count.
        count: u64,
    },
    /// The chain is compromised; no count is vouched for.
    Tainted {
        /// Why the chain was compromised.
        reason: String,
    },
}

impl CountReading {
    /// Trusted count, or `None` if tainted.
    #[must_use]
    pub fn trusted(&self) -> Option<u64> {
        match self {
            Self::Trusted { count } => Some(*count),
            Self::Tainted { .. } => None,
        }
    }

    /// Whether the reading is tainted.
    #[must_use]
    pub fn is_tainted(&self) -> bool {
        matches!(self, Self::Tainted { .. })
    }
}

/// Compromise flag with its reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompromiseStatus {
    /// Whether integrity has been lost.
    pub compromised: bool,
    /// Reason, empty when not compromised.
    pub reason: String,
}

impl CompromiseStatus {
    /// Status of an intact layer.
    #[must_use]
    pub fn intact() -> Self {
        Self::default()
    }
}

/// Nanoseconds since the Unix epoch, saturating outside the representable range.
pub(crate) fn unix_nanos(t: &chrono::DateTime<chrono::Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}
