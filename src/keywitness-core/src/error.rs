//! Error types for the witness pipeline.

use keywitness_anchor::AnchorError;
use keywitness_crypto::CryptoError;
use thiserror::Error;

/// Errors that can occur in the witness pipeline.
#[derive(Debug, Error)]
pub enum WitnessError {
    /// Subscription threshold must be at least 1.
    #[error("Subscription threshold must be greater than zero")]
    InvalidThreshold,

    /// Reference source is unavailable; strict mode cannot be enabled.
    #[error("Reference source unavailable: {reason}")]
    ReferenceUnavailable {
        /// Why the reference source is unavailable.
        reason: String,
    },

    /// An event source cannot run on this host.
    #[error("Event source {name} unavailable: {reason}")]
    SourceUnavailable {
        /// Source name.
        name: String,
        /// Why it is unavailable.
        reason: String,
    },

    /// The integrity chain is compromised; trusted operations are refused.
    #[error("Counter compromised: {reason}")]
    Compromised {
        /// Reason recorded when the chain was compromised.
        reason: String,
    },

    /// Background task already running.
    #[error("{component} is already running")]
    AlreadyRunning {
        /// Component that was started twice.
        component: String,
    },

    /// `start()` was called outside a tokio runtime.
    #[error("No tokio runtime available to run background tasks")]
    NoRuntime,

    /// Secure random generator failed during initialization.
    #[error("Entropy source failed: {reason}")]
    Entropy {
        /// Reason for the failure.
        reason: String,
    },

    /// A MAC or chain hash did not verify.
    #[error("Integrity violation: {reason}")]
    IntegrityViolation {
        /// What failed to verify.
        reason: String,
    },

    /// Hardware counter went backwards.
    #[error("Counter rollback detected: expected at least {expected}, observed {observed}")]
    CounterRollback {
        /// Lowest acceptable value.
        expected: u64,
        /// Value actually reported.
        observed: u64,
    },

    /// Snapshot was produced on a different device.
    #[error("Device identity mismatch")]
    DeviceMismatch,

    /// Attestation does not cover the expected data.
    #[error("Attestation mismatch: {reason}")]
    AttestationMismatch {
        /// What differed.
        reason: String,
    },

    /// Quote or evidence signature did not verify.
    #[error("Signature invalid: {reason}")]
    SignatureInvalid {
        /// Reason for failure.
        reason: String,
    },

    /// Evidence record is structurally inconsistent.
    #[error("Evidence invalid: {reason}")]
    EvidenceInvalid {
        /// What is inconsistent.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message.
        message: String,
    },

    /// Cryptographic error.
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    /// Trust anchor error.
    #[error("Trust anchor error: {0}")]
    AnchorError(#[from] AnchorError),

    /// JSON encoding or decoding error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O error while loading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WitnessError {
    /// Create an integrity violation error.
    #[must_use]
    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create an evidence error.
    #[must_use]
    pub fn evidence(reason: impl Into<String>) -> Self {
        Self::EvidenceInvalid {
            reason: reason.into(),
        }
    }

    /// Tampering with counter, chain, snapshot or hardware state.
    ///
    /// These latch or indicate the compromised state and are never retried.
    #[must_use]
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Self::Compromised { .. }
                | Self::IntegrityViolation { .. }
                | Self::CounterRollback { .. }
                | Self::DeviceMismatch
                | Self::AttestationMismatch { .. }
                | Self::SignatureInvalid { .. }
        )
    }

    /// A capability is missing; the session continues in a weaker mode.
    #[must_use]
    pub fn is_degradation(&self) -> bool {
        matches!(
            self,
            Self::ReferenceUnavailable { .. } | Self::SourceUnavailable { .. } | Self::AnchorError(_)
        )
    }

    /// The caller used the API incorrectly.
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidThreshold
                | Self::AlreadyRunning { .. }
                | Self::NoRuntime
                | Self::Compromised { .. }
        )
    }
}
