//! Error types for trust anchor operations.

use keywitness_crypto::CryptoError;
use thiserror::Error;

/// Errors that can occur during trust anchor operations.
#[derive(Debug, Error)]
pub enum AnchorError {
    /// Operation attempted before `open()` or after `close()`.
    #[error("Trust anchor is not open")]
    NotOpen,

    /// Hardware security module not available.
    #[error("Hardware not available: {reason}")]
    HardwareNotAvailable {
        /// Reason hardware is not available.
        reason: String,
    },

    /// Monotonic counter read or increment failed.
    #[error("Counter operation failed: {reason}")]
    CounterFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Sealing failed.
    #[error("Seal failed: {reason}")]
    SealFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Unsealing failed (wrong anchor, wrong policy, or corrupted blob).
    #[error("Unseal failed: {reason}")]
    UnsealFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Attestation quote could not be produced.
    #[error("Quote failed: {reason}")]
    QuoteFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Operation not supported by this anchor.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    /// Platform-specific error.
    #[error("Platform error: {message}")]
    PlatformError {
        /// Error message from the platform.
        message: String,
    },

    /// Underlying signature or MAC failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl AnchorError {
    /// Create a platform error from a message.
    #[must_use]
    pub fn platform(message: impl Into<String>) -> Self {
        Self::PlatformError {
            message: message.into(),
        }
    }

    /// Create a counter error from a reason.
    #[must_use]
    pub fn counter(reason: impl Into<String>) -> Self {
        Self::CounterFailed {
            reason: reason.into(),
        }
    }

    /// Create a seal error from a reason.
    #[must_use]
    pub fn seal(reason: impl Into<String>) -> Self {
        Self::SealFailed {
            reason: reason.into(),
        }
    }

    /// Create an unseal error from a reason.
    #[must_use]
    pub fn unseal(reason: impl Into<String>) -> Self {
        Self::UnsealFailed {
            reason: reason.into(),
        }
    }

    /// Create a quote error from a reason.
    #[must_use]
    pub fn quote(reason: impl Into<String>) -> Self {
        Self::QuoteFailed {
            reason: reason.into(),
        }
    }
}
