//! Core types for trust anchor operations.

use chrono::{DateTime, Utc};
use keywitness_crypto::{verify_classical, ClassicalAlgorithm, Sha256Transcript, Transcript};
use serde::{Deserialize, Serialize};

use crate::error::AnchorError;

/// Domain label for the bytes an anchor signs when quoting.
const QUOTE_DOMAIN: &[u8] = b"keywitness-quote-v1";

/// Type of trust anchor backing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HardwareType {
    /// Discrete TPM 2.0 (dedicated chip).
    TpmDiscrete = 1,

    /// Firmware TPM 2.0 (fTPM, Intel PTT, AMD fTPM).
    TpmFirmware = 2,

    /// Apple Secure Enclave.
    SecureEnclave = 3,

    /// Software-only implementation.
    /// Provides API compatibility, not hardware binding.
    SoftwareOnly = 4,
}

impl HardwareType {
    /// Whether keys and counters live in dedicated hardware.
    #[must_use]
    pub const fn is_hardware_backed(&self) -> bool {
        !matches!(self, Self::SoftwareOnly)
    }

    /// Security level (1-5, higher is better).
    #[must_use]
    pub const fn security_level(&self) -> u8 {
        match self {
            Self::TpmDiscrete | Self::SecureEnclave => 5,
            Self::TpmFirmware => 4,
            Self::SoftwareOnly => 1,
        }
    }
}

/// What a particular anchor can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorCapabilities {
    /// Keys and counters are held in dedicated hardware.
    pub hardware_backed: bool,
    /// A monotonic counter is available.
    pub monotonic_counter: bool,
    /// Data can be sealed to platform state.
    pub sealing: bool,
    /// Signed quotes can be produced.
    pub attestation: bool,
    /// The anchor clock cannot be rolled back by the host.
    pub secure_clock: bool,
    /// Platform configuration registers can be selected in policies.
    pub pcrs: bool,
}

/// Platform-state selection a seal or quote is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealPolicy {
    /// PCR indices (TPM) or equivalent platform-state slots.
    pub pcrs: Vec<u32>,
}

impl Default for SealPolicy {
    fn default() -> Self {
        // Firmware, firmware config and secure-boot state.
        Self {
            pcrs: vec![0, 1, 7],
        }
    }
}

impl SealPolicy {
    /// Create a policy over the given PCR indices.
    #[must_use]
    pub fn new(pcrs: impl Into<Vec<u32>>) -> Self {
        Self { pcrs: pcrs.into() }
    }

    /// Stable digest identifying this policy.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut t = Sha256Transcript::with_domain(b"keywitness-policy-v1")
            .put_u64(self.pcrs.len() as u64);
        for pcr in &self.pcrs {
            t = t.put_u64(u64::from(*pcr));
        }
        t.finish()
    }
}

/// Anchor clock state captured in a quote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockInfo {
    /// Milliseconds the anchor clock has been running.
    pub clock: u64,
    /// Number of anchor resets.
    pub reset_count: u32,
    /// Number of anchor restarts.
    pub restart_count: u32,
    /// Whether the clock is known not to have gone backwards.
    pub safe: bool,
}

/// A signed statement by a trust anchor over caller-supplied data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    /// Identity of the quoting device.
    #[serde(with = "crate::serde_hex")]
    pub device_id: Vec<u8>,
    /// Public key that verifies `signature`.
    #[serde(with = "crate::serde_hex")]
    pub public_key: Vec<u8>,
    /// Signature algorithm.
    pub algorithm: ClassicalAlgorithm,
    /// Anchor monotonic counter at quote time.
    pub monotonic_counter: u64,
    /// Anchor clock at quote time.
    pub clock_info: ClockInfo,
    /// The caller data that was quoted.
    #[serde(with = "crate::serde_hex")]
    pub data: Vec<u8>,
    /// Signature over [`Attestation::signed_digest`].
    #[serde(with = "crate::serde_hex")]
    pub signature: Vec<u8>,
    /// Platform-native quote structure, if the backend has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_quote: Option<String>,
    /// When the quote was produced.
    pub created_at: DateTime<Utc>,
}

impl Attestation {
    /// Digest the anchor signs.
    ///
    /// ```text
    /// SHA-256("keywitness-quote-v1" || len||data || counter
    ///         || clock || reset_count || restart_count || safe
    ///         || len||device_id)
    /// ```
    #[must_use]
    pub fn signed_digest(
        data: &[u8],
        monotonic_counter: u64,
        clock: &ClockInfo,
        device_id: &[u8],
    ) -> [u8; 32] {
        Sha256Transcript::with_domain(QUOTE_DOMAIN)
            .put_prefixed(data)
            .put_u64(monotonic_counter)
            .put_u64(clock.clock)
            .put_u64(u64::from(clock.reset_count))
            .put_u64(u64::from(clock.restart_count))
            .put_bool(clock.safe)
            .put_prefixed(device_id)
            .finish()
    }

    /// Verify the quote signature under the embedded public key.
    ///
    /// This proves the quote is internally consistent. Whether the public
    /// key belongs to a trusted device is the caller's decision.
    pub fn verify_signature(&self) -> Result<bool, AnchorError> {
        let digest = Self::signed_digest(
            &self.data,
            self.monotonic_counter,
            &self.clock_info,
            &self.device_id,
        );
        Ok(verify_classical(
            self.algorithm,
            &self.public_key,
            &digest,
            &self.signature,
        )?)
    }
}
