//! Algorithm identifiers.

use serde::{Deserialize, Serialize};

/// Signature algorithm used by a trust anchor for attestation quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ClassicalAlgorithm {
    /// ECDSA with NIST P-256 (secp256r1).
    /// What TPM 2.0 attestation keys and the Secure Enclave produce.
    EcdsaP256 = 1,

    /// Ed25519 Edwards curve.
    /// Used by the software anchor.
    Ed25519 = 2,
}

impl ClassicalAlgorithm {
    /// Short display name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::EcdsaP256 => "ecdsa-p256",
            Self::Ed25519 => "ed25519",
        }
    }

    /// Expected signature length in bytes.
    #[must_use]
    pub const fn signature_len(&self) -> usize {
        64
    }
}

impl std::fmt::Display for ClassicalAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
