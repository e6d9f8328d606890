//! Ed25519 quote signatures.
//!
//! Used by the software trust anchor. Hardware anchors generally sign with
//! P-256 instead.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;

use crate::error::CryptoError;
use crate::signing::{ClassicalSigner, ClassicalVerifier};
use crate::types::ClassicalAlgorithm;

/// Ed25519 signer.
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Create a new signer with a random key.
    #[must_use]
    pub fn random() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create a signer from 32 seed bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the seed is not exactly 32 bytes.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        let seed: [u8; 32] = seed.try_into().map_err(|_| {
            CryptoError::invalid_key(format!("Ed25519 seed must be 32 bytes, got {}", seed.len()))
        })?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }
}

impl ClassicalSigner for Ed25519Signer {
    fn algorithm(&self) -> ClassicalAlgorithm {
        ClassicalAlgorithm::Ed25519
    }

    fn public_key(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self.signing_key.verifying_key().to_bytes().to_vec())
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.signing_key.sign(data).to_bytes().to_vec())
    }
}

/// Ed25519 verifier.
#[derive(Debug, Default)]
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    /// Create a new verifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ClassicalVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
        let pk: [u8; 32] = public_key.try_into().map_err(|_| {
            CryptoError::invalid_public_key(format!(
                "Ed25519 public key must be 32 bytes, got {}",
                public_key.len()
            ))
        })?;
        let vk = VerifyingKey::from_bytes(&pk)
            .map_err(|e| CryptoError::invalid_public_key(e.to_string()))?;

        let sig: [u8; 64] = signature.try_into().map_err(|_| {
            CryptoError::invalid_signature(format!(
                "Ed25519 signature must be 64 bytes, got {}",
                signature.len()
            ))
        })?;

        Ok(vk.verify(data, &Signature::from_bytes(&sig)).is_ok())
    }
}
