//! ECDSA P-256 quote signatures.
//!
//! P-256 is the curve TPM attestation keys and the Secure Enclave expose, so
//! hardware anchor quotes verify through this module.

use p256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use p256::elliptic_curve::rand_core::OsRng;

use crate::error::CryptoError;
use crate::signing::{ClassicalSigner, ClassicalVerifier};
use crate::types::ClassicalAlgorithm;

/// ECDSA P-256 signer.
pub struct P256Signer {
    signing_key: SigningKey,
}

impl P256Signer {
    /// Create a new signer with a random key.
    #[must_use]
    pub fn random() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Create a signer from a 32-byte scalar.
    ///
    /// # Errors
    ///
    /// Returns error if the key bytes are invalid.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| CryptoError::invalid_key(e.to_string()))?;
        Ok(Self { signing_key })
    }
}

impl ClassicalSigner for P256Signer {
    fn algorithm(&self) -> ClassicalAlgorithm {
        ClassicalAlgorithm::EcdsaP256
    }

    fn public_key(&self) -> Result<Vec<u8>, CryptoError> {
        // Uncompressed SEC1, as TPM2_Quote verifiers expect.
        let encoded = self.signing_key.verifying_key().to_encoded_point(false);
        Ok(encoded.as_bytes().to_vec())
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature: Signature = self
            .signing_key
            .try_sign(data)
            .map_err(|e| CryptoError::signing_failed(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}

/// ECDSA P-256 verifier.
#[derive(Debug, Default)]
pub struct P256Verifier;

impl P256Verifier {
    /// Create a new verifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ClassicalVerifier for P256Verifier {
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
        let vk = VerifyingKey::from_sec1_bytes(public_key)
            .map_err(|e| CryptoError::invalid_public_key(e.to_string()))?;
        let sig = Signature::from_slice(signature)
            .map_err(|e| CryptoError::invalid_signature(e.to_string()))?;

        Ok(vk.verify(data, &sig).is_ok())
    }
}
