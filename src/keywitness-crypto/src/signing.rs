//! Signer and verifier traits for attestation quotes.

use crate::error::CryptoError;
use crate::types::ClassicalAlgorithm;

/// Produces signatures with a held private key.
pub trait ClassicalSigner: Send + Sync {
    /// Get the algorithm used by this signer.
    fn algorithm(&self) -> ClassicalAlgorithm;

    /// Get the encoded public key.
    fn public_key(&self) -> Result<Vec<u8>, CryptoError>;

    /// Sign data and return the signature.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Verifies signatures against an encoded public key.
pub trait ClassicalVerifier {
    /// Verify a signature. `Ok(false)` means well-formed inputs that do not verify.
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8])
        -> Result<bool, CryptoError>;
}

/// Verify `signature` over `data` with the verifier for `algorithm`.
///
/// # Errors
///
/// Returns an error for malformed keys or signatures, or when the
/// algorithm's feature is not compiled in.
pub fn verify_classical(
    algorithm: ClassicalAlgorithm,
    public_key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    match algorithm {
        #[cfg(feature = "ecdsa-p256")]
        ClassicalAlgorithm::EcdsaP256 => {
            crate::ecdsa::P256Verifier::new().verify(public_key, data, signature)
        },
        #[cfg(feature = "ed25519")]
        ClassicalAlgorithm::Ed25519 => {
            crate::ed25519::Ed25519Verifier::new().verify(public_key, data, signature)
        },
        #[allow(unreachable_patterns)]
        other => {
            let _ = (public_key, data, signature);
            Err(CryptoError::UnsupportedAlgorithm { algorithm: other })
        },
    }
}
