//! # keywitness-crypto
//!
//! Cryptographic primitives shared by the keywitness trust pipeline.
//!
//! - **Keyed integrity**: HMAC-SHA256 over fixed-order field transcripts,
//!   used by the integrity chain, sealed snapshots and evidence records.
//! - **Hash chaining**: SHA-256 transcripts with the same field encoding.
//! - **Quote signatures**: ECDSA P-256 (hardware-compatible) or Ed25519
//!   (software anchors).
//!
//! ## Field Encoding
//!
//! Every digest in keywitness is computed over a transcript of fields in a
//! fixed order. Integers are big-endian, variable-length byte strings are
//! length-prefixed:
//!
//! ```text
//! put_u64(n)        = n.to_be_bytes()
//! put_prefixed(b)   = u64_be(len(b)) || b
//! put_bytes(b)      = b            (fixed-width fields only)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod mac;
mod signing;
mod types;

#[cfg(feature = "ecdsa-p256")]
mod ecdsa;

#[cfg(feature = "ed25519")]
mod ed25519;

pub use error::CryptoError;
pub use mac::{hmac_sha256, sha256, MacTranscript, Sha256Transcript, Transcript, DIGEST_LEN};
pub use signing::{verify_classical, ClassicalSigner, ClassicalVerifier};
pub use types::ClassicalAlgorithm;

#[cfg(feature = "ecdsa-p256")]
pub use ecdsa::{P256Signer, P256Verifier};

#[cfg(feature = "ed25519")]
pub use ed25519::{Ed25519Signer, Ed25519Verifier};

/// Constant-time byte comparison.
///
/// Returns `true` if the slices are equal. Used for every MAC, hash and
/// sealed-key comparison in the pipeline.
///
/// The length check returns early; lengths compared here are public.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;

    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
