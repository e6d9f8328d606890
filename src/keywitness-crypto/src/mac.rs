//! Keyed and unkeyed field transcripts.
//!
//! A transcript absorbs typed fields in a fixed order and produces a 32-byte
//! output. [`Sha256Transcript`] feeds hash chains, [`MacTranscript`] feeds
//! every MAC and evidence signature. Both encode fields identically, so a
//! digest and a MAC over the same fields differ only by the key.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Output length of SHA-256 and HMAC-SHA256.
pub const DIGEST_LEN: usize = 32;

/// Fixed-order field encoder.
pub trait Transcript: Sized {
    /// Absorb raw bytes.
    fn absorb(&mut self, bytes: &[u8]);

    /// Produce the 32-byte output.
    fn finish(self) -> [u8; DIGEST_LEN];

    /// Append a single byte.
    #[must_use]
    fn put_u8(mut self, v: u8) -> Self {
        self.absorb(&[v]);
        self
    }

    /// Append a boolean as one byte (0 or 1).
    #[must_use]
    fn put_bool(self, v: bool) -> Self {
        self.put_u8(u8::from(v))
    }

    /// Append a big-endian u64.
    #[must_use]
    fn put_u64(mut self, v: u64) -> Self {
        self.absorb(&v.to_be_bytes());
        self
    }

    /// Append a big-endian i64.
    #[must_use]
    fn put_i64(mut self, v: i64) -> Self {
        self.absorb(&v.to_be_bytes());
        self
    }

    /// Append fixed-width bytes with no length prefix.
    #[must_use]
    fn put_bytes(mut self, b: &[u8]) -> Self {
        self.absorb(b);
        self
    }

    /// Append variable-length bytes with a u64 length prefix.
    #[must_use]
    fn put_prefixed(self, b: &[u8]) -> Self {
        self.put_u64(b.len() as u64).put_bytes(b)
    }
}

/// SHA-256 transcript.
#[derive(Clone, Default)]
pub struct Sha256Transcript(Sha256);

impl Sha256Transcript {
    /// Start an empty transcript.
    #[must_use]
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    /// Start a transcript with a domain-separation label.
    #[must_use]
    pub fn with_domain(domain: &[u8]) -> Self {
        Self::new().put_bytes(domain)
    }
}

impl Transcript for Sha256Transcript {
    fn absorb(&mut self, bytes: &[u8]) {
        Digest::update(&mut self.0, bytes);
    }

    fn finish(self) -> [u8; DIGEST_LEN] {
        self.0.finalize().into()
    }
}

/// HMAC-SHA256 transcript.
#[derive(Clone)]
pub struct MacTranscript(HmacSha256);

impl MacTranscript {
    /// Start a transcript keyed with `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the key is empty.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.is_empty() {
            return Err(CryptoError::invalid_key("MAC key must not be empty"));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| CryptoError::invalid_key(e.to_string()))?;
        Ok(Self(mac))
    }

    /// Finish and compare against `expected` in constant time.
    #[must_use]
    pub fn verify(self, expected: &[u8]) -> bool {
        self.0.verify_slice(expected).is_ok()
    }
}

impl Transcript for MacTranscript {
    fn absorb(&mut self, bytes: &[u8]) {
        Mac::update(&mut self.0, bytes);
    }

    fn finish(self) -> [u8; DIGEST_LEN] {
        self.0.finalize().into_bytes().into()
    }
}

/// One-shot SHA-256.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(data).into()
}

/// One-shot HMAC-SHA256.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] if the key is empty.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; DIGEST_LEN], CryptoError> {
    Ok(MacTranscript::new(key)?.put_bytes(data).finish())
}
