//! Software-only trust anchor.
//!
//! WARNING: This implementation provides NO hardware binding. A local
//! attacker with process access can read its keys and reset its counter by
//! restarting the process. It exists so the software-only path behaves
//! exactly like a hardware path from the caller's point of view, and every
//! record it produces is labelled [`HardwareType::SoftwareOnly`].
//!
//! - Quotes: Ed25519 over [`Attestation::signed_digest`].
//! - Counter: process-local, monotonic for the lifetime of the anchor.
//! - Sealing: XChaCha20-Poly1305 under a key derived from an anchor-held
//!   secret and the seal policy digest.

// Allow deprecated from_slice until chacha20poly1305 upgrades to generic-array 1.x
#![allow(deprecated)]

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use chrono::Utc;
use keywitness_crypto::{
    sha256, ClassicalSigner, Ed25519Signer, Sha256Transcript, Transcript,
};
use rand::RngCore;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::anchor::TrustAnchor;
use crate::error::AnchorError;
use crate::types::{AnchorCapabilities, Attestation, ClockInfo, HardwareType, SealPolicy};

/// Sealed blob format version.
const SEAL_VERSION: u8 = 1;
/// XChaCha20-Poly1305 nonce size (24 bytes)
const NONCE_SIZE: usize = 24;
/// version || policy digest || nonce
const SEAL_HEADER: usize = 1 + 32 + NONCE_SIZE;

/// Software trust anchor.
pub struct SoftwareAnchor {
    signer: Ed25519Signer,
    seal_secret: Zeroizing<[u8; 32]>,
    device_id: Vec<u8>,
    started: Instant,
    state: Mutex<SoftwareState>,
}

struct SoftwareState {
    open: bool,
    counter: u64,
}

impl SoftwareAnchor {
    /// Create a software anchor with fresh random keys.
    #[must_use]
    pub fn new() -> Self {
        let mut seal_secret = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(seal_secret.as_mut());

        let signer = Ed25519Signer::random();
        // Device id is derived from the quote key so it is stable per anchor.
        let device_id = match signer.public_key() {
            Ok(pk) => format!("sw-{}", hex::encode(&sha256(&pk)[..8])).into_bytes(),
            Err(_) => b"sw-unknown".to_vec(),
        };

        info!(
            device_id = %String::from_utf8_lossy(&device_id),
            "SoftwareAnchor: created (no hardware binding)"
        );

        Self {
            signer,
            seal_secret,
            device_id,
            started: Instant::now(),
            state: Mutex::new(SoftwareState {
                open: false,
                counter: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SoftwareState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), AnchorError> {
        if self.lock().open {
            Ok(())
        } else {
            Err(AnchorError::NotOpen)
        }
    }

    fn seal_key(&self, policy_digest: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(
            Sha256Transcript::with_domain(b"keywitness-sw-seal-v1")
                .put_bytes(self.seal_secret.as_ref())
                .put_bytes(policy_digest)
                .finish(),
        )
    }

    fn clock_info(&self) -> ClockInfo {
        ClockInfo {
            clock: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            reset_count: 0,
            restart_count: 0,
            // Host clock, not an isolated one.
            safe: false,
        }
    }
}

impl Default for SoftwareAnchor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrustAnchor for SoftwareAnchor {
    fn hardware_type(&self) -> HardwareType {
        HardwareType::SoftwareOnly
    }

    fn capabilities(&self) -> AnchorCapabilities {
        AnchorCapabilities {
            hardware_backed: false,
            monotonic_counter: true,
            sealing: true,
            attestation: true,
            secure_clock: false,
            pcrs: false,
        }
    }

    fn manufacturer(&self) -> String {
        "software".to_string()
    }

    fn firmware_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    async fn open(&self) -> Result<(), AnchorError> {
        let mut state = self.lock();
        if !state.open {
            state.open = true;
            warn!("SoftwareAnchor: opened. NO HARDWARE BINDING, evidence is software-attested only");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AnchorError> {
        self.lock().open = false;
        Ok(())
    }

    async fn device_id(&self) -> Result<Vec<u8>, AnchorError> {
        self.ensure_open()?;
        Ok(self.device_id.clone())
    }

    async fn get_counter(&self) -> Result<u64, AnchorError> {
        let state = self.lock();
        if !state.open {
            return Err(AnchorError::NotOpen);
        }
        Ok(state.counter)
    }

    async fn increment_counter(&self) -> Result<u64, AnchorError> {
        let mut state = self.lock();
        if !state.open {
            return Err(AnchorError::NotOpen);
        }
        state.counter = state
            .counter
            .checked_add(1)
            .ok_or_else(|| AnchorError::counter("counter exhausted"))?;
        Ok(state.counter)
    }

    async fn seal(&self, data: &[u8], policy: &SealPolicy) -> Result<Vec<u8>, AnchorError> {
        self.ensure_open()?;

        let policy_digest = policy.digest();
        let key = self.seal_key(&policy_digest);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let mut header = Vec::with_capacity(SEAL_HEADER);
        header.push(SEAL_VERSION);
        header.extend_from_slice(&policy_digest);
        header.extend_from_slice(&nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(key.as_ref())
            .map_err(|e| AnchorError::seal(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: data,
                    aad: &header,
                },
            )
            .map_err(|_| AnchorError::seal("encryption failed"))?;

        let mut blob = header;
        blob.extend_from_slice(&ciphertext);

        debug!(
            pcrs = ?policy.pcrs,
            plaintext_len = data.len(),
            blob_len = blob.len(),
            "SoftwareAnchor: sealed data"
        );
        Ok(blob)
    }

    async fn unseal(&self, blob: &[u8]) -> Result<Vec<u8>, AnchorError> {
        self.ensure_open()?;

        if blob.len() < SEAL_HEADER {
            return Err(AnchorError::unseal("blob too short"));
        }
        if blob[0] != SEAL_VERSION {
            return Err(AnchorError::unseal(format!(
                "unsupported blob version {}",
                blob[0]
            )));
        }

        let (header, ciphertext) = blob.split_at(SEAL_HEADER);
        let mut policy_digest = [0u8; 32];
        policy_digest.copy_from_slice(&header[1..33]);
        let nonce = XNonce::from_slice(&header[33..]);

        let key = self.seal_key(&policy_digest);
        let cipher = XChaCha20Poly1305::new_from_slice(key.as_ref())
            .map_err(|e| AnchorError::unseal(e.to_string()))?;

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| AnchorError::unseal("authentication failed"))
    }

    async fn quote(&self, data: &[u8], _policy: &SealPolicy) -> Result<Attestation, AnchorError> {
        let counter = self.get_counter().await?;
        let clock_info = self.clock_info();

        let digest = Attestation::signed_digest(data, counter, &clock_info, &self.device_id);
        let signature = self
            .signer
            .sign(&digest)
            .map_err(|e| AnchorError::quote(e.to_string()))?;

        Ok(Attestation {
            device_id: self.device_id.clone(),
            public_key: self.signer.public_key()?,
            algorithm: self.signer.algorithm(),
            monotonic_counter: counter,
            clock_info,
            data: data.to_vec(),
            signature,
            raw_quote: None,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn opened() -> SoftwareAnchor {
        let anchor = SoftwareAnchor::new();
        anchor.open().await.unwrap();
        anchor
    }

    #[tokio::test]
    async fn test_requires_open() {
        let anchor = SoftwareAnchor::new();
        assert!(matches!(anchor.device_id().await, Err(AnchorError::NotOpen)));
        assert!(matches!(
            anchor.increment_counter().await,
            Err(AnchorError::NotOpen)
        ));

        anchor.open().await.unwrap();
        anchor.close().await.unwrap();
        assert!(matches!(anchor.get_counter().await, Err(AnchorError::NotOpen)));
    }

    #[tokio::test]
    async fn test_counter_strictly_increases() {
        let anchor = opened().await;
        let start = anchor.get_counter().await.unwrap();
        let a = anchor.increment_counter().await.unwrap();
        let b = anchor.increment_counter().await.unwrap();
        assert_eq!(a, start + 1);
        assert_eq!(b, a + 1);
    }

    #[tokio::test]
    async fn test_device_id_stable() {
        let anchor = opened().await;
        let id = anchor.device_id().await.unwrap();
        assert!(id.starts_with(b"sw-"));
        assert_eq!(id, anchor.device_id().await.unwrap());
    }

    #[tokio::test]
    async fn test_seal_unseal_roundtrip() {
        let anchor = opened().await;
        let blob = anchor.seal(b"integrity key", &SealPolicy::default()).await.unwrap();
        assert_eq!(anchor.unseal(&blob).await.unwrap(), b"integrity key");
    }

    #[tokio::test]
    async fn test_unseal_rejects_altered_policy() {
        let anchor = opened().await;
        let mut blob = anchor.seal(b"secret", &SealPolicy::default()).await.unwrap();
        // Swap in a different policy digest.
        let other = SealPolicy::new([0u32]).digest();
        blob[1..33].copy_from_slice(&other);
        assert!(matches!(
            anchor.unseal(&blob).await,
            Err(AnchorError::UnsealFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_unseal_rejects_foreign_anchor() {
        let a = opened().await;
        let b = opened().await;
        let blob = a.seal(b"secret", &SealPolicy::default()).await.unwrap();
        assert!(b.unseal(&blob).await.is_err());
    }

    #[tokio::test]
    async fn test_quote_verifies_and_binds_counter() {
        let anchor = opened().await;
        anchor.increment_counter().await.unwrap();
        let quote = anchor.quote(b"digest", &SealPolicy::default()).await.unwrap();

        assert_eq!(quote.monotonic_counter, 1);
        assert!(quote.verify_signature().unwrap());

        let mut forged = quote.clone();
        forged.monotonic_counter = 0;
        assert!(!forged.verify_signature().unwrap());
    }

    #[test]
    fn test_reports_software_only() {
        let anchor = SoftwareAnchor::new();
        assert_eq!(anchor.hardware_type(), HardwareType::SoftwareOnly);
        assert!(!anchor.capabilities().hardware_backed);
    }
}
