//! The trust anchor capability trait.

use async_trait::async_trait;

use crate::error::AnchorError;
use crate::types::{AnchorCapabilities, Attestation, HardwareType, SealPolicy};

/// A source of hardware-rooted identity, counters, sealing and quotes.
///
/// ## Contract
///
/// - Every operation except the metadata accessors fails with
///   [`AnchorError::NotOpen`] before [`open`](Self::open) or after
///   [`close`](Self::close).
/// - [`increment_counter`](Self::increment_counter) is atomic in the
///   anchor and returns the new value. Callers treat a value that is not
///   strictly greater than the previous one as a rollback.
/// - [`unseal`](Self::unseal) only succeeds on the anchor that sealed the
///   blob, under the platform state named by the seal policy.
///
/// ## Implementations
///
/// - [`SoftwareAnchor`](crate::SoftwareAnchor) (feature: `software`)
/// - TPM 2.0 and Secure Enclave backends live with the platform integration.
#[async_trait]
pub trait TrustAnchor: Send + Sync {
    /// Kind of hardware behind this anchor.
    fn hardware_type(&self) -> HardwareType;

    /// What this anchor supports.
    fn capabilities(&self) -> AnchorCapabilities;

    /// Manufacturer identifier.
    fn manufacturer(&self) -> String;

    /// Firmware version string.
    fn firmware_version(&self) -> String;

    /// Open a session with the anchor.
    async fn open(&self) -> Result<(), AnchorError>;

    /// Close the session. Idempotent.
    async fn close(&self) -> Result<(), AnchorError>;

    /// Stable identity of the device.
    async fn device_id(&self) -> Result<Vec<u8>, AnchorError>;

    /// Read the monotonic counter.
    async fn get_counter(&self) -> Result<u64, AnchorError>;

    /// Atomically increment the monotonic counter and return the new value.
    async fn increment_counter(&self) -> Result<u64, AnchorError>;

    /// Seal `data` to the platform state selected by `policy`.
    async fn seal(&self, data: &[u8], policy: &SealPolicy) -> Result<Vec<u8>, AnchorError>;

    /// Recover data sealed by [`seal`](Self::seal).
    async fn unseal(&self, blob: &[u8]) -> Result<Vec<u8>, AnchorError>;

    /// Produce a signed quote over `data`.
    async fn quote(&self, data: &[u8], policy: &SealPolicy) -> Result<Attestation, AnchorError>;
}
