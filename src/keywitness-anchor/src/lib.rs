//! # keywitness-anchor
//!
//! Hardware trust anchors for the keywitness evidence pipeline.
//!
//! A trust anchor offers four capabilities that software alone cannot
//! fake: a stable device identity, a hardware monotonic counter, sealing of
//! secrets to platform state, and signed attestation quotes.
//!
//! ## Platform Support
//!
//! | Platform | Backend | Quote Algorithm | Counter |
//! |----------|---------|-----------------|---------|
//! | Linux | TPM 2.0 (`/dev/tpmrm0`) | ECDSA P-256 | NV counter |
//! | Windows | TPM 2.0 (TBS) | ECDSA P-256 | NV counter |
//! | macOS | Secure Enclave | ECDSA P-256 | (emulated) |
//! | Fallback | Software | Ed25519 | Process-local |
//!
//! Hardware backends implement [`TrustAnchor`] outside this crate. The
//! software anchor is always available and is reported as
//! [`HardwareType::SoftwareOnly`], so evidence produced with it is never
//! mistaken for hardware-backed evidence.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keywitness_anchor::{create_trust_anchor, SealPolicy};
//!
//! let anchor = create_trust_anchor(true).expect("software fallback allowed");
//! anchor.open().await?;
//! let counter = anchor.increment_counter().await?;
//! let quote = anchor.quote(b"digest", &SealPolicy::default()).await?;
//! assert!(quote.verify_signature()?);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

mod anchor;
mod error;
mod types;

#[cfg(feature = "software")]
mod software;

/// Platform detection and anchor factory.
pub mod platform;

/// Hex (de)serialization for byte fields.
pub mod serde_hex;

pub use anchor::TrustAnchor;
pub use error::AnchorError;
pub use types::{AnchorCapabilities, Attestation, ClockInfo, HardwareType, SealPolicy};

pub use platform::{create_trust_anchor, detect_hardware_type, PlatformCapabilities};

#[cfg(feature = "software")]
pub use software::SoftwareAnchor;

/// Check if a hardware trust anchor is present on this platform.
pub fn is_hardware_available() -> bool {
    detect_hardware_type().has_hardware
}
