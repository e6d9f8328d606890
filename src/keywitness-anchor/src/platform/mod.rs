//! Platform detection for trust anchors.
//!
//! - Linux: TPM 2.0 via the kernel resource manager
//! - Windows: TPM 2.0 via TBS
//! - macOS: Secure Enclave (Apple Silicon / T2)
//! - Fallback: software anchor

mod factory;

pub use factory::{create_trust_anchor, detect_hardware_type, PlatformCapabilities};
