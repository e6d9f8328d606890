//! Runtime capability detection and anchor selection.
//!
//! Detection only reports what the platform offers. Concrete hardware
//! anchors are supplied by the platform integration; when none is wired in,
//! selection falls back to the software anchor if the caller allows it.

use std::sync::Arc;

use crate::anchor::TrustAnchor;
use crate::types::HardwareType;

/// Platform capabilities detected at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// Best available hardware type
    pub hardware_type: HardwareType,
    /// Whether a hardware anchor device was found
    pub has_hardware: bool,
    /// Whether signed quotes are available
    pub supports_attestation: bool,
    /// Whether sealing to platform state is available
    pub supports_sealing: bool,
    /// Device node or service the detection found
    pub device_path: Option<String>,
}

impl PlatformCapabilities {
    fn software_only() -> Self {
        Self {
            hardware_type: HardwareType::SoftwareOnly,
            has_hardware: false,
            supports_attestation: false,
            supports_sealing: false,
            device_path: None,
        }
    }
}

/// Detect trust anchor capabilities of the current platform.
pub fn detect_hardware_type() -> PlatformCapabilities {
    #[cfg(target_os = "linux")]
    {
        detect_linux_capabilities()
    }

    #[cfg(target_os = "windows")]
    {
        detect_windows_capabilities()
    }

    #[cfg(target_os = "macos")]
    {
        detect_macos_capabilities()
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        PlatformCapabilities::software_only()
    }
}

#[cfg(target_os = "linux")]
fn detect_linux_capabilities() -> PlatformCapabilities {
    use std::path::Path;

    // Prefer the resource manager so concurrent users do not collide.
    let device = ["/dev/tpmrm0", "/dev/tpm0"]
        .into_iter()
        .find(|p| Path::new(p).exists());

    match device {
        Some(path) => PlatformCapabilities {
            // Assume fTPM; discrete chips are identified once opened.
            hardware_type: HardwareType::TpmFirmware,
            has_hardware: true,
            supports_attestation: true,
            supports_sealing: true,
            device_path: Some(path.to_string()),
        },
        None => PlatformCapabilities::software_only(),
    }
}

#[cfg(target_os = "windows")]
fn detect_windows_capabilities() -> PlatformCapabilities {
    // TBS is present on every supported Windows; whether a TPM answers is
    // only known once a backend opens it.
    PlatformCapabilities {
        hardware_type: HardwareType::TpmFirmware,
        has_hardware: true,
        supports_attestation: true,
        supports_sealing: true,
        device_path: Some("tbs".to_string()),
    }
}

#[cfg(target_os = "macos")]
fn detect_macos_capabilities() -> PlatformCapabilities {
    PlatformCapabilities {
        hardware_type: HardwareType::SecureEnclave,
        has_hardware: true,
        supports_attestation: true,
        supports_sealing: true,
        device_path: None,
    }
}

/// Select a trust anchor for a new session.
///
/// Returns `None` when no anchor can be used, in which case the session runs
/// in software-only mode without any anchor at all.
pub fn create_trust_anchor(allow_software: bool) -> Option<Arc<dyn TrustAnchor>> {
    let capabilities = detect_hardware_type();

    tracing::info!(
        hardware_type = ?capabilities.hardware_type,
        has_hardware = capabilities.has_hardware,
        device = ?capabilities.device_path,
        allow_software,
        "create_trust_anchor: detected capabilities"
    );

    if capabilities.has_hardware {
        tracing::warn!(
            hardware_type = ?capabilities.hardware_type,
            "create_trust_anchor: hardware present but no hardware backend is linked into this build"
        );
    }

    software_fallback(allow_software)
}

#[cfg(feature = "software")]
fn software_fallback(allow_software: bool) -> Option<Arc<dyn TrustAnchor>> {
    if !allow_software {
        tracing::warn!("create_trust_anchor: software anchor disallowed, running without anchor");
        return None;
    }
    tracing::info!("Using software trust anchor (no hardware binding)");
    Some(Arc::new(crate::software::SoftwareAnchor::new()))
}

#[cfg(not(feature = "software"))]
fn software_fallback(_allow_software: bool) -> Option<Arc<dyn TrustAnchor>> {
    tracing::warn!("create_trust_anchor: no anchor available in this build");
    None
}
