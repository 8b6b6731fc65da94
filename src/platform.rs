//! Platform detection and per-platform backend validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::BackendKind;
use crate::config::SourceConfig;

/// The deployment target the process is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// The headset/embedded board with the CSI sensor attached.
    Embedded,
    Desktop,
    Windows,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Embedded => "embedded",
            Platform::Desktop => "desktop",
            Platform::Windows => "windows",
        })
    }
}

/// Configured platform, `auto` meaning detect at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformOverride {
    #[default]
    Auto,
    Embedded,
    Desktop,
    Windows,
}

impl PlatformOverride {
    pub fn resolve(self) -> Platform {
        match self {
            PlatformOverride::Auto => Platform::detect(),
            PlatformOverride::Embedded => Platform::Embedded,
            PlatformOverride::Desktop => Platform::Desktop,
            PlatformOverride::Windows => Platform::Windows,
        }
    }
}

impl Platform {
    /// Detect the running platform. ARM Linux boards that identify as a
    /// Raspberry Pi through the device tree count as embedded.
    pub fn detect() -> Self {
        if cfg!(target_os = "windows") {
            return Platform::Windows;
        }
        if cfg!(all(target_os = "linux", any(target_arch = "arm", target_arch = "aarch64"))) {
            if let Ok(model) = std::fs::read_to_string("/proc/device-tree/model") {
                debug!(model = %model.trim_end_matches('\0'), "Device tree model");
                if model.contains("Raspberry Pi") {
                    return Platform::Embedded;
                }
            }
        }
        Platform::Desktop
    }

    /// Whether a backend variant can run here.
    pub fn allows(self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::CsiSensor => self == Platform::Embedded,
            BackendKind::UsbIndex => self != Platform::Embedded,
            BackendKind::DevicePath => self != Platform::Windows,
            BackendKind::Deactivated | BackendKind::NetworkUrl | BackendKind::StaticImage => true,
        }
    }

    /// The backend a source actually uses here, honouring the per-OS
    /// overrides. The Linux override only applies on the embedded board.
    pub fn used_poll(self, source: &SourceConfig) -> BackendKind {
        let over = match self {
            Platform::Embedded => source.linux_poll,
            Platform::Windows => source.windows_poll,
            Platform::Desktop => None,
        };
        over.unwrap_or(source.default_poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csi_only_on_embedded() {
        assert!(Platform::Embedded.allows(BackendKind::CsiSensor));
        assert!(!Platform::Desktop.allows(BackendKind::CsiSensor));
        assert!(!Platform::Windows.allows(BackendKind::CsiSensor));
    }

    #[test]
    fn usb_index_not_on_embedded() {
        assert!(!Platform::Embedded.allows(BackendKind::UsbIndex));
        assert!(Platform::Desktop.allows(BackendKind::UsbIndex));
        assert!(!Platform::Windows.allows(BackendKind::DevicePath));
    }

    #[test]
    fn overrides_pick_per_platform_poll() {
        let source = SourceConfig {
            default_poll: BackendKind::UsbIndex,
            linux_poll: Some(BackendKind::CsiSensor),
            windows_poll: Some(BackendKind::StaticImage),
            ..SourceConfig::default()
        };
        assert_eq!(Platform::Embedded.used_poll(&source), BackendKind::CsiSensor);
        assert_eq!(Platform::Windows.used_poll(&source), BackendKind::StaticImage);
        assert_eq!(Platform::Desktop.used_poll(&source), BackendKind::UsbIndex);
    }
}
