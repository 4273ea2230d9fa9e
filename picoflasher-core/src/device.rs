use std::fmt;
use std::path::PathBuf;

/// A candidate write target discovered on the system.
///
/// This struct holds cross-platform information about a block device, such as
/// its system path, capacity, and mount point. It is populated by the
/// platform-specific discovery functions in the [`crate::platform`] module.
#[derive(Clone, Debug)]
pub struct TargetDevice {
    /// The system path to the device (e.g., `/dev/sdb` or `\\.\PhysicalDrive1`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sdb").
    pub name: String,
    /// The total capacity of the device in bytes.
    pub size_bytes: u64,
    /// Whether the kernel reports the device as removable.
    pub removable: bool,
    /// Vendor and model string read from the device, if available.
    pub label: String,
    /// The primary mount point of the device, if any.
    pub mount_point: String,
}

impl TargetDevice {
    /// The capacity of the device in gigabytes, for display purposes.
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for TargetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if !self.mount_point.is_empty() {
            format!("[Mounted at {}]", self.mount_point)
        } else {
            "[Not mounted]".to_string()
        };

        if self.label.is_empty() {
            write!(
                f,
                "{:<15} {:.1} GB {}",
                self.path.display(),
                self.size_gb(),
                mount_info
            )
        } else {
            write!(
                f,
                "{:<15} {:.1} GB {} {}",
                self.path.display(),
                self.size_gb(),
                self.label,
                mount_info
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_label_and_mount_state() {
        let device = TargetDevice {
            path: PathBuf::from("/dev/sdb"),
            name: "sdb".to_string(),
            size_bytes: 16 * 1024 * 1024 * 1024,
            removable: true,
            label: "SanDisk Cruzer".to_string(),
            mount_point: String::new(),
        };
        let rendered = device.to_string();
        assert!(rendered.contains("/dev/sdb"));
        assert!(rendered.contains("16.0 GB"));
        assert!(rendered.contains("SanDisk Cruzer"));
        assert!(rendered.contains("[Not mounted]"));
    }
}
