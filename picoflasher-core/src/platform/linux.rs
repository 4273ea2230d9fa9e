use crate::device::TargetDevice;
use anyhow::{Result, anyhow};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::{debug, warn};

/// Helper to read a file from the /sys/block tree for a device.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// Handles the `sdX`, `mmcblkNpM` and `nvmeXnYpZ` naming schemes.
fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.find('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// Vendor/model string for a device, read from sysfs. Empty when the kernel
/// exposes neither attribute.
fn device_label(device_name: &str) -> String {
    let vendor = read_sys_file(device_name, "device/vendor").unwrap_or_default();
    let model = read_sys_file(device_name, "device/model").unwrap_or_default();
    format!("{vendor} {model}").trim().to_string()
}

/// The block device backing the running system's root filesystem.
///
/// This is the device every write session refuses to touch. Partition paths
/// are resolved to their parent (e.g., `/dev/nvme0n1p2` -> `/dev/nvme0n1`),
/// so the whole boot disk is off-limits, not just the root partition.
pub fn system_boot_device() -> Result<PathBuf> {
    let disks = Disks::new_with_refreshed_list();
    for disk in disks.iter() {
        if disk.mount_point() == Path::new("/") {
            let path = PathBuf::from("/dev/").join(disk.name());
            return Ok(parent_device_path(&path));
        }
    }
    Err(anyhow!("could not determine the system boot device"))
}

/// Scans for all removable block devices on a Linux system.
///
/// Discovery walks the `/sys/block` directory and filters down to devices
/// that are safe candidates for flashing:
/// 1.  The system boot disk is excluded (see [`system_boot_device`]).
/// 2.  Loop devices (e.g., `loop0`) are skipped.
/// 3.  The `/sys/block/<device>/removable` flag must be set; it is the most
///     reliable indicator of a USB drive or SD card.
/// 4.  Devices reporting a size of zero are skipped, which filters out empty
///     card readers.
///
/// # Returns
///
/// A `Result<Vec<TargetDevice>>` listing the discovered devices, or an error
/// if the boot device cannot be determined or `/sys/block` cannot be read.
pub fn get_removable_devices() -> Result<Vec<TargetDevice>> {
    let boot_device = system_boot_device()?;
    let disks = Disks::new_with_refreshed_list();

    let mut devices = Vec::new();
    let block_dir = fs::read_dir("/sys/block")?;

    for entry in block_dir.filter_map(Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        if device_name.starts_with("loop") || device_path == boot_device {
            continue;
        }

        let is_removable = read_sys_file(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);

        if !is_removable {
            continue;
        }

        let size_sectors = read_sys_file(&device_name, "size")
            .and_then(|s| {
                s.parse::<u64>()
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
            })
            .unwrap_or(0);

        if size_sectors == 0 {
            continue;
        }

        // Try to find a mount point by checking the `sysinfo` list. Disk
        // names there are full paths like /dev/sdb1, so compare basenames.
        let mut mount_point = "".to_string();
        for disk in disks.iter() {
            let is_partition_of_device = Path::new(disk.name())
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(&device_name));
            if is_partition_of_device {
                let mp = disk.mount_point().to_string_lossy().to_string();
                if !mp.is_empty() {
                    mount_point = mp;
                    break;
                }
            }
        }

        devices.push(TargetDevice {
            path: device_path,
            name: device_name.clone(),
            size_bytes: size_sectors * 512,
            removable: true,
            label: device_label(&device_name),
            mount_point,
        });
    }

    Ok(devices)
}

/// Unmounts every mounted partition of `device` before a raw write.
///
/// Best-effort: failures are logged and skipped. The session's exclusive
/// open of the device is the actual gate; an unmount that needs privileges
/// we do not have will surface there instead.
pub fn unmount_device(device: &Path) {
    let Some(device_name) = device.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return;
    };

    let disks = Disks::new_with_refreshed_list();
    for disk in disks.iter() {
        let partition = Path::new(disk.name());
        let matches_device = partition
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with(&device_name));
        if !matches_device {
            continue;
        }

        let mount_point = disk.mount_point();
        if mount_point.as_os_str().is_empty() {
            continue;
        }

        debug!(
            partition = %partition.display(),
            mount_point = %mount_point.display(),
            "unmounting partition before write"
        );
        if let Err(err) = nix::mount::umount(mount_point) {
            warn!(
                mount_point = %mount_point.display(),
                error = %err,
                "could not unmount partition, continuing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_resolve_to_their_parent_disk() {
        assert_eq!(
            parent_device_path(Path::new("/dev/sda1")),
            PathBuf::from("/dev/sda")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/sdb")),
            PathBuf::from("/dev/sdb")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/mmcblk0p2")),
            PathBuf::from("/dev/mmcblk0")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/nvme0n1p3")),
            PathBuf::from("/dev/nvme0n1")
        );
    }

    #[test]
    fn unknown_device_names_pass_through() {
        assert_eq!(
            parent_device_path(Path::new("/dev/md0")),
            PathBuf::from("/dev/md0")
        );
    }
}
