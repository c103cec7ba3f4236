//! Linux device enumeration via `lsblk`, narrowed from the teacher's
//! general-purpose disk picker to this tool's one concern: finding
//! SD-card-shaped removable media. Model/vendor strings and the
//! `Partition` sub-listing the teacher carried are dropped — the
//! partitioner crate owns partition discovery, not the device manager.

use async_trait::async_trait;
use sdtool_core::{Device, DeviceManager, DeviceType, SdToolError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

pub struct LinuxDeviceManager;

impl LinuxDeviceManager {
    fn is_removable(device_name: &str) -> bool {
        let path = format!("/sys/block/{device_name}/removable");
        std::fs::read_to_string(path)
            .map(|content| content.trim() == "1")
            .unwrap_or(false)
    }

    fn get_device_type(device_name: &str) -> DeviceType {
        if device_name.starts_with("mmcblk") {
            return DeviceType::SDCard;
        }
        if Self::is_removable(device_name) {
            return DeviceType::USB;
        }
        let rotational_path = format!("/sys/block/{device_name}/queue/rotational");
        let is_rotational = std::fs::read_to_string(rotational_path)
            .map(|content| content.trim() == "1")
            .unwrap_or(true);
        if is_rotational {
            DeviceType::HardDisk
        } else {
            DeviceType::SSD
        }
    }

    fn get_mount_points(device_path: &str) -> Vec<PathBuf> {
        let mut mount_points = Vec::new();
        if let Ok(mounts) = std::fs::read_to_string("/proc/mounts") {
            for line in mounts.lines() {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 2 && parts[0].starts_with(device_path) {
                    mount_points.push(PathBuf::from(parts[1]));
                }
            }
        }
        mount_points
    }

    fn is_system_disk(device_path: &str, mount_points: &[PathBuf]) -> bool {
        for mount in mount_points {
            let path_str = mount.to_string_lossy();
            if path_str == "/"
                || path_str == "/boot"
                || path_str == "/boot/efi"
                || path_str.starts_with("/sys")
                || path_str.starts_with("/proc")
            {
                return true;
            }
        }
        if let Ok(cmdline) = std::fs::read_to_string("/proc/cmdline") {
            if cmdline.contains(device_path) {
                return true;
            }
        }
        false
    }

    /// `lsblk -P` emits `KEY="value"` pairs per line; this is a small
    /// hand-rolled parser rather than a crate dependency since the format
    /// is simple and fixed by the `-o` column list we pass.
    fn parse_pairs(line: &str) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        let mut key = String::new();
        let mut value = String::new();
        let mut in_quotes = false;
        for ch in line.chars() {
            match ch {
                '"' => {
                    in_quotes = !in_quotes;
                    if !in_quotes && !key.is_empty() {
                        fields.insert(key.clone(), value.clone());
                        key.clear();
                        value.clear();
                    }
                }
                '=' if !in_quotes => {}
                ' ' if !in_quotes => {}
                _ if in_quotes => value.push(ch),
                _ => key.push(ch),
            }
        }
        fields
    }
}

#[async_trait]
impl DeviceManager for LinuxDeviceManager {
    async fn enumerate_devices(&self) -> Result<Vec<Device>, SdToolError> {
        let output = Command::new("lsblk")
            .args(["-b", "-P", "-o", "NAME,SIZE,TYPE,RM"])
            .output()
            .map_err(|e| SdToolError::SubprocessFailure(format!("lsblk: {e}")))?;

        if !output.status.success() {
            return Err(SdToolError::SubprocessFailure("lsblk exited with a failure status".to_string()));
        }

        let output_str = String::from_utf8_lossy(&output.stdout);
        let mut devices = Vec::new();

        for line in output_str.lines() {
            let fields = Self::parse_pairs(line);
            if fields.get("TYPE").map(String::as_str) != Some("disk") {
                continue;
            }
            let name = match fields.get("NAME") {
                Some(n) if !n.is_empty() => n.clone(),
                _ => continue,
            };
            let device_path = format!("/dev/{name}");
            let size = fields.get("SIZE").and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
            let mount_points = Self::get_mount_points(&device_path);
            let is_system = Self::is_system_disk(&device_path, &mount_points);
            let is_removable = fields
                .get("RM")
                .map(|rm| rm == "1")
                .unwrap_or_else(|| Self::is_removable(&name));
            let device_type = Self::get_device_type(&name);

            // Out of scope for everything but SD cards and USB sticks: the
            // migration/cleanup flows assume removable media end to end.
            if device_type != DeviceType::SDCard && device_type != DeviceType::USB {
                continue;
            }

            devices.push(Device {
                id: device_path,
                name,
                size,
                device_type,
                mount_points,
                is_removable,
                is_system,
            });
        }

        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    async fn get_device_by_id(&self, device_id: &str) -> Result<Option<Device>, SdToolError> {
        Ok(self
            .enumerate_devices()
            .await?
            .into_iter()
            .find(|d| d.id == device_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pairs_reads_quoted_lsblk_fields() {
        let fields = LinuxDeviceManager::parse_pairs(r#"NAME="mmcblk0" SIZE="63864569856" TYPE="disk" RM="1""#);
        assert_eq!(fields.get("NAME").unwrap(), "mmcblk0");
        assert_eq!(fields.get("TYPE").unwrap(), "disk");
        assert_eq!(fields.get("RM").unwrap(), "1");
    }

    #[test]
    fn system_disk_detects_root_mount() {
        let mounts = vec![PathBuf::from("/")];
        assert!(LinuxDeviceManager::is_system_disk("/dev/sda1", &mounts));
    }

    #[test]
    fn sd_card_detected_from_mmcblk_prefix() {
        assert_eq!(LinuxDeviceManager::get_device_type("mmcblk0"), DeviceType::SDCard);
    }
}
