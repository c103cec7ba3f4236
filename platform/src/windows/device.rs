//! Windows device enumeration via `Get-Disk`, ported from the teacher's
//! PowerShell/WMI approach. The WMI fallback and per-partition listing the
//! teacher carried are dropped: this tool only needs enough to pick a
//! target disk and confirm it is removable, not a full disk inventory.

use async_trait::async_trait;
use sdtool_core::{Device, DeviceManager, DeviceType, SdToolError};
use serde::Deserialize;
use std::process::Command;

#[derive(Debug, Deserialize)]
struct WindowsDisk {
    #[serde(rename = "Number")]
    number: u32,
    #[serde(rename = "FriendlyName")]
    friendly_name: Option<String>,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "BusType")]
    bus_type: Option<String>,
    #[serde(rename = "MediaType")]
    media_type: Option<String>,
    #[serde(rename = "IsSystem")]
    is_system: bool,
}

pub struct WindowsDeviceManager;

impl WindowsDeviceManager {
    fn get_device_type(bus_type: Option<&str>, media_type: Option<&str>) -> DeviceType {
        if let Some(bus) = bus_type {
            match bus.to_uppercase().as_str() {
                "SD" | "MMC" => return DeviceType::SDCard,
                "USB" => return DeviceType::USB,
                _ => {}
            }
        }
        if let Some(media) = media_type {
            let media_lower = media.to_lowercase();
            if media_lower.contains("removable") || media_lower.contains("external") {
                return DeviceType::USB;
            }
        }
        DeviceType::Unknown
    }

    fn is_removable(media_type: Option<&str>, bus_type: Option<&str>) -> bool {
        if let Some(media) = media_type {
            if media.to_lowercase().contains("removable") || media.to_lowercase().contains("external") {
                return true;
            }
        }
        matches!(bus_type.map(str::to_uppercase).as_deref(), Some("USB") | Some("SD") | Some("MMC"))
    }

    async fn get_disks_powershell() -> Result<Vec<WindowsDisk>, SdToolError> {
        let output = Command::new("powershell.exe")
            .args([
                "-NoProfile",
                "-Command",
                "Get-Disk | Select-Object Number, FriendlyName, Size, BusType, MediaType, IsSystem | ConvertTo-Json",
            ])
            .output()
            .map_err(|e| SdToolError::SubprocessFailure(format!("Get-Disk: {e}")))?;

        if !output.status.success() {
            return Err(SdToolError::SubprocessFailure("Get-Disk exited with a failure status".to_string()));
        }

        let json_str = String::from_utf8_lossy(&output.stdout);
        let trimmed = json_str.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        if trimmed.starts_with('[') {
            serde_json::from_str(trimmed).map_err(SdToolError::Json)
        } else {
            let disk: WindowsDisk = serde_json::from_str(trimmed).map_err(SdToolError::Json)?;
            Ok(vec![disk])
        }
    }
}

#[async_trait]
impl DeviceManager for WindowsDeviceManager {
    async fn enumerate_devices(&self) -> Result<Vec<Device>, SdToolError> {
        let disks = Self::get_disks_powershell().await?;
        let devices = disks
            .into_iter()
            .filter_map(|disk| {
                let device_type = Self::get_device_type(disk.bus_type.as_deref(), disk.media_type.as_deref());
                if device_type != DeviceType::SDCard && device_type != DeviceType::USB {
                    return None;
                }
                Some(Device {
                    id: format!("\\\\.\\PhysicalDrive{}", disk.number),
                    name: disk.friendly_name.unwrap_or_else(|| format!("Disk {}", disk.number)),
                    size: disk.size,
                    device_type,
                    mount_points: Vec::new(),
                    is_removable: Self::is_removable(disk.media_type.as_deref(), disk.bus_type.as_deref()),
                    is_system: disk.is_system,
                })
            })
            .collect();
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
    fn bus_type_sd_maps_to_sdcard() {
        assert_eq!(WindowsDeviceManager::get_device_type(Some("SD"), None), DeviceType::SDCard);
    }

    #[test]
    fn removable_media_type_detected() {
        assert!(WindowsDeviceManager::is_removable(Some("Removable Media"), None));
    }
}
