use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Opaque, host-owned identifier (e.g. `/dev/mmcblk0` or
    /// `\\.\PhysicalDrive2`). The gateway is the only thing that interprets
    /// its shape.
    pub id: String,
    pub name: String,
    pub size: u64,
    pub device_type: DeviceType,
    pub mount_points: Vec<PathBuf>,
    pub is_removable: bool,
    pub is_system: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    SDCard,
    USB,
    HardDisk,
    SSD,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum PermissionLevel {
    ReadOnly,
    FullAccess,
}

/// Enumerates candidate devices for the CLI's device picker. Narrowed from
/// a general-purpose device manager to this tool's single concern: finding
/// SD-card-shaped removable media a migration or cleanup can target.
#[async_trait::async_trait]
pub trait DeviceManager: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<Device>, crate::SdToolError>;
    async fn get_device_by_id(&self, device_id: &str) -> Result<Option<Device>, crate::SdToolError>;
}
