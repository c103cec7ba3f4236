//! A `BlockDeviceGateway`/`DeviceManager` pair backed by an ordinary file
//! instead of a real block device. This is what the scanner/planner/writer/
//! engine integration tests drive against — a sparse file stands in for an
//! SD card, so the round-trip and scenario tests in the partitioner and
//! engine crates never need real hardware or elevated privileges.

use async_trait::async_trait;
use sdtool_core::{BlockDeviceGateway, Device, DeviceManager, DeviceType, SdToolError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

pub struct LoopbackGateway {
    /// Device id -> backing file path. Device ids are just file paths for
    /// this implementation; `clean`/`prepare` are no-ops since there is no
    /// host volume manager to fight with.
    root: PathBuf,
}

impl LoopbackGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, device: &str) -> PathBuf {
        if PathBuf::from(device).is_absolute() {
            PathBuf::from(device)
        } else {
            self.root.join(device)
        }
    }
}

#[async_trait]
impl BlockDeviceGateway for LoopbackGateway {
    async fn read(&self, device: &str, start_sector: u64, count: u64) -> Result<Vec<u8>, SdToolError> {
        let path = self.path_for(device);
        let mut file = std::fs::File::open(&path)?;
        let offset = start_sector * sdtool_core::SECTOR_SIZE;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; (count * sdtool_core::SECTOR_SIZE) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    async fn write(
        &self,
        device: &str,
        start_sector: u64,
        data: &[u8],
        _skip_prepare: bool,
    ) -> Result<(), SdToolError> {
        if data.len() as u64 % sdtool_core::SECTOR_SIZE != 0 {
            return Err(SdToolError::Other(
                "write data length must be a multiple of the sector size".to_string(),
            ));
        }
        let path = self.path_for(device);
        let mut file = std::fs::OpenOptions::new().write(true).open(&path)?;
        let offset = start_sector * sdtool_core::SECTOR_SIZE;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    async fn clean(&self, _device: &str) -> Result<(), SdToolError> {
        Ok(())
    }

    async fn prepare(&self, _device: &str) -> Result<(), SdToolError> {
        Ok(())
    }

    async fn size(&self, device: &str) -> Result<u64, SdToolError> {
        let path = self.path_for(device);
        Ok(std::fs::metadata(&path)?.len())
    }
}

/// Creates (or truncates) a sparse file of `size_bytes` at `path`, the
/// fixture helper the scanner/writer/engine tests use to stand up a fake
/// disk before writing synthetic MBR/GPT bytes into it.
pub fn create_sparse_image(path: &std::path::Path, size_bytes: u64) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    file.set_len(size_bytes)?;
    Ok(())
}

pub struct LoopbackDeviceManager {
    devices: Mutex<Vec<Device>>,
}

impl LoopbackDeviceManager {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(devices),
        }
    }

    pub fn single(path: PathBuf, size: u64) -> Self {
        let id = path.to_string_lossy().to_string();
        Self::new(vec![Device {
            id,
            name: "loopback".to_string(),
            size,
            device_type: DeviceType::SDCard,
            mount_points: Vec::new(),
            is_removable: true,
            is_system: false,
        }])
    }
}

#[async_trait]
impl DeviceManager for LoopbackDeviceManager {
    async fn enumerate_devices(&self) -> Result<Vec<Device>, SdToolError> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn get_device_by_id(&self, device_id: &str) -> Result<Option<Device>, SdToolError> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id == device_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("card.img");
        create_sparse_image(&image, 1024 * 1024).unwrap();

        let gateway = LoopbackGateway::new(dir.path());
        let data = vec![0xAB; 512 * 4];
        gateway
            .write(image.to_str().unwrap(), 10, &data, false)
            .await
            .unwrap();

        let read_back = gateway.read(image.to_str().unwrap(), 10, 4).await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn write_rejects_non_sector_aligned_data() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("card.img");
        create_sparse_image(&image, 1024 * 1024).unwrap();

        let gateway = LoopbackGateway::new(dir.path());
        let result = gateway.write(image.to_str().unwrap(), 0, &[0u8; 511], false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn device_manager_finds_registered_device() {
        let manager = LoopbackDeviceManager::single(PathBuf::from("/tmp/card.img"), 64 * 1024 * 1024 * 1024);
        let devices = manager.enumerate_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        let found = manager.get_device_by_id("/tmp/card.img").await.unwrap();
        assert!(found.is_some());
    }
}
