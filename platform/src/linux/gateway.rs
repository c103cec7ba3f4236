//! Linux `BlockDeviceGateway`: raw sector I/O against `/dev/mmcblkN` or
//! `/dev/sdX` via `std::fs::File`, with the same open-mode ladder and
//! retry policy the teacher's Windows I/O layer uses, adapted to the
//! Linux equivalents (`O_DIRECT`/`O_EXCL` instead of
//! `FILE_FLAG_NO_BUFFERING`/exclusive `CreateFile`).

use async_trait::async_trait;
use sdtool_core::{BlockDeviceGateway, OpenMode, SdToolError};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::process::Command;
use std::time::Duration;

const SECTOR_SIZE: u64 = 512;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct LinuxGateway;

impl LinuxGateway {
    fn open_for_mode(device: &str, mode: OpenMode) -> std::io::Result<std::fs::File> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        match mode {
            // O_EXCL on a block device refuses if another process already
            // holds it open; O_DIRECT bypasses the page cache the same way
            // FILE_FLAG_NO_BUFFERING does on Windows.
            OpenMode::ExclusiveUnbuffered => {
                options.custom_flags(libc::O_EXCL | libc::O_DIRECT | libc::O_SYNC);
            }
            OpenMode::SharedReadUnbuffered => {
                options.custom_flags(libc::O_DIRECT | libc::O_SYNC);
            }
            OpenMode::ExclusiveBuffered => {}
        }
        options.open(device)
    }

    /// Reads the sysfs `ro` attribute (`BLKROGET`'s sysfs equivalent, same
    /// pattern `size()` already uses for the `size` attribute).
    fn is_write_protected(device: &str) -> Result<bool, SdToolError> {
        let path = format!("/sys/class/block/{}/ro", device.trim_start_matches("/dev/"));
        let flag = std::fs::read_to_string(&path).map_err(SdToolError::Io)?;
        Ok(flag.trim() == "1")
    }

    fn unmount_all(device: &str) -> Result<(), SdToolError> {
        let output = Command::new("lsblk")
            .args(["-n", "-o", "MOUNTPOINT", device])
            .output()
            .map_err(|e| SdToolError::SubprocessFailure(format!("lsblk: {e}")))?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mount_point = line.trim();
            if mount_point.is_empty() {
                continue;
            }
            let status = Command::new("umount")
                .arg(mount_point)
                .status()
                .map_err(|e| SdToolError::SubprocessFailure(format!("umount: {e}")))?;
            if !status.success() {
                log::warn!("umount {mount_point} did not succeed, continuing");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlockDeviceGateway for LinuxGateway {
    async fn read(&self, device: &str, start_sector: u64, count: u64) -> Result<Vec<u8>, SdToolError> {
        let device = device.to_string();
        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::open(&device)?;
            file.seek(SeekFrom::Start(start_sector * SECTOR_SIZE))?;
            let mut buf = vec![0u8; (count * SECTOR_SIZE) as usize];
            file.read_exact(&mut buf)?;
            Ok(buf)
        })
        .await
        .map_err(|e| SdToolError::Other(format!("read task panicked: {e}")))?
    }

    async fn write(
        &self,
        device: &str,
        start_sector: u64,
        data: &[u8],
        skip_prepare: bool,
    ) -> Result<(), SdToolError> {
        if data.len() as u64 % SECTOR_SIZE != 0 {
            return Err(SdToolError::Other(
                "write data length must be a multiple of the sector size".to_string(),
            ));
        }

        let device = device.to_string();
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut last_err = None;
            for attempt in 0..MAX_RETRIES {
                if attempt == 0 && !skip_prepare {
                    Self::unmount_all(&device)?;
                } else if attempt == 1 {
                    log::warn!("retrying write to {device}, re-preparing device");
                    Self::unmount_all(&device)?;
                }

                let opened = OpenMode::LADDER
                    .iter()
                    .find_map(|mode| Self::open_for_mode(&device, *mode).ok().map(|f| (f, *mode)));

                let Some((mut file, mode)) = opened else {
                    last_err = Some(SdToolError::device_busy(&device));
                    std::thread::sleep(RETRY_DELAY);
                    continue;
                };

                let result = (|| -> std::io::Result<()> {
                    file.seek(SeekFrom::Start(start_sector * SECTOR_SIZE))?;
                    file.write_all(&data)?;
                    file.sync_all()?;
                    Ok(())
                })();

                match result {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        log::warn!("write attempt {} via {:?} failed: {e}", attempt + 1, mode);
                        last_err = Some(SdToolError::IoFailure {
                            stage: "write_sectors".to_string(),
                            offset: start_sector * SECTOR_SIZE,
                            source: e,
                        });
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| SdToolError::Other("write failed with no recorded error".to_string())))
        })
        .await
        .map_err(|e| SdToolError::Other(format!("write task panicked: {e}")))?
    }

    async fn clean(&self, device: &str) -> Result<(), SdToolError> {
        Self::unmount_all(device)?;
        let status = Command::new("wipefs")
            .args(["-a", device])
            .status()
            .map_err(|e| SdToolError::SubprocessFailure(format!("wipefs: {e}")))?;
        if !status.success() {
            return Err(SdToolError::SubprocessFailure(format!("wipefs {device} failed")));
        }
        Ok(())
    }

    async fn prepare(&self, device: &str) -> Result<(), SdToolError> {
        Self::unmount_all(device)?;
        if Self::is_write_protected(device)? {
            return Err(SdToolError::WriteProtected(device.to_string()));
        }
        Ok(())
    }

    async fn size(&self, device: &str) -> Result<u64, SdToolError> {
        let path = format!("/sys/class/block/{}/size", device.trim_start_matches("/dev/"));
        let sectors: u64 = tokio::fs::read_to_string(&path)
            .await
            .map_err(SdToolError::Io)?
            .trim()
            .parse()
            .map_err(|_| SdToolError::InvalidOnDisk(format!("non-numeric sector count in {path}")))?;
        Ok(sectors * SECTOR_SIZE)
    }
}
