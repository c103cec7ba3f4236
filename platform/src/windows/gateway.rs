//! Windows `BlockDeviceGateway`, ported from the teacher's `CreateFileW`
//! open-mode ladder (no-flags, then shared, then unbuffered+write-through)
//! and `IOCTL_DISK_GET_LENGTH_INFO` size query, rewritten against the
//! `windows` crate instead of raw `winapi` FFI.

use async_trait::async_trait;
use sdtool_core::{BlockDeviceGateway, SdToolError};
use std::time::Duration;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, GetLastError, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, SetFilePointerEx, WriteFile, FILE_BEGIN, FILE_FLAGS_AND_ATTRIBUTES, FILE_FLAG_NO_BUFFERING,
    FILE_FLAG_WRITE_THROUGH, FILE_GENERIC_READ, FILE_GENERIC_WRITE, FILE_SHARE_MODE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Ioctl::IOCTL_DISK_GET_LENGTH_INFO;
use windows::Win32::System::IO::DeviceIoControl;

const SECTOR_SIZE: u64 = 512;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

fn wide(path: &str) -> Vec<u16> {
    path.encode_utf16().chain(std::iter::once(0)).collect()
}

struct RawHandle(HANDLE);

impl Drop for RawHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Tries, in order: no sharing/no flags, shared read+write, then
/// unbuffered+write-through with sharing. Mirrors the teacher's three-step
/// `CreateFileW` ladder exactly.
fn open_device(path: &str) -> Result<RawHandle, SdToolError> {
    let wide_path = wide(path);
    let attempts: [(FILE_SHARE_MODE, FILE_FLAGS_AND_ATTRIBUTES); 3] = [
        (FILE_SHARE_MODE(0), FILE_FLAGS_AND_ATTRIBUTES(0)),
        (FILE_SHARE_READ | FILE_SHARE_WRITE, FILE_FLAGS_AND_ATTRIBUTES(0)),
        (FILE_SHARE_READ | FILE_SHARE_WRITE, FILE_FLAG_NO_BUFFERING | FILE_FLAG_WRITE_THROUGH),
    ];

    let mut last_error = None;
    for (share, flags) in attempts {
        let handle = unsafe {
            CreateFileW(
                PCWSTR(wide_path.as_ptr()),
                (FILE_GENERIC_READ | FILE_GENERIC_WRITE).0,
                share,
                None,
                OPEN_EXISTING,
                flags,
                None,
            )
        };
        match handle {
            Ok(h) if !h.is_invalid() => return Ok(RawHandle(h)),
            Ok(_) | Err(_) => {
                last_error = Some(unsafe { GetLastError() });
            }
        }
    }
    Err(SdToolError::device_busy(&format!(
        "{path} (last Win32 error: {:?})",
        last_error
    )))
}

fn device_size(handle: &RawHandle) -> Result<u64, SdToolError> {
    #[repr(C)]
    struct GetLengthInfo {
        length: i64,
    }
    let mut info = GetLengthInfo { length: 0 };
    let mut bytes_returned = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            handle.0,
            IOCTL_DISK_GET_LENGTH_INFO,
            None,
            0,
            Some(&mut info as *mut _ as *mut _),
            std::mem::size_of::<GetLengthInfo>() as u32,
            Some(&mut bytes_returned),
            None,
        )
    };
    if ok.is_err() {
        return Err(SdToolError::Other("IOCTL_DISK_GET_LENGTH_INFO failed".to_string()));
    }
    Ok(info.length as u64)
}

/// Queries `Get-Disk`'s `IsReadOnly` property, the PowerShell-visible form
/// of `IOCTL_DISK_IS_WRITABLE`'s result.
async fn is_write_protected(disk_number: &str) -> Result<bool, SdToolError> {
    let script = format!("(Get-Disk -Number {disk_number}).IsReadOnly");
    let output = tokio::process::Command::new("powershell.exe")
        .args(["-NoProfile", "-Command", &script])
        .output()
        .await
        .map_err(|e| SdToolError::SubprocessFailure(format!("Get-Disk: {e}")))?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().eq_ignore_ascii_case("true"))
}

fn seek_to(handle: &RawHandle, offset: u64) -> Result<(), SdToolError> {
    unsafe { SetFilePointerEx(handle.0, offset as i64, None, FILE_BEGIN) }
        .map_err(|e| SdToolError::Other(format!("SetFilePointerEx failed: {e}")))
}

pub struct WindowsGateway;

#[async_trait]
impl BlockDeviceGateway for WindowsGateway {
    async fn read(&self, device: &str, start_sector: u64, count: u64) -> Result<Vec<u8>, SdToolError> {
        let device = device.to_string();
        tokio::task::spawn_blocking(move || {
            let handle = open_device(&device)?;
            seek_to(&handle, start_sector * SECTOR_SIZE)?;
            let mut buf = vec![0u8; (count * SECTOR_SIZE) as usize];
            let mut read = 0u32;
            unsafe { ReadFile(handle.0, Some(&mut buf), Some(&mut read), None) }
                .map_err(|e| SdToolError::Other(format!("ReadFile failed: {e}")))?;
            buf.truncate(read as usize);
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
                    // Best-effort: volume locking/dismounting lives in
                    // `prepare`, called by the engine before batch writes.
                }
                let handle = match open_device(&device) {
                    Ok(h) => h,
                    Err(e) => {
                        last_err = Some(e);
                        std::thread::sleep(RETRY_DELAY);
                        continue;
                    }
                };
                let result = (|| -> Result<(), SdToolError> {
                    seek_to(&handle, start_sector * SECTOR_SIZE)?;
                    let mut written = 0u32;
                    unsafe { WriteFile(handle.0, Some(&data), Some(&mut written), None) }
                        .map_err(|e| SdToolError::Other(format!("WriteFile failed: {e}")))?;
                    if written as usize != data.len() {
                        return Err(SdToolError::Other("short write to device".to_string()));
                    }
                    Ok(())
                })();

                match result {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        log::warn!("write attempt {} failed: {e}", attempt + 1);
                        last_err = Some(e);
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
        let disk_number = device
            .rsplit("PhysicalDrive")
            .next()
            .ok_or_else(|| SdToolError::Other(format!("unrecognized device path: {device}")))?;
        let script = format!(
            "$d = Get-Disk -Number {disk_number}; $d | Set-Disk -IsReadOnly $false; Clear-Disk -Number {disk_number} -RemoveData -Confirm:$false"
        );
        let status = tokio::process::Command::new("powershell.exe")
            .args(["-NoProfile", "-Command", &script])
            .status()
            .await
            .map_err(|e| SdToolError::SubprocessFailure(format!("Clear-Disk: {e}")))?;
        if !status.success() {
            return Err(SdToolError::SubprocessFailure(format!("Clear-Disk on {device} failed")));
        }
        Ok(())
    }

    async fn prepare(&self, device: &str) -> Result<(), SdToolError> {
        let disk_number = device
            .rsplit("PhysicalDrive")
            .next()
            .ok_or_else(|| SdToolError::Other(format!("unrecognized device path: {device}")))?;
        let script = format!(
            "Get-Partition -DiskNumber {disk_number} | ForEach-Object {{ if ($_.DriveLetter) {{ Dismount-Volume -DriveLetter $_.DriveLetter -Confirm:$false }} }}"
        );
        let status = tokio::process::Command::new("powershell.exe")
            .args(["-NoProfile", "-Command", &script])
            .status()
            .await
            .map_err(|e| SdToolError::SubprocessFailure(format!("Dismount-Volume: {e}")))?;
        if !status.success() {
            log::warn!("dismounting volumes on {device} did not fully succeed, continuing");
        }

        if is_write_protected(disk_number).await? {
            return Err(SdToolError::WriteProtected(device.to_string()));
        }
        Ok(())
    }

    async fn size(&self, device: &str) -> Result<u64, SdToolError> {
        let device = device.to_string();
        tokio::task::spawn_blocking(move || {
            let handle = open_device(&device)?;
            device_size(&handle)
        })
        .await
        .map_err(|e| SdToolError::Other(format!("size task panicked: {e}")))?
    }
}
