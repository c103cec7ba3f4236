//! Thin trait wrappers around the three subprocess contracts this tool
//! treats as external collaborators (spec §6): partition-table refresh,
//! FAT32 formatting, and recursive tree copy. The engine never shells out
//! directly — it holds a `&dyn Trait`, the same narrow-trait-plus-
//! swappable-implementation shape the teacher uses for its safety checks,
//! so tests can supply a fake instead of invoking real tools.

use async_trait::async_trait;
use sdtool_core::SdToolError;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const FORMATTER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const FILE_COPY_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Requests the host re-read a device's partition table, and optionally
/// assigns a mount point to a partition by its 1-based index. Must be
/// idempotent: the engine calls this after every table write.
#[async_trait]
pub trait TableRefresher: Send + Sync {
    async fn refresh(&self, device: &str) -> Result<(), SdToolError>;
    async fn assign_mount_point(&self, device: &str, partition_number: u32) -> Result<String, SdToolError>;
}

/// Formats a mounted drive as FAT32 with a given cluster size, expressed
/// in sectors (the engine always passes 128, i.e. 64 KiB clusters).
#[async_trait]
pub trait Fat32Formatter: Send + Sync {
    async fn format(&self, mount_point: &str, cluster_size_sectors: u32) -> Result<(), SdToolError>;
}

/// Timestamp-preserving copy of a single file from `source` to
/// `destination`. One call per file rather than one call for the whole
/// tree so the caller (`fat32_copy::copy_fat32_tree`) can report progress
/// as files land instead of only before and after an opaque bulk copy.
#[async_trait]
pub trait TreeCopier: Send + Sync {
    async fn copy_file(&self, source: &Path, destination: &Path) -> Result<(), SdToolError>;
}

async fn run_with_timeout(mut command: Command, limit: Duration) -> Result<std::process::ExitStatus, SdToolError> {
    let child = command.spawn().map_err(|e| SdToolError::SubprocessFailure(e.to_string()))?;
    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output.status),
        Ok(Err(e)) => Err(SdToolError::SubprocessFailure(e.to_string())),
        Err(_) => Err(SdToolError::SubprocessFailure(format!(
            "subprocess exceeded its {:?} timeout and was abandoned",
            limit
        ))),
    }
}

/// Default `TableRefresher` backed by platform partitioning utilities
/// (`partprobe` on Linux, `Update-Disk`/`Get-Partition` via PowerShell on
/// Windows). Callers on an unsupported OS should supply a fake.
pub struct CommandTableRefresher;

#[async_trait]
impl TableRefresher for CommandTableRefresher {
    async fn refresh(&self, device: &str) -> Result<(), SdToolError> {
        let command = platform_refresh_command(device);
        let status = run_with_timeout(command, Duration::from_secs(30)).await?;
        if !status.success() {
            return Err(SdToolError::SubprocessFailure(format!(
                "partition-table refresh for {device} exited with {status}"
            )));
        }
        Ok(())
    }

    async fn assign_mount_point(&self, device: &str, partition_number: u32) -> Result<String, SdToolError> {
        // Retried by the caller (engine migration stage) per the
        // drive-letter-assignment policy (5x, 2s); this call is a single
        // attempt.
        platform_assign_mount_point(device, partition_number).await
    }
}

#[cfg(target_os = "linux")]
fn platform_refresh_command(device: &str) -> Command {
    let mut command = Command::new("partprobe");
    command.arg(device);
    command
}

#[cfg(target_os = "windows")]
fn platform_refresh_command(device: &str) -> Command {
    let disk_number = device.rsplit("PhysicalDrive").next().unwrap_or_default();
    let mut command = Command::new("powershell.exe");
    command.args(["-NoProfile", "-Command", &format!("Update-Disk -Number {disk_number}")]);
    command
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn platform_refresh_command(_device: &str) -> Command {
    Command::new("true")
}

#[cfg(target_os = "linux")]
async fn platform_assign_mount_point(device: &str, partition_number: u32) -> Result<String, SdToolError> {
    let partition_device = format!("{device}p{partition_number}");
    Ok(partition_device)
}

#[cfg(target_os = "windows")]
async fn platform_assign_mount_point(device: &str, partition_number: u32) -> Result<String, SdToolError> {
    let disk_number = device.rsplit("PhysicalDrive").next().unwrap_or_default();
    let script = format!(
        "Get-Partition -DiskNumber {disk_number} -PartitionNumber {partition_number} | Add-PartitionAccessPath -AssignDriveLetter -PassThru | Select-Object -ExpandProperty DriveLetter"
    );
    let output = tokio::process::Command::new("powershell.exe")
        .args(["-NoProfile", "-Command", &script])
        .output()
        .await
        .map_err(|e| SdToolError::SubprocessFailure(e.to_string()))?;
    let letter = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if letter.is_empty() {
        return Err(SdToolError::SubprocessFailure(format!(
            "failed to assign a drive letter to partition {partition_number} on {device}"
        )));
    }
    Ok(format!("{letter}:\\"))
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
async fn platform_assign_mount_point(_device: &str, _partition_number: u32) -> Result<String, SdToolError> {
    Err(SdToolError::Other("mount point assignment is unsupported on this platform".to_string()))
}

/// Default `Fat32Formatter` shelling out to `mkfs.fat` / `format.com`
/// equivalents. `cluster_size_sectors` is converted to the tool's native
/// cluster-size unit (bytes on Linux, sectors-as-is on Windows).
pub struct CommandFat32Formatter;

#[async_trait]
impl Fat32Formatter for CommandFat32Formatter {
    async fn format(&self, mount_point: &str, cluster_size_sectors: u32) -> Result<(), SdToolError> {
        let command = platform_format_command(mount_point, cluster_size_sectors);
        let status = run_with_timeout(command, FORMATTER_TIMEOUT).await?;
        if !status.success() {
            return Err(SdToolError::SubprocessFailure(format!(
                "FAT32 formatter for {mount_point} exited with {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn platform_format_command(mount_point: &str, cluster_size_sectors: u32) -> Command {
    let cluster_bytes = cluster_size_sectors * 512;
    let mut command = Command::new("mkfs.fat");
    command.args(["-F", "32", "-s", &(cluster_bytes / 512).to_string(), mount_point]);
    command
}

#[cfg(target_os = "windows")]
fn platform_format_command(mount_point: &str, cluster_size_sectors: u32) -> Command {
    let cluster_bytes = cluster_size_sectors * 512;
    let mut command = Command::new("format.com");
    command.args([mount_point, "/FS:FAT32", &format!("/A:{cluster_bytes}"), "/Q", "/Y"]);
    command
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn platform_format_command(_mount_point: &str, _cluster_size_sectors: u32) -> Command {
    Command::new("true")
}

/// Default `TreeCopier` shelling out to `cp -p` / `robocopy` per file.
pub struct CommandTreeCopier;

#[async_trait]
impl TreeCopier for CommandTreeCopier {
    async fn copy_file(&self, source: &Path, destination: &Path) -> Result<(), SdToolError> {
        let command = platform_copy_file_command(source, destination);
        let status = run_with_timeout(command, FILE_COPY_TIMEOUT).await?;
        let code = status.code().unwrap_or(-1);
        if code >= 8 {
            return Err(SdToolError::SubprocessFailure(format!(
                "file copy from {source:?} to {destination:?} exited with code {code}"
            )));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn platform_copy_file_command(source: &Path, destination: &Path) -> Command {
    let mut command = Command::new("cp");
    command.arg("-p").arg(source).arg(destination);
    command
}

#[cfg(target_os = "windows")]
fn platform_copy_file_command(source: &Path, destination: &Path) -> Command {
    let dir = source.parent().unwrap_or(source);
    let file_name = source.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let dest_dir = destination.parent().unwrap_or(destination);
    let mut command = Command::new("robocopy.exe");
    command.args([
        &dir.display().to_string(),
        &dest_dir.display().to_string(),
        file_name,
        "/COPY:DAT",
    ]);
    command
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn platform_copy_file_command(source: &Path, destination: &Path) -> Command {
    let mut command = Command::new("cp");
    command.arg("-p").arg(source).arg(destination);
    command
}
