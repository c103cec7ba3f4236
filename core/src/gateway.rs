//! The Block Device Gateway contract (component A). Implementations live in
//! `sdtool-platform`; this crate only defines the trait so the scanner,
//! planner, writer and engine can all depend on it without depending on any
//! particular OS.

use crate::SdToolError;

/// Order in which the gateway attempts to open a device for writing.
/// Hosts aggressively remount removable media and partial locking is
/// common; unbuffered writes bypass caches that would otherwise hide
/// later corruption, so the ladder tries the strictest mode first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ExclusiveUnbuffered,
    SharedReadUnbuffered,
    ExclusiveBuffered,
}

impl OpenMode {
    pub const LADDER: [OpenMode; 3] = [
        OpenMode::ExclusiveUnbuffered,
        OpenMode::SharedReadUnbuffered,
        OpenMode::ExclusiveBuffered,
    ];
}

/// Raw sector-level access to a block device, plus the host-side
/// preparation steps needed to get exclusive write access to removable
/// media. No process-wide singleton: every subsystem that needs one is
/// handed a `&dyn BlockDeviceGateway` (or an `Arc<dyn ...>`) explicitly.
#[async_trait::async_trait]
pub trait BlockDeviceGateway: Send + Sync {
    /// Read exactly `count * 512` bytes starting at `start_sector`.
    async fn read(&self, device: &str, start_sector: u64, count: u64) -> Result<Vec<u8>, SdToolError>;

    /// Write `data` (a multiple of 512 bytes) starting at `start_sector`.
    /// On a sharing/locking failure, retries up to 3 times with 1 s
    /// spacing, re-running `prepare` on the first retry.
    async fn write(
        &self,
        device: &str,
        start_sector: u64,
        data: &[u8],
        skip_prepare: bool,
    ) -> Result<(), SdToolError>;

    /// Ask the host to drop all partitions and release all locks on the
    /// device. Must be durable across subsequent opens.
    async fn clean(&self, device: &str) -> Result<(), SdToolError>;

    /// Best-effort sequence: take the disk offline/online, lock and
    /// dismount each mounted volume, and refuse if write-protect is set.
    async fn prepare(&self, device: &str) -> Result<(), SdToolError>;

    async fn size(&self, device: &str) -> Result<u64, SdToolError>;
}
