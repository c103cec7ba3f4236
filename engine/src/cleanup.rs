//! Cleanup mode (spec §1, scenario S3): restructure a single card in
//! place, removing selected partitions and growing FAT32 into the freed
//! space. FAT32 contents can't stay on the card mid-wipe, so they're
//! staged to an off-disk backup directory first and restored after the
//! new table and filesystem are in place.

use crate::external::{Fat32Formatter, TableRefresher, TreeCopier};
use crate::fat32_copy;
use crate::migration::{MigrationEngine, MigrationPlan};
use sdtool_core::{DiskLayout, SdToolError};
use std::path::{Path, PathBuf};

pub struct CleanupEngine<'a> {
    pub engine: MigrationEngine<'a>,
    pub backup_dir: PathBuf,
}

impl<'a> CleanupEngine<'a> {
    /// `source_fat32_mount` is the card's current FAT32 mount point;
    /// its contents are copied to `self.backup_dir` before the table is
    /// rewritten, then copied back onto the newly formatted partition.
    pub async fn run(&self, device: &str, source: DiskLayout, target: DiskLayout, source_fat32_mount: &Path) -> Result<(), SdToolError> {
        std::fs::create_dir_all(&self.backup_dir)?;
        fat32_copy::copy_fat32_tree(
            self.engine.tree_copier,
            source_fat32_mount,
            &self.backup_dir,
            self.engine.progress.as_ref(),
        )
        .await?;

        let plan = MigrationPlan {
            source,
            target,
            source_device: device.to_string(),
            source_fat32_mount: self.backup_dir.clone(),
        };
        self.engine.run(device, &plan).await
    }
}

/// Convenience constructor mirroring `MigrationEngine`'s field set, kept
/// separate so call sites don't need to know `CleanupEngine` wraps one.
pub fn cleanup_engine<'a>(
    gateway: std::sync::Arc<dyn sdtool_core::BlockDeviceGateway>,
    table_refresher: &'a dyn TableRefresher,
    formatter: &'a dyn Fat32Formatter,
    tree_copier: &'a dyn TreeCopier,
    progress: std::sync::Arc<dyn sdtool_core::ProgressCallback>,
    cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
    backup_dir: PathBuf,
) -> CleanupEngine<'a> {
    CleanupEngine {
        engine: MigrationEngine {
            gateway,
            table_refresher,
            formatter,
            tree_copier,
            progress,
            cancel,
        },
        backup_dir,
    }
}
