//! Migration Engine (spec §4.F): drives the gateway, scanner, planner and
//! writer through the stage graph
//! `Clean -> Prepare -> ClearHeaders -> WriteTable -> FormatFAT32
//!  -> CopyPartitions -> PostProcessEmuMMC -> Done`.

use crate::external::{Fat32Formatter, TableRefresher, TreeCopier};
use crate::pipeline::{self, ChunkPlan};
use crate::{emummc, fat32_copy};
use sdtool_core::partition::ALIGN_SECTORS;
use sdtool_core::{BlockDeviceGateway, Category, DiskLayout, Partition, ProgressCallback, SdToolError};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

const CLUSTER_SECTORS: u32 = 128;
const BPB_OFFSET_TOTAL_SECTORS_32: usize = 32;
const BPB_BACKUP_SECTOR: u64 = 6;

const TABLE_REFRESH_RETRIES: u32 = 10;
const TABLE_REFRESH_DELAY: Duration = Duration::from_secs(2);
const MOUNT_ASSIGN_RETRIES: u32 = 5;
const MOUNT_ASSIGN_DELAY: Duration = Duration::from_secs(2);

pub struct MigrationPlan {
    pub source: DiskLayout,
    pub target: DiskLayout,
    /// The gateway's id for the source device. Raw copies read from here
    /// and write to the target device passed to `run`. Cleanup (same-disk
    /// restructuring) sets this equal to the target device id.
    pub source_device: String,
    /// Where source partitions are already mounted (FAT32 only).
    pub source_fat32_mount: PathBuf,
}

pub struct MigrationEngine<'a> {
    pub gateway: Arc<dyn BlockDeviceGateway>,
    pub table_refresher: &'a dyn TableRefresher,
    pub formatter: &'a dyn Fat32Formatter,
    pub tree_copier: &'a dyn TreeCopier,
    pub progress: Arc<dyn ProgressCallback>,
    pub cancel: Arc<AtomicBool>,
}

impl<'a> MigrationEngine<'a> {
    pub async fn run(&self, target_device: &str, plan: &MigrationPlan) -> Result<(), SdToolError> {
        self.check_cancelled()?;
        self.stage_clean(target_device).await?;

        self.check_cancelled()?;
        self.stage_clear_headers(target_device).await?;

        self.check_cancelled()?;
        sdtool_partitioner::write_table(self.gateway.as_ref(), target_device, &plan.target).await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        retry_until(TABLE_REFRESH_RETRIES, TABLE_REFRESH_DELAY, || async {
            self.table_refresher.refresh(target_device).await
        })
        .await?;
        self.progress.on_progress("WriteTable", 50, "partition table written");

        self.check_cancelled()?;
        let target_fat32 = plan
            .target
            .fat32()
            .ok_or_else(|| SdToolError::InvalidOnDisk("target layout has no FAT32 partition".to_string()))?;
        let fat32_partition_number = partition_number(&plan.target, target_fat32);
        let fat32_mount = retry_until(MOUNT_ASSIGN_RETRIES, MOUNT_ASSIGN_DELAY, || async {
            self.table_refresher
                .assign_mount_point(target_device, fat32_partition_number)
                .await
        })
        .await?;
        let fat32_mount = PathBuf::from(fat32_mount);
        self.formatter.format(&fat32_mount.to_string_lossy(), CLUSTER_SECTORS).await?;
        self.fixup_bpb(target_device, target_fat32).await?;
        self.progress.on_progress("FormatFAT32", 60, "FAT32 formatted and BPB fixed up");

        self.check_cancelled()?;
        self.copy_partitions(target_device, plan, &fat32_mount).await?;

        self.check_cancelled()?;
        self.post_process_emummc(target_device, plan, &fat32_mount).await?;

        self.progress.on_progress("Done", 100, "migration complete");
        Ok(())
    }

    async fn stage_clean(&self, device: &str) -> Result<(), SdToolError> {
        self.progress.on_progress("Clean", 0, "dropping host locks");
        self.gateway.clean(device).await?;
        tokio::time::sleep(Duration::from_secs(3)).await;
        self.progress.on_progress("Prepare", 5, "preparing device for exclusive access");
        self.gateway.prepare(device).await?;
        Ok(())
    }

    async fn stage_clear_headers(&self, device: &str) -> Result<(), SdToolError> {
        self.progress.on_progress("ClearHeaders", 10, "zeroing the first 16 MiB");
        let zeros = vec![0u8; (1024 * 1024) as usize];
        let chunk_sectors = zeros.len() as u64 / 512;
        let mut offset = 0u64;
        while offset < ALIGN_SECTORS {
            let count = chunk_sectors.min(ALIGN_SECTORS - offset);
            let data = &zeros[..(count * 512) as usize];
            self.gateway.write(device, offset, data, true).await?;
            offset += count;
        }
        Ok(())
    }

    /// Dual write at partition offset 0 and offset 6 (FAT32 backup boot
    /// sector) is what makes this fixup survive a reboot; skipping the
    /// backup sector leaves hekate reading the formatter's shorter size.
    async fn fixup_bpb(&self, device: &str, partition: &Partition) -> Result<(), SdToolError> {
        let boot_sector = self.gateway.read(device, partition.start_sector, 1).await?;
        let mut boot_sector: [u8; 512] = boot_sector
            .try_into()
            .map_err(|_| SdToolError::InvalidOnDisk("boot sector was not 512 bytes".to_string()))?;

        let current = u32::from_le_bytes(
            boot_sector[BPB_OFFSET_TOTAL_SECTORS_32..BPB_OFFSET_TOTAL_SECTORS_32 + 4]
                .try_into()
                .unwrap(),
        );
        if current as u64 == partition.size_sectors {
            return Ok(());
        }

        boot_sector[BPB_OFFSET_TOTAL_SECTORS_32..BPB_OFFSET_TOTAL_SECTORS_32 + 4]
            .copy_from_slice(&(partition.size_sectors as u32).to_le_bytes());

        self.gateway.write(device, partition.start_sector, &boot_sector, true).await?;
        self.gateway
            .write(device, partition.start_sector + BPB_BACKUP_SECTOR, &boot_sector, true)
            .await?;
        Ok(())
    }

    async fn copy_partitions(&self, device: &str, plan: &MigrationPlan, fat32_mount: &Path) -> Result<(), SdToolError> {
        if plan.source.fat32().is_some() && plan.target.fat32().is_some() {
            fat32_copy::copy_fat32_tree(
                self.tree_copier,
                &plan.source_fat32_mount,
                fat32_mount,
                self.progress.as_ref(),
            )
            .await?;
        }

        for category in [Category::Linux, Category::Android, Category::EmuMmc] {
            for (src, dst) in matched_partitions(&plan.source, &plan.target, category) {
                self.check_cancelled()?;
                let plan_chunk = pipeline::detect_chunk_plan();
                self.raw_copy_partition(&plan.source_device, device, src, dst, plan_chunk).await?;
            }
        }
        Ok(())
    }

    async fn raw_copy_partition(
        &self,
        source_device: &str,
        target_device: &str,
        src: &Partition,
        dst: &Partition,
        chunk_plan: ChunkPlan,
    ) -> Result<(), SdToolError> {
        let gateway = self.gateway.clone();
        let progress = self.progress.clone();
        let cancel = self.cancel.clone();
        let source_device = source_device.to_string();
        let target_device = target_device.to_string();
        let src_start = src.start_sector;
        let dst_start = dst.start_sector;
        let size_sectors = src.size_sectors;

        tokio::task::spawn_blocking(move || {
            pipeline::raw_copy(
                gateway,
                source_device,
                src_start,
                target_device,
                dst_start,
                size_sectors,
                chunk_plan,
                progress,
                cancel,
            )
        })
        .await
        .map_err(|e| SdToolError::Other(format!("raw copy task panicked: {e}")))??;
        Ok(())
    }

    async fn post_process_emummc(&self, device: &str, plan: &MigrationPlan, fat32_mount: &Path) -> Result<(), SdToolError> {
        self.progress.on_progress("PostProcessEmuMMC", 95, "post-processing emuMMC containers");
        let sources: Vec<&Partition> = plan.source.emummc().collect();
        let targets: Vec<&Partition> = plan.target.emummc().collect();
        for (index, (src, dst)) in sources.iter().zip(targets.iter()).enumerate() {
            let folder_name = if index == 0 { "RAW1".to_string() } else { format!("RAW{}", index + 1) };
            if let Err(e) = emummc::post_process(
                self.gateway.as_ref(),
                &plan.source_device,
                device,
                src.start_sector,
                dst.start_sector,
                dst.size_sectors,
                fat32_mount,
                &folder_name,
            )
            .await
            {
                log::error!("emuMMC post-processing failed for {folder_name}: {e}");
            }
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), SdToolError> {
        if self.cancel.load(std::sync::atomic::Ordering::SeqCst) {
            Err(SdToolError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn partition_number(layout: &DiskLayout, target: &Partition) -> u32 {
    layout
        .partitions()
        .iter()
        .position(|p| p.start_sector == target.start_sector)
        .map(|i| (i + 1) as u32)
        .unwrap_or(1)
}

fn matched_partitions<'a>(source: &'a DiskLayout, target: &'a DiskLayout, category: Category) -> Vec<(&'a Partition, &'a Partition)> {
    let mut sources: Vec<&Partition> = source.partitions().iter().filter(|p| p.category == category).collect();
    let mut targets: Vec<&Partition> = target.partitions().iter().filter(|p| p.category == category).collect();
    sources.sort_by_key(|p| p.start_sector);
    targets.sort_by_key(|p| p.start_sector);
    sources.into_iter().zip(targets).collect()
}

async fn retry_until<F, Fut, T>(attempts: u32, delay: Duration, mut operation: F) -> Result<T, SdToolError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SdToolError>>,
{
    let mut last_error = None;
    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| SdToolError::Other("retry loop ran zero times".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdtool_core::Partition;

    fn part(name: &str, category: Category, start: u64, size: u64) -> Partition {
        Partition {
            name: name.to_string(),
            category,
            mbr_type_id: 0,
            type_name: category.as_str().to_string(),
            start_sector: start,
            size_sectors: size,
            in_mbr: true,
            in_gpt: false,
        }
    }

    #[test]
    fn matched_partitions_pairs_by_ascending_start_sector() {
        let mut source = DiskLayout::new(1_000_000);
        source.push(part("l4t", Category::Linux, 5_000, 100));
        let mut target = DiskLayout::new(2_000_000);
        target.push(part("l4t", Category::Linux, 9_000, 100));

        let pairs = matched_partitions(&source, &target, Category::Linux);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.start_sector, 5_000);
        assert_eq!(pairs[0].1.start_sector, 9_000);
    }

    #[tokio::test]
    async fn retry_until_succeeds_on_a_later_attempt() {
        let counter = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32, SdToolError> = retry_until(3, Duration::from_millis(1), || async {
            let count = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if count < 2 {
                Err(SdToolError::Other("not yet".to_string()))
            } else {
                Ok(count)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn retry_until_gives_up_after_exhausting_attempts() {
        let result: Result<u32, SdToolError> = retry_until(2, Duration::from_millis(1), || async {
            Err(SdToolError::Other("always fails".to_string()))
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn bpb_fixup_is_idempotent() {
        use crate::external::{CommandFat32Formatter, CommandTableRefresher, CommandTreeCopier};
        use sdtool_platform::loopback::{create_sparse_image, LoopbackGateway};

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("card.img");
        create_sparse_image(&image, 64 * 1024 * 1024).unwrap();
        let gateway: Arc<dyn BlockDeviceGateway> = Arc::new(LoopbackGateway::new(dir.path()));
        let device = image.to_str().unwrap();

        let mut boot_sector = vec![0u8; 512];
        boot_sector[BPB_OFFSET_TOTAL_SECTORS_32..BPB_OFFSET_TOTAL_SECTORS_32 + 4]
            .copy_from_slice(&111u32.to_le_bytes());
        gateway.write(device, 0, &boot_sector, true).await.unwrap();

        let refresher = CommandTableRefresher;
        let formatter = CommandFat32Formatter;
        let tree_copier = CommandTreeCopier;
        let engine = MigrationEngine {
            gateway: gateway.clone(),
            table_refresher: &refresher,
            formatter: &formatter,
            tree_copier: &tree_copier,
            progress: Arc::new(sdtool_core::NoOpProgress),
            cancel: Arc::new(AtomicBool::new(false)),
        };

        let partition = part("hos_data", Category::Fat32, 0, 100_000);
        engine.fixup_bpb(device, &partition).await.unwrap();
        let after_first = gateway.read(device, 0, 1).await.unwrap();

        engine.fixup_bpb(device, &partition).await.unwrap();
        let after_second = gateway.read(device, 0, 1).await.unwrap();

        assert_eq!(after_first, after_second);
        let fixed = u32::from_le_bytes(
            after_first[BPB_OFFSET_TOTAL_SECTORS_32..BPB_OFFSET_TOTAL_SECTORS_32 + 4]
                .try_into()
                .unwrap(),
        );
        assert_eq!(fixed as u64, partition.size_sectors);

        let backup = gateway.read(device, BPB_BACKUP_SECTOR, 1).await.unwrap();
        assert_eq!(backup, after_first);
    }
}
