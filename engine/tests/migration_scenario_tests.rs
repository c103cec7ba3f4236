//! End-to-end migration run (scenario S1, scaled down) against a loopback
//! image, with the three external subprocess contracts faked out since
//! there is no real partprobe/mkfs.fat/cp available in CI.

use async_trait::async_trait;
use sdtool_core::{BlockDeviceGateway, Category, DiskLayout, NoOpProgress, Partition, SdToolError};
use sdtool_engine::external::{Fat32Formatter, TableRefresher, TreeCopier};
use sdtool_engine::{MigrationEngine, MigrationPlan};
use sdtool_platform::loopback::{create_sparse_image, LoopbackGateway};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

struct FakeRefresher;

#[async_trait]
impl TableRefresher for FakeRefresher {
    async fn refresh(&self, _device: &str) -> Result<(), SdToolError> {
        Ok(())
    }

    async fn assign_mount_point(&self, _device: &str, _partition_number: u32) -> Result<String, SdToolError> {
        Ok("/tmp/sdtool-test-mount".to_string())
    }
}

struct FakeFormatter;

#[async_trait]
impl Fat32Formatter for FakeFormatter {
    async fn format(&self, mount_point: &str, _cluster_size_sectors: u32) -> Result<(), SdToolError> {
        std::fs::create_dir_all(mount_point)?;
        Ok(())
    }
}

struct FakeTreeCopier;

#[async_trait]
impl TreeCopier for FakeTreeCopier {
    async fn copy_file(&self, source: &Path, destination: &Path) -> Result<(), SdToolError> {
        std::fs::copy(source, destination)?;
        Ok(())
    }
}

fn part(name: &str, category: Category, mbr_type_id: u8, start: u64, size: u64, in_mbr: bool, in_gpt: bool) -> Partition {
    Partition {
        name: name.to_string(),
        category,
        mbr_type_id,
        type_name: category.as_str().to_string(),
        start_sector: start,
        size_sectors: size,
        in_mbr,
        in_gpt,
    }
}

#[tokio::test]
async fn migration_run_completes_and_copies_raw_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("card.img");
    let total_sectors: u64 = 2_000_000;
    create_sparse_image(&image, total_sectors * 512).unwrap();
    let gateway: Arc<dyn BlockDeviceGateway> = Arc::new(LoopbackGateway::new(dir.path()));
    let device = image.to_str().unwrap().to_string();

    let mut source = DiskLayout::new(1_000_000);
    source.push(part("hos_data", Category::Fat32, 0x0C, 32_768, 100_000, true, true));
    source.push(part("l4t", Category::Linux, 0, 200_000, 50_000, false, true));

    let mut target = DiskLayout::new(total_sectors);
    target.push(part("hos_data", Category::Fat32, 0x0C, 32_768, 150_000, true, true));
    target.push(part("l4t", Category::Linux, 0, 900_000, 50_000, false, true));

    let source_mount = tempfile::tempdir().unwrap();
    std::fs::write(source_mount.path().join("hekate_ipl.ini"), b"boot config").unwrap();

    // Seed the source Linux partition with a recognizable pattern so the
    // raw copy step has something to move.
    let pattern = vec![0x5Au8; 512 * 32];
    gateway.write(&device, 200_000, &pattern, true).await.unwrap();

    let refresher = FakeRefresher;
    let formatter = FakeFormatter;
    let tree_copier = FakeTreeCopier;
    let engine = MigrationEngine {
        gateway: gateway.clone(),
        table_refresher: &refresher,
        formatter: &formatter,
        tree_copier: &tree_copier,
        progress: Arc::new(NoOpProgress),
        cancel: Arc::new(AtomicBool::new(false)),
    };

    let plan = MigrationPlan {
        source,
        target,
        source_device: device.clone(),
        source_fat32_mount: source_mount.path().to_path_buf(),
    };

    engine.run(&device, &plan).await.unwrap();

    let copied = gateway.read(&device, 900_000, 32).await.unwrap();
    assert_eq!(copied, pattern);

    let fat32_mount = PathBuf::from("/tmp/sdtool-test-mount");
    assert!(fat32_mount.join("hekate_ipl.ini").exists());
    let _ = std::fs::remove_dir_all(&fat32_mount);
}
