//! Scanner/writer round-trip: for a synthetic layout, writing it to a
//! loopback image and re-scanning it reproduces the same logical layout
//! up to partition-GUID randomness and MBR/GPT deduplication.

use sdtool_core::{BlockDeviceGateway, Category, DiskLayout, Partition};
use sdtool_partitioner::{scan_disk, write_table};
use sdtool_platform::loopback::{create_sparse_image, LoopbackGateway};

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
async fn hybrid_layout_round_trips_through_write_and_scan() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("card.img");
    let total_sectors: u64 = 4 * 1024 * 1024; // 2 GiB image, enough for a tiny synthetic layout
    create_sparse_image(&image, total_sectors * 512).unwrap();

    let mut layout = DiskLayout::new(total_sectors);
    layout.push(part("hos_data", Category::Fat32, 0x0C, 0x8000, 100_000, true, true));
    layout.push(part("super", Category::Android, 0, 200_000, 50_000, false, true));
    layout.push(part("emummc", Category::EmuMmc, 0xE0, 290_000, 40_000, true, true));

    let gateway = LoopbackGateway::new(dir.path());
    let device = image.to_str().unwrap();
    write_table(&gateway, device, &layout).await.unwrap();

    let scanned = scan_disk(&gateway, device).await.unwrap();

    assert!(scanned.has_android());
    assert!(scanned.android_dynamic());
    assert!(scanned.has_emummc());
    assert_eq!(scanned.partitions().len(), layout.partitions().len());

    let original_fat32 = layout.fat32().unwrap();
    let scanned_fat32 = scanned.fat32().unwrap();
    assert_eq!(original_fat32.start_sector, scanned_fat32.start_sector);
    assert_eq!(original_fat32.size_sectors, scanned_fat32.size_sectors);
}

#[tokio::test]
async fn pure_mbr_layout_without_android_has_no_gpt() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("card.img");
    let total_sectors: u64 = 2 * 1024 * 1024;
    create_sparse_image(&image, total_sectors * 512).unwrap();

    let mut layout = DiskLayout::new(total_sectors);
    layout.push(part("hos_data", Category::Fat32, 0x0C, 0x8000, 100_000, true, false));
    layout.push(part("l4t", Category::Linux, 0x83, 150_000, 40_000, true, false));

    let gateway = LoopbackGateway::new(dir.path());
    let device = image.to_str().unwrap();
    write_table(&gateway, device, &layout).await.unwrap();

    let scanned = scan_disk(&gateway, device).await.unwrap();
    assert!(!scanned.has_gpt());
    assert!(scanned.has_linux());
    assert_eq!(scanned.partitions().len(), 2);
}
