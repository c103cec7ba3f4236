//! Partition table writer: emits a legal MBR, and — when the layout calls
//! for it — a primary + backup GPT with verifying CRCs, per §4.E. Byte
//! layout is built in plain functions first (trivial to unit test against
//! hand-computed CRCs) and `write_table` drives the gateway.

use crate::guid;
use rand::RngCore;
use sdtool_core::{BlockDeviceGateway, Category, DiskLayout, Partition, SdToolError, SECTOR_SIZE};

const GPT_ENTRY_SIZE: usize = 128;
const GPT_ENTRY_COUNT: usize = 128;
const GPT_ENTRIES_BYTES: usize = GPT_ENTRY_SIZE * GPT_ENTRY_COUNT;
const GPT_ENTRY_SECTORS: u64 = (GPT_ENTRIES_BYTES as u64) / SECTOR_SIZE;

/// Build the 512-byte MBR for `layout`. MBR-visible partitions are ordered
/// FAT32 -> Linux -> emuMMC, written into slots 0..N; a protective entry
/// (type 0xEE) fills the next free slot when `layout.has_gpt()`.
pub fn build_mbr(layout: &DiskLayout) -> Result<[u8; 512], SdToolError> {
    let mut mbr = [0u8; 512];
    rand::thread_rng().fill_bytes(&mut mbr[0x1B8..0x1BC]);
    mbr[0x1FE] = 0x55;
    mbr[0x1FF] = 0xAA;

    let mut mbr_partitions: Vec<&Partition> = layout.partitions().iter().filter(|p| p.in_mbr).collect();
    mbr_partitions.sort_by_key(|p| category_order(p.category));

    if mbr_partitions.len() > 4 || (layout.has_gpt() && mbr_partitions.len() > 3) {
        return Err(SdToolError::InvalidOnDisk(
            "too many MBR-visible partitions for a 4-slot table".to_string(),
        ));
    }

    let mut slot = 0usize;
    for partition in &mbr_partitions {
        write_mbr_entry(&mut mbr, slot, partition.mbr_type_id, partition.start_sector, partition.size_sectors);
        slot += 1;
    }

    if layout.has_gpt() {
        write_mbr_entry(&mut mbr, slot, 0xEE, 1, layout.total_sectors - 1);
    }

    Ok(mbr)
}

fn category_order(category: Category) -> u8 {
    match category {
        Category::Fat32 => 0,
        Category::Linux => 1,
        Category::EmuMmc => 2,
        Category::Android | Category::Unknown => 99,
    }
}

fn write_mbr_entry(mbr: &mut [u8; 512], slot: usize, type_id: u8, start_sector: u64, size_sectors: u64) {
    let offset = 0x1BE + slot * 16;
    mbr[offset] = 0x00;
    mbr[offset + 1..offset + 4].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
    mbr[offset + 4] = type_id;
    mbr[offset + 5..offset + 8].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
    mbr[offset + 8..offset + 12].copy_from_slice(&(start_sector as u32).to_le_bytes());
    mbr[offset + 12..offset + 16].copy_from_slice(&(size_sectors as u32).to_le_bytes());
}

/// The 16 KiB GPT entries table, and the primary + backup headers that
/// reference it.
pub struct GptTables {
    pub entries: Vec<u8>,
    pub primary_header: [u8; 512],
    pub backup_header: [u8; 512],
}

fn type_guid_for(category: Category) -> [u8; 16] {
    match category {
        Category::Fat32 => guid::GUID_FAT32,
        Category::Linux | Category::Android => guid::GUID_LINUX,
        Category::EmuMmc => guid::GUID_EMUMMC,
        Category::Unknown => [0u8; 16],
    }
}

pub fn build_gpt(layout: &DiskLayout) -> GptTables {
    let mut entries = vec![0u8; GPT_ENTRIES_BYTES];
    let mut rng = rand::thread_rng();
    let mut num_entries = 0usize;

    for partition in layout.partitions().iter().filter(|p| p.in_gpt) {
        if num_entries >= GPT_ENTRY_COUNT {
            break;
        }
        let offset = num_entries * GPT_ENTRY_SIZE;
        entries[offset..offset + 16].copy_from_slice(&type_guid_for(partition.category));

        let mut part_guid = [0u8; 16];
        rng.fill_bytes(&mut part_guid);
        part_guid[7] = 0;
        entries[offset + 16..offset + 32].copy_from_slice(&part_guid);

        entries[offset + 32..offset + 40].copy_from_slice(&partition.start_sector.to_le_bytes());
        entries[offset + 40..offset + 48]
            .copy_from_slice(&partition.end_sector_inclusive().to_le_bytes());
        entries[offset + 48..offset + 56].copy_from_slice(&0u64.to_le_bytes());

        let name_utf16: Vec<u8> = partition
            .name
            .encode_utf16()
            .take(36)
            .flat_map(|u| u.to_le_bytes())
            .collect();
        entries[offset + 56..offset + 56 + name_utf16.len()].copy_from_slice(&name_utf16);

        num_entries += 1;
    }

    let mut disk_guid = [0u8; 16];
    rng.fill_bytes(&mut disk_guid[..10]);
    disk_guid[10..16].copy_from_slice(b"NYXGPT");

    let primary_header = build_gpt_header(GptHeaderArgs {
        my_lba: 1,
        alternate_lba: layout.total_sectors - 1,
        partition_entry_lba: 2,
        disk_guid,
        num_entries: num_entries as u32,
        entries: &entries,
        total_sectors: layout.total_sectors,
    });

    let backup_header = build_gpt_header(GptHeaderArgs {
        my_lba: layout.total_sectors - 1,
        alternate_lba: 1,
        partition_entry_lba: layout.total_sectors - GPT_ENTRY_SECTORS - 1,
        disk_guid,
        num_entries: num_entries as u32,
        entries: &entries,
        total_sectors: layout.total_sectors,
    });

    GptTables {
        entries,
        primary_header,
        backup_header,
    }
}

struct GptHeaderArgs<'a> {
    my_lba: u64,
    alternate_lba: u64,
    partition_entry_lba: u64,
    disk_guid: [u8; 16],
    num_entries: u32,
    entries: &'a [u8],
    total_sectors: u64,
}

/// CRC32 is computed over the *full* 16 KiB entries region (the original
/// tool this was ported from only covers `num_entries * 128` bytes; that
/// diverges from the UEFI spec once a disk ever had more entries written
/// than it currently uses, so this implementation always hashes all
/// `GPT_ENTRIES_BYTES`).
fn build_gpt_header(args: GptHeaderArgs) -> [u8; 512] {
    let mut header = [0u8; 512];
    header[0..8].copy_from_slice(b"EFI PART");
    header[8..12].copy_from_slice(&0x00010000u32.to_le_bytes());
    header[12..16].copy_from_slice(&92u32.to_le_bytes());
    // header[16..20] (header CRC32) left zero until computed below.
    // header[20..24] reserved, left zero.
    header[24..32].copy_from_slice(&args.my_lba.to_le_bytes());
    header[32..40].copy_from_slice(&args.alternate_lba.to_le_bytes());
    header[40..48].copy_from_slice(&34u64.to_le_bytes());
    header[48..56].copy_from_slice(&(args.total_sectors - 34).to_le_bytes());
    header[56..72].copy_from_slice(&args.disk_guid);
    header[72..80].copy_from_slice(&args.partition_entry_lba.to_le_bytes());
    header[80..84].copy_from_slice(&args.num_entries.to_le_bytes());
    header[84..88].copy_from_slice(&128u32.to_le_bytes());

    let entries_crc = crc32fast::hash(args.entries);
    header[88..92].copy_from_slice(&entries_crc.to_le_bytes());

    let header_crc = crc32fast::hash(&header[0..92]);
    header[16..20].copy_from_slice(&header_crc.to_le_bytes());

    header
}

pub fn verify_gpt_header_crc(header: &[u8; 512]) -> bool {
    let stored_crc = u32::from_le_bytes(header[16..20].try_into().unwrap());
    let mut copy = *header;
    copy[16..20].copy_from_slice(&0u32.to_le_bytes());
    crc32fast::hash(&copy[0..92]) == stored_crc
}

/// Writes the MBR and, when `layout.has_gpt()`, the primary and backup
/// GPT structures. MBR goes first, then entries, then the primary header;
/// the backup pair may land before or after as long as both are durable
/// before this returns.
pub async fn write_table(gateway: &dyn BlockDeviceGateway, device: &str, layout: &DiskLayout) -> Result<(), SdToolError> {
    let mbr = build_mbr(layout)?;
    gateway.write(device, 0, &mbr, true).await?;

    if layout.has_gpt() {
        let gpt = build_gpt(layout);
        gateway.write(device, 2, &gpt.entries, true).await?;
        gateway.write(device, 1, &gpt.primary_header, true).await?;

        let backup_entries_lba = layout.total_sectors - GPT_ENTRY_SECTORS - 1;
        gateway.write(device, backup_entries_lba, &gpt.entries, true).await?;
        let backup_header_lba = layout.total_sectors - 1;
        gateway.write(device, backup_header_lba, &gpt.backup_header, true).await?;
    }

    Ok(())
}
