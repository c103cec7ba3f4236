//! Disk scanning: read the hybrid MBr+GPT table off a device and produce a
//! `DiskLayout`. Parsing is split into pure functions operating on raw
//! sector bytes (easy to unit test with synthetic buffers) and a thin
//! `scan_disk` entry point that drives the gateway.

use crate::guid;
use sdtool_core::{BlockDeviceGateway, Category, DiskLayout, Partition, SdToolError, SECTOR_SIZE};

const GPT_ENTRY_SECTORS: u64 = 32;
const GPT_ENTRY_SIZE: usize = 128;

/// Parse the boot sector (512 bytes) for its four MBR partition entries.
/// Skips empty slots and the protective-GPT marker (0xEE), which the GPT
/// parser accounts for separately.
pub fn parse_mbr(mbr_sector: &[u8]) -> Result<Vec<Partition>, SdToolError> {
    if mbr_sector.len() != SECTOR_SIZE as usize {
        return Err(SdToolError::InvalidOnDisk(format!(
            "MBR sector must be {SECTOR_SIZE} bytes, got {}",
            mbr_sector.len()
        )));
    }
    if mbr_sector[0x1FE..0x200] != [0x55, 0xAA] {
        return Err(SdToolError::InvalidOnDisk("missing MBR boot signature (0x55AA)".to_string()));
    }

    let mut partitions = Vec::new();
    for i in 0..4 {
        let offset = 0x1BE + i * 16;
        let entry = &mbr_sector[offset..offset + 16];
        let type_id = entry[4];
        let start_sector = u32::from_le_bytes(entry[8..12].try_into().unwrap()) as u64;
        let size_sectors = u32::from_le_bytes(entry[12..16].try_into().unwrap()) as u64;

        if type_id == 0 || size_sectors == 0 || type_id == 0xEE {
            continue;
        }

        let (category, default_name) = categorize_mbr(type_id);
        partitions.push(Partition {
            name: default_name.unwrap_or_else(|| format!("mbr{i}")),
            category,
            mbr_type_id: type_id,
            type_name: mbr_type_name(type_id),
            start_sector,
            size_sectors,
            in_mbr: true,
            in_gpt: false,
        });
    }
    Ok(partitions)
}

/// Parse up to 128 GPT partition entries (16 KiB = 32 sectors).
pub fn parse_gpt_entries(entries: &[u8]) -> Vec<Partition> {
    let mut partitions = Vec::new();
    for i in 0..(entries.len() / GPT_ENTRY_SIZE) {
        let offset = i * GPT_ENTRY_SIZE;
        let entry = &entries[offset..offset + GPT_ENTRY_SIZE];
        let type_guid = &entry[0..16];
        if type_guid.iter().all(|&b| b == 0) {
            continue;
        }

        let lba_start = u64::from_le_bytes(entry[32..40].try_into().unwrap());
        let lba_end = u64::from_le_bytes(entry[40..48].try_into().unwrap());
        let size_sectors = lba_end.saturating_sub(lba_start).saturating_add(1);

        let name_bytes = &entry[56..56 + 72];
        let name = decode_utf16le(name_bytes);
        let name = if name.is_empty() { format!("gpt{i}") } else { name };

        let category = categorize_gpt(type_guid, &name);
        partitions.push(Partition {
            name,
            category,
            mbr_type_id: 0,
            type_name: category.as_str().to_string(),
            start_sector: lba_start,
            size_sectors,
            in_mbr: false,
            in_gpt: true,
        });
    }
    partitions
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units).trim_end_matches('\0').to_string()
}

fn categorize_mbr(type_id: u8) -> (Category, Option<String>) {
    match type_id {
        0x0B | 0x0C => (Category::Fat32, Some("hos_data".to_string())),
        0x83 => (Category::Linux, Some("l4t".to_string())),
        0xE0 => (Category::EmuMmc, None),
        _ => (Category::Unknown, None),
    }
}

fn mbr_type_name(type_id: u8) -> String {
    match type_id {
        0x0C => "FAT32 (LBA)".to_string(),
        0x0B => "FAT32".to_string(),
        0x83 => "Linux".to_string(),
        0xE0 => "emuMMC".to_string(),
        0xEE => "GPT Protective".to_string(),
        other => format!("Unknown (0x{other:02X})"),
    }
}

fn categorize_gpt(type_guid: &[u8], name: &str) -> Category {
    if type_guid == guid::GUID_FAT32 {
        Category::Fat32
    } else if type_guid == guid::GUID_LINUX {
        if name.eq_ignore_ascii_case("l4t") {
            Category::Linux
        } else {
            Category::Android
        }
    } else if type_guid == guid::GUID_EMUMMC {
        Category::EmuMmc
    } else {
        Category::Unknown
    }
}

/// One-shot clustering pass: sort by (category, size_sectors, start_sector)
/// so near-duplicates land adjacent to each other, then walk once merging
/// each partition into the current cluster (or opening a new one) by
/// comparing against the cluster's anchor start sector. O(n log n), never
/// the nested-loop O(n^2) comparison the original scanner used.
pub fn deduplicate_partitions(mut partitions: Vec<Partition>) -> Vec<Partition> {
    partitions.sort_by(|a, b| {
        (category_rank(a.category), a.size_sectors, a.start_sector).cmp(&(
            category_rank(b.category),
            b.size_sectors,
            b.start_sector,
        ))
    });

    let mut clusters: Vec<Partition> = Vec::new();
    let mut anchors: Vec<u64> = Vec::new();

    for p in partitions {
        if let (Some(last), Some(&anchor)) = (clusters.last_mut(), anchors.last()) {
            if last.category == p.category && last.size_sectors == p.size_sectors {
                let diff = p.start_sector.abs_diff(anchor);
                let tolerance = last.size_sectors / 100;
                if diff == 0 || diff < tolerance {
                    let in_mbr = last.in_mbr || p.in_mbr;
                    let in_gpt = last.in_gpt || p.in_gpt;
                    if p.in_gpt && !last.in_gpt {
                        *last = p;
                    }
                    last.in_mbr = in_mbr;
                    last.in_gpt = in_gpt;
                    continue;
                }
            }
        }
        anchors.push(p.start_sector);
        clusters.push(p);
    }

    clusters.sort_by_key(|p| p.start_sector);
    clusters
}

fn category_rank(category: Category) -> u8 {
    match category {
        Category::Fat32 => 0,
        Category::Linux => 1,
        Category::Android => 2,
        Category::EmuMmc => 3,
        Category::Unknown => 4,
    }
}

/// Read the MBR and, if present, the GPT off `device`, merge and
/// deduplicate the result into a single `DiskLayout`. Any I/O failure
/// aborts the scan without modifying the device.
pub async fn scan_disk(gateway: &dyn BlockDeviceGateway, device: &str) -> Result<DiskLayout, SdToolError> {
    let total_bytes = gateway.size(device).await?;
    let total_sectors = total_bytes / SECTOR_SIZE;

    let mbr_sector = gateway.read(device, 0, 1).await?;
    let mut partitions = parse_mbr(&mbr_sector)?;

    let gpt_header = gateway.read(device, 1, 1).await?;
    if &gpt_header[0..8] == b"EFI PART" {
        let entries = gateway.read(device, 2, GPT_ENTRY_SECTORS).await?;
        partitions.extend(parse_gpt_entries(&entries));
    }

    let partitions = deduplicate_partitions(partitions);
    let layout = DiskLayout::from_partitions(partitions, total_sectors);

    if layout.has_overlaps() {
        log::warn!("scan of {device} produced overlapping partitions");
    }

    Ok(layout)
}
