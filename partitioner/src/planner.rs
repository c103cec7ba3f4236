//! Target layout computation: given a scanned source layout, a target
//! disk size, and migration toggles, produce the `DiskLayout` the writer
//! will emit.

use sdtool_core::{Category, DiskLayout, Partition, SdToolError};
use sdtool_core::partition::ALIGN_SECTORS;

const SECTOR_SIZE: u64 = sdtool_core::SECTOR_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct MigrationOptions {
    /// Kept for parity with the source tool's options record; FAT32 is
    /// always carried forward regardless of this flag (see §4.D "FAT32
    /// (always, ...)").
    pub fat32: bool,
    pub linux: bool,
    pub android: bool,
    pub emummc: bool,
    pub expand_fat32: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            fat32: true,
            linux: true,
            android: true,
            emummc: true,
            expand_fat32: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// Target disk is a different, normally larger, device.
    Migrate,
    /// Same-disk cleanup: total size is unchanged, some categories dropped.
    Cleanup,
}

fn align_up(sector: u64) -> u64 {
    sector.div_ceil(ALIGN_SECTORS) * ALIGN_SECTORS
}

/// Compute the target layout. `end_reserve_mib` is normally 9 (the stock
/// hekate tail reserve); callers may override it via `ToolConfig`.
pub fn plan_layout(
    source: &DiskLayout,
    target_total_bytes: u64,
    options: &MigrationOptions,
    mode: PlanMode,
    end_reserve_mib: u64,
) -> Result<DiskLayout, SdToolError> {
    if mode == PlanMode::Migrate {
        let source_bytes = source.total_sectors * SECTOR_SIZE;
        if target_total_bytes <= source_bytes {
            return Err(SdToolError::TargetNotLarger {
                source_bytes,
                target_bytes: target_total_bytes,
            });
        }
    }

    let target_total_sectors = target_total_bytes / SECTOR_SIZE;
    let tail_reserve_sectors = end_reserve_mib * 1024 * 1024 / SECTOR_SIZE;

    let source_fat32 = source
        .fat32()
        .ok_or_else(|| SdToolError::InvalidOnDisk("source layout has no FAT32 partition".to_string()))?;

    let linux_parts: Vec<&Partition> = if options.linux && source.has_linux() {
        source.linux().collect()
    } else {
        Vec::new()
    };
    let android_parts: Vec<&Partition> = if options.android && source.has_android() {
        source.android().collect()
    } else {
        Vec::new()
    };
    let emummc_parts: Vec<&Partition> = if options.emummc && source.has_emummc() {
        source.emummc().collect()
    } else {
        Vec::new()
    };

    let has_gpt = source.has_android() && options.android;

    // Span consumed by the non-FAT32 preserved partitions if placed back
    // to back starting from an already-aligned point. Used both to size
    // FAT32 (when expanding) and to validate the target fits.
    let other_sizes: Vec<u64> = linux_parts
        .iter()
        .chain(android_parts.iter())
        .chain(emummc_parts.iter())
        .map(|p| p.size_sectors)
        .collect();

    let mut probe_cursor = 0u64;
    for size in &other_sizes {
        probe_cursor = align_up(probe_cursor);
        probe_cursor += size;
    }
    let other_span = probe_cursor;

    let fat32_size_sectors = if options.expand_fat32 {
        let available = target_total_sectors
            .checked_sub(ALIGN_SECTORS)
            .and_then(|v| v.checked_sub(other_span))
            .and_then(|v| v.checked_sub(tail_reserve_sectors));
        let available = available.ok_or_else(|| SdToolError::InsufficientTargetSize {
            needed_bytes: (ALIGN_SECTORS + other_span + tail_reserve_sectors) * SECTOR_SIZE,
            available_bytes: target_total_bytes,
        })?;
        // Round down to the alignment boundary so the next partition
        // starts aligned with zero padding, matching the leading-16MiB
        // convention FAT32 already uses.
        (available / ALIGN_SECTORS) * ALIGN_SECTORS
    } else {
        source_fat32.size_sectors
    };

    if fat32_size_sectors == 0 {
        return Err(SdToolError::InsufficientTargetSize {
            needed_bytes: (ALIGN_SECTORS + other_span + tail_reserve_sectors) * SECTOR_SIZE,
            available_bytes: target_total_bytes,
        });
    }

    let mut layout = DiskLayout::new(target_total_sectors);
    let mut cursor = ALIGN_SECTORS;

    layout.push(Partition {
        name: "hos_data".to_string(),
        category: Category::Fat32,
        mbr_type_id: 0x0C,
        type_name: "FAT32 (LBA)".to_string(),
        start_sector: cursor,
        size_sectors: fat32_size_sectors,
        in_mbr: true,
        in_gpt: has_gpt,
    });
    cursor = align_up(cursor + fat32_size_sectors);

    for part in &linux_parts {
        layout.push(Partition {
            name: part.name.clone(),
            category: Category::Linux,
            mbr_type_id: if has_gpt { 0 } else { 0x83 },
            type_name: "Linux".to_string(),
            start_sector: cursor,
            size_sectors: part.size_sectors,
            in_mbr: !has_gpt,
            in_gpt: has_gpt,
        });
        cursor = align_up(cursor + part.size_sectors);
    }

    for part in &android_parts {
        layout.push(Partition {
            name: part.name.clone(),
            category: Category::Android,
            mbr_type_id: 0,
            type_name: "Android".to_string(),
            start_sector: cursor,
            size_sectors: part.size_sectors,
            in_mbr: false,
            in_gpt: true,
        });
        cursor = align_up(cursor + part.size_sectors);
    }

    for part in &emummc_parts {
        layout.push(Partition {
            name: part.name.clone(),
            category: Category::EmuMmc,
            mbr_type_id: 0xE0,
            type_name: "emuMMC".to_string(),
            start_sector: cursor,
            size_sectors: part.size_sectors,
            in_mbr: true,
            in_gpt: has_gpt,
        });
        cursor = align_up(cursor + part.size_sectors);
    }

    if cursor + tail_reserve_sectors > target_total_sectors {
        return Err(SdToolError::InsufficientTargetSize {
            needed_bytes: (cursor + tail_reserve_sectors) * SECTOR_SIZE,
            available_bytes: target_total_bytes,
        });
    }

    debug_assert!(!layout.has_overlaps(), "planner produced overlapping partitions");
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdtool_core::SECTOR_SIZE;

    fn gib(n: u64) -> u64 {
        n * 1024 * 1024 * 1024
    }

    fn part(name: &str, category: Category, start: u64, size_sectors: u64) -> Partition {
        Partition {
            name: name.to_string(),
            category,
            mbr_type_id: 0,
            type_name: category.as_str().to_string(),
            start_sector: start,
            size_sectors,
            in_mbr: true,
            in_gpt: false,
        }
    }

    fn hybrid_source() -> DiskLayout {
        let mut layout = DiskLayout::new(gib(64) / SECTOR_SIZE);
        layout.push(part("hos_data", Category::Fat32, ALIGN_SECTORS, gib(30) / SECTOR_SIZE));
        layout.push(part("l4t", Category::Linux, 0x2000000, gib(8) / SECTOR_SIZE));
        layout.push(part("super", Category::Android, 0x3000000, gib(6) / SECTOR_SIZE));
        layout.push(part("emummc", Category::EmuMmc, 0x4000000, gib(29) / SECTOR_SIZE));
        layout
    }

    #[test]
    fn migrate_to_larger_disk_expands_fat32_and_sets_hybrid_gpt() {
        let source = hybrid_source();
        let options = MigrationOptions::default();
        let target = plan_layout(&source, gib(128), &options, PlanMode::Migrate, 9).unwrap();

        assert!(target.has_gpt());
        assert!(target.android_dynamic());
        let fat32 = target.fat32().unwrap();
        assert_eq!(fat32.start_sector, ALIGN_SECTORS);
        assert_eq!(fat32.start_sector % ALIGN_SECTORS, 0);
        assert!(fat32.size_sectors > source.fat32().unwrap().size_sectors);
        assert!(!target.has_overlaps());
    }

    #[test]
    fn all_starts_are_alignment_multiples() {
        let source = hybrid_source();
        let options = MigrationOptions::default();
        let target = plan_layout(&source, gib(128), &options, PlanMode::Migrate, 9).unwrap();
        for p in target.partitions() {
            assert_eq!(p.start_sector % ALIGN_SECTORS, 0);
        }
    }

    #[test]
    fn migration_requires_strictly_larger_target() {
        let source = hybrid_source();
        let options = MigrationOptions::default();
        let result = plan_layout(&source, gib(64), &options, PlanMode::Migrate, 9);
        assert!(matches!(result, Err(SdToolError::TargetNotLarger { .. })));
    }

    #[test]
    fn dropping_android_disables_hybrid_gpt() {
        let source = hybrid_source();
        let mut options = MigrationOptions::default();
        options.android = false;
        let target = plan_layout(&source, gib(128), &options, PlanMode::Migrate, 9).unwrap();
        assert!(!target.has_gpt());
        assert!(!target.has_android());
    }

    #[test]
    fn insufficient_target_size_is_reported() {
        let source = hybrid_source();
        let options = MigrationOptions::default();
        let result = plan_layout(&source, gib(40), &options, PlanMode::Migrate, 9);
        assert!(matches!(result, Err(SdToolError::InsufficientTargetSize { .. })));
    }

    #[test]
    fn cleanup_mode_allows_same_total_size() {
        let source = hybrid_source();
        let mut options = MigrationOptions::default();
        options.linux = false;
        let source_bytes = source.total_sectors * SECTOR_SIZE;
        let target = plan_layout(&source, source_bytes, &options, PlanMode::Cleanup, 9).unwrap();
        assert!(!target.has_linux());
        assert!(target.fat32().unwrap().size_sectors > source.fat32().unwrap().size_sectors);
    }
}
