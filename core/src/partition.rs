//! The partition data model: `Partition`, `Category` and `DiskLayout`.
//!
//! `DiskLayout` stores only the partition list and `total_sectors`; every
//! other fact about a layout (`has_linux`, `android_dynamic`, aggregate
//! category sizes, ...) is a derived accessor computed from that list, per
//! the design note against ad-hoc state flags. This keeps a `DiskLayout`
//! impossible to desynchronize from its own partitions.

use serde::{Deserialize, Serialize};

pub const SECTOR_SIZE: u64 = 512;

/// 16 MiB, expressed in sectors. Every freshly placed partition starts on
/// this boundary.
pub const ALIGN_SECTORS: u64 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Fat32,
    Linux,
    Android,
    EmuMmc,
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Fat32 => "FAT32",
            Category::Linux => "Linux",
            Category::Android => "Android",
            Category::EmuMmc => "emuMMC",
            Category::Unknown => "Unknown",
        }
    }
}

/// An immutable description of a single partition, produced either by the
/// scanner (read off a real disk) or the planner (synthesized for a target
/// layout). Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub category: Category,
    /// 1-byte MBR partition type, 0 when the partition is GPT-only.
    pub mbr_type_id: u8,
    pub type_name: String,
    pub start_sector: u64,
    pub size_sectors: u64,
    pub in_mbr: bool,
    pub in_gpt: bool,
}

impl Partition {
    pub fn size_mib(&self) -> u64 {
        self.size_sectors * SECTOR_SIZE / (1024 * 1024)
    }

    pub fn end_sector_inclusive(&self) -> u64 {
        self.start_sector + self.size_sectors - 1
    }

    pub fn overlaps(&self, other: &Partition) -> bool {
        self.start_sector <= other.end_sector_inclusive()
            && other.start_sector <= self.end_sector_inclusive()
    }
}

/// An ordered collection of partitions (sorted by `start_sector`) plus the
/// disk's total sector count. Owned exclusively by whichever operation
/// produced it; consumers (writer, engine) only ever read it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskLayout {
    partitions: Vec<Partition>,
    pub total_sectors: u64,
}

impl DiskLayout {
    pub fn new(total_sectors: u64) -> Self {
        Self {
            partitions: Vec::new(),
            total_sectors,
        }
    }

    pub fn from_partitions(mut partitions: Vec<Partition>, total_sectors: u64) -> Self {
        partitions.sort_by_key(|p| p.start_sector);
        Self {
            partitions,
            total_sectors,
        }
    }

    pub fn push(&mut self, partition: Partition) {
        // Keep the invariant that partitions are always start-sector ordered,
        // so every derived accessor can assume a left-to-right physical walk.
        let pos = self
            .partitions
            .partition_point(|p| p.start_sector < partition.start_sector);
        self.partitions.insert(pos, partition);
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn fat32(&self) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.category == Category::Fat32)
    }

    pub fn linux(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter().filter(|p| p.category == Category::Linux)
    }

    pub fn android(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter().filter(|p| p.category == Category::Android)
    }

    pub fn emummc(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter().filter(|p| p.category == Category::EmuMmc)
    }

    pub fn has_linux(&self) -> bool {
        self.linux().next().is_some()
    }

    pub fn has_android(&self) -> bool {
        self.android().next().is_some()
    }

    pub fn has_emummc(&self) -> bool {
        self.emummc().next().is_some()
    }

    /// The hybrid table is used iff Android is present.
    pub fn has_gpt(&self) -> bool {
        self.has_android()
    }

    pub fn android_dynamic(&self) -> bool {
        self.android().any(|p| p.name.eq_ignore_ascii_case("super"))
    }

    pub fn emummc_double(&self) -> bool {
        self.emummc().count() >= 2
    }

    pub fn category_size_sectors(&self, category: Category) -> u64 {
        self.partitions
            .iter()
            .filter(|p| p.category == category)
            .map(|p| p.size_sectors)
            .sum()
    }

    pub fn category_size_mib(&self, category: Category) -> u64 {
        self.category_size_sectors(category) * SECTOR_SIZE / (1024 * 1024)
    }

    pub fn used_sectors(&self) -> u64 {
        self.partitions.iter().map(|p| p.size_sectors).sum()
    }

    pub fn free_sectors(&self) -> u64 {
        self.total_sectors.saturating_sub(self.used_sectors())
    }

    /// Check that no two partitions overlap. Used as a post-condition by
    /// the planner and as a scan sanity check.
    pub fn has_overlaps(&self) -> bool {
        self.partitions.windows(2).any(|w| w[0].overlaps(&w[1]))
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(fat32) = self.fat32() {
            parts.push(format!("FAT32: {} MiB", fat32.size_mib()));
        }
        if self.has_linux() {
            parts.push(format!("Linux: {} MiB", self.category_size_mib(Category::Linux)));
        }
        if self.has_android() {
            let kind = if self.android_dynamic() { "Dynamic" } else { "Legacy" };
            parts.push(format!(
                "Android ({kind}): {} MiB",
                self.category_size_mib(Category::Android)
            ));
        }
        if self.has_emummc() {
            let kind = if self.emummc_double() { "Dual" } else { "Single" };
            parts.push(format!(
                "emuMMC ({kind}): {} MiB",
                self.category_size_mib(Category::EmuMmc)
            ));
        }
        let free_mib = self.free_sectors() * SECTOR_SIZE / (1024 * 1024);
        if free_mib > 0 {
            parts.push(format!("Free: {free_mib} MiB"));
        }
        if parts.is_empty() {
            "No partitions".to_string()
        } else {
            parts.join(" | ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn derived_flags_follow_partitions_not_stored_state() {
        let mut layout = DiskLayout::new(1_000_000);
        layout.push(part("hos_data", Category::Fat32, ALIGN_SECTORS, 1_000));
        assert!(!layout.has_android());
        assert!(!layout.has_gpt());

        layout.push(part("super", Category::Android, 2_000, 500));
        assert!(layout.has_android());
        assert!(layout.android_dynamic());
        assert!(layout.has_gpt());
    }

    #[test]
    fn push_keeps_start_sector_order() {
        let mut layout = DiskLayout::new(1_000_000);
        layout.push(part("b", Category::Linux, 5_000, 100));
        layout.push(part("a", Category::Fat32, ALIGN_SECTORS, 100));
        let starts: Vec<u64> = layout.partitions().iter().map(|p| p.start_sector).collect();
        assert_eq!(starts, vec![ALIGN_SECTORS, 5_000]);
    }

    #[test]
    fn overlap_detection() {
        let mut layout = DiskLayout::new(1_000_000);
        layout.push(part("a", Category::Fat32, 100, 100));
        layout.push(part("b", Category::Linux, 150, 100));
        assert!(layout.has_overlaps());
    }

    #[test]
    fn emummc_double_flag() {
        let mut layout = DiskLayout::new(1_000_000);
        layout.push(part("emummc", Category::EmuMmc, 100, 100));
        assert!(!layout.emummc_double());
        layout.push(part("emummc2", Category::EmuMmc, 300, 100));
        assert!(layout.emummc_double());
    }
}
