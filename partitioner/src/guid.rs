//! Type GUIDs recognized on a hekate hybrid table. Byte order is as they
//! appear on disk (mixed-endian per the GPT spec), not as the textual GUID
//! would print.

/// Microsoft basic data partition, used for the FAT32 `hos_data` partition.
pub const GUID_FAT32: [u8; 16] = [
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
];

/// Linux filesystem data GUID. Shared by `l4t` and Android partitions;
/// disambiguated by name (see `categorize_gpt`).
pub const GUID_LINUX: [u8; 16] = [
    0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4,
];

/// Vendor-specific emuMMC GUID; last six bytes spell "emuMMC" in ASCII.
pub const GUID_EMUMMC: [u8; 16] = [0x00, 0x7E, 0xCA, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, b'e', b'm', b'u', b'M', b'M', b'C'];
