//! EROFS on-disk format definitions.
//!
//! The binary layout of the superblock, the two inode record variants and
//! directory entries, using zerocopy-based little-endian types.  The
//! structures here mirror the disk byte-for-byte; conversion to richer enum
//! values is handled separately.

use std::fmt;
use std::mem::size_of;

use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::fs::FileType;

pub const BLOCK_BITS: u8 = 12;
pub const BLOCK_SIZE: u64 = 1 << BLOCK_BITS;

/// Offset of the superblock within the image.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

pub const MAGIC_V1: u32 = 0xE0F5_E1E2;

/// Inode records are aligned to 32-byte slots; a nid is a slot index into
/// the metadata region.
pub const INODE_SLOT_BITS: u8 = 5;
pub const INODE_SLOT_SIZE: u64 = 1 << INODE_SLOT_BITS;

/// Dirent names are at most this long.
pub const MAX_NAME_LEN: usize = 255;

/// Compatible feature bit: the superblock carries a checksum.
pub const FEATURE_COMPAT_SB_CHECKSUM: u32 = 0x0000_0001;

/// No incompatible features are supported.
pub const FEATURE_INCOMPAT_SUPPORTED: u32 = 0;

/// Returns the bits in `[bit, bit + width)` of `value`.
pub fn get_bits(value: u16, bit: u16, width: u16) -> u16 {
    (value >> bit) & ((1 << width) - 1)
}

/// Returns `value` with the bits in `[bit, bit + width)` replaced by `new`.
pub fn set_bits(value: u16, new: u16, bit: u16, width: u16) -> u16 {
    let mask = ((1 << width) - 1) << bit;
    (value & !mask) | ((new << bit) & mask)
}

const INODE_LAYOUT_BIT: u16 = 0;
const INODE_LAYOUT_WIDTH: u16 = 1;

const DATA_LAYOUT_BIT: u16 = 1;
const DATA_LAYOUT_WIDTH: u16 = 3;

/// Which of the two inode record variants is on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeLayout {
    Compact = 0,
    Extended = 1,
}

/// How an inode's data is laid out.  Only `FlatPlain` and `FlatInline` are
/// supported by this engine; the remaining variants exist so that foreign
/// images decode into a nameable value before being rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum DataLayout {
    FlatPlain = 0,
    FlatCompressionLegacy = 1,
    FlatInline = 2,
    FlatCompression = 3,
    ChunkBased = 4,
}

impl DataLayout {
    fn from_bits(bits: u16) -> Option<DataLayout> {
        Some(match bits {
            0 => DataLayout::FlatPlain,
            1 => DataLayout::FlatCompressionLegacy,
            2 => DataLayout::FlatInline,
            3 => DataLayout::FlatCompression,
            4 => DataLayout::ChunkBased,
            _ => return None,
        })
    }
}

/// The packed `format` field of an inode record: bit 0 selects the record
/// variant, bits 1..4 the data layout.
#[derive(Clone, Copy, Default, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
pub struct FormatField(pub U16);

impl FormatField {
    pub fn new(layout: InodeLayout, data_layout: DataLayout) -> FormatField {
        let mut value = set_bits(0, layout as u16, INODE_LAYOUT_BIT, INODE_LAYOUT_WIDTH);
        value = set_bits(value, data_layout as u16, DATA_LAYOUT_BIT, DATA_LAYOUT_WIDTH);
        FormatField(value.into())
    }

    pub fn layout(self) -> InodeLayout {
        match get_bits(self.0.get(), INODE_LAYOUT_BIT, INODE_LAYOUT_WIDTH) {
            0 => InodeLayout::Compact,
            _ => InodeLayout::Extended,
        }
    }

    /// `None` for bit patterns outside the defined data layouts.
    pub fn data_layout(self) -> Option<DataLayout> {
        DataLayout::from_bits(get_bits(self.0.get(), DATA_LAYOUT_BIT, DATA_LAYOUT_WIDTH))
    }
}

impl fmt::Debug for FormatField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} = {:?} | {:?}",
            self.0.get(),
            self.layout(),
            self.data_layout()
        )
    }
}

/// On-disk file type of a dirent.
#[derive(Clone, Copy, Default, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
pub struct FileTypeField(pub u8);

impl From<FileTypeField> for FileType {
    fn from(value: FileTypeField) -> FileType {
        match value.0 {
            1 => FileType::Regular,
            2 => FileType::Directory,
            3 => FileType::CharacterDevice,
            4 => FileType::BlockDevice,
            5 => FileType::Fifo,
            6 => FileType::Socket,
            7 => FileType::Symlink,
            // Non-injective, but only reached for foreign images.
            _ => FileType::Unknown,
        }
    }
}

impl From<FileType> for FileTypeField {
    fn from(value: FileType) -> FileTypeField {
        FileTypeField(value as u8)
    }
}

impl fmt::Debug for FileTypeField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&FileType::from(*self), f)
    }
}

/// On-disk superblock, 128 bytes at offset 1024.
#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Superblock {
    // vertical whitespace every 16 bytes (hexdump-friendly)
    pub magic: U32,
    pub checksum: U32,
    pub feature_compat: U32,
    pub blkszbits: u8,
    pub extslots: u8,
    pub root_nid: U16,

    pub inos: U64,
    pub build_time: U64,

    pub build_time_nsec: U32,
    pub blocks: U32,
    pub meta_blkaddr: U32,
    pub xattr_blkaddr: U32,

    pub uuid: [u8; 16],

    pub volume_name: [u8; 16],

    pub feature_incompat: U32,
    pub available_compr_algs: U16,
    pub extra_devices: U16,
    pub devt_slotoff: U16,
    pub dirblkbits: u8,
    pub xattr_prefix_count: u8,
    pub xattr_prefix_start: U32,

    pub packed_nid: U64,
    pub reserved2: [u8; 24],
}

impl Superblock {
    pub fn block_size(&self) -> u64 {
        1 << self.blkszbits
    }

    /// Byte offset of the block with the given address.
    pub fn block_addr_to_offset(&self, addr: u32) -> u64 {
        u64::from(addr) << self.blkszbits
    }

    /// Byte offset where the metadata region begins.
    pub fn meta_offset(&self) -> u64 {
        self.block_addr_to_offset(self.meta_blkaddr.get())
    }

    /// Byte offset of the inode record with the given nid.
    pub fn nid_to_offset(&self, nid: u64) -> u64 {
        self.meta_offset() + (nid << INODE_SLOT_BITS)
    }
}

/// Computes the superblock checksum: CRC32 with the Castagnoli polynomial
/// over the 128-byte record with its `checksum` field zeroed, continued over
/// the remainder of the first block, with the combined value inverted.  On
/// encode the trailer is all zeros (block 0 holds nothing but the
/// superblock); on verify it is the image's bytes 1152..4096.
pub fn superblock_checksum(sb: &Superblock, trailer: &[u8]) -> u32 {
    let mut sb = sb.clone();
    sb.checksum = 0.into();
    !crc32c::crc32c_append(crc32c::crc32c(sb.as_bytes()), trailer)
}

/// 32-byte reduced form of the on-disk inode.
#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct CompactInode {
    pub format: FormatField,
    pub xattr_count: U16,
    pub mode: U16,
    pub nlink: U16,

    pub size: U32,
    pub reserved: U32,

    pub raw_block_addr: U32,
    pub ino: U32,

    pub uid: U16,
    pub gid: U16,
    pub reserved2: U32,
}

/// 64-byte complete form of the on-disk inode.
#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ExtendedInode {
    pub format: FormatField,
    pub xattr_count: U16,
    pub mode: U16,
    pub reserved: U16,
    pub size: U64,

    pub raw_block_addr: U32,
    pub ino: U32,
    pub uid: U32,
    pub gid: U32,

    pub mtime: U64,

    pub mtime_nsec: U32,
    pub nlink: U32,

    pub reserved2: [u8; 16],
}

/// On-disk directory entry.  The name bytes live after the dirent array of
/// the containing block, at `name_off` from the block base.
#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Dirent {
    pub nid: U64,
    pub name_off: U16,
    pub file_type: FileTypeField,
    pub reserved: u8,
}

pub const DIRENT_SIZE: u64 = size_of::<Dirent>() as u64;

/// Rounds `n` up to the nearest multiple of the power of two `to`.
pub fn round_up(n: u64, to: u64) -> u64 {
    (n + to - 1) & !(to - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(size_of::<Superblock>(), 128);
        assert_eq!(size_of::<CompactInode>(), 32);
        assert_eq!(size_of::<ExtendedInode>(), 64);
        assert_eq!(size_of::<Dirent>(), 12);
    }

    #[test]
    fn test_bit_helpers() {
        assert_eq!(get_bits(0b0110, 1, 3), 0b011);
        assert_eq!(set_bits(0, 0b101, 1, 3), 0b1010);
        assert_eq!(set_bits(0b1111, 0, 1, 3), 0b0001);
        // Width masks out excess bits of the new value.
        assert_eq!(set_bits(0, 0xffff, 1, 3), 0b1110);
    }

    #[test]
    fn test_format_field() {
        let f = FormatField::new(InodeLayout::Extended, DataLayout::FlatInline);
        assert_eq!(f.0.get(), 0b101);
        assert_eq!(f.layout(), InodeLayout::Extended);
        assert_eq!(f.data_layout(), Some(DataLayout::FlatInline));

        let f = FormatField::new(InodeLayout::Compact, DataLayout::FlatPlain);
        assert_eq!(f.0.get(), 0);
        assert_eq!(f.layout(), InodeLayout::Compact);
        assert_eq!(f.data_layout(), Some(DataLayout::FlatPlain));

        assert_eq!(FormatField(0b1110.into()).data_layout(), None);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 32), 0);
        assert_eq!(round_up(1, 32), 32);
        assert_eq!(round_up(32, 32), 32);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    fn test_checksum_stability() {
        let mut sb = Superblock {
            magic: MAGIC_V1.into(),
            blkszbits: BLOCK_BITS,
            feature_compat: FEATURE_COMPAT_SB_CHECKSUM.into(),
            ..Default::default()
        };
        let trailer = vec![0u8; (BLOCK_SIZE - SUPERBLOCK_OFFSET) as usize - 128];
        let sum = superblock_checksum(&sb, &trailer);
        sb.checksum = sum.into();
        // The checksum field itself is excluded from the computation.
        assert_eq!(superblock_checksum(&sb, &trailer), sum);
    }
}
