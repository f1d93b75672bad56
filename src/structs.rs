//! On-disk data structures: the SquashFS 4.0 wire format (little-endian)
//! and the `sqdelta` patch format (big-endian).

use bitflags::bitflags;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, TryFromBytes, Unaligned,
    big_endian,
    little_endian::{U16, U32, U64},
};

/// Magic bytes at the start of every SquashFS archive ("hsqs").
pub const SQUASHFS_MAGIC: [u8; 4] = *b"hsqs";

/// Metadata blocks hold at most 8KiB of uncompressed data.
pub const METADATA_SIZE: usize = 8192;

/// High bit of a metadata block header: the block is stored uncompressed.
pub const METADATA_UNCOMPRESSED: u16 = 1 << 15;

/// Bit 24 of a data-block or fragment size: stored uncompressed.
pub const BLOCK_UNCOMPRESSED: u32 = 1 << 24;

/// Bits 0..=23 of a data-block or fragment size: the on-disk length.
pub const BLOCK_LEN_MASK: u32 = BLOCK_UNCOMPRESSED - 1;

/// Fragment index of a file that does not use a fragment tail.
pub const INVALID_FRAG: u32 = !0;

/// The superblock is the first section of a SquashFS archive.
/// It is always 96 bytes in size and contains the locations of the other
/// sections.
#[repr(C)]
#[derive(Debug, Clone, KnownLayout, FromBytes, IntoBytes, Immutable, Unaligned)]
pub struct Superblock {
    /// Magic number, must be equal to "hsqs"
    pub magic: [u8; 4],
    /// The number of inodes stored in the archive.
    pub inode_count: U32,
    /// Last modification time of the archive, seconds since the epoch.
    pub mod_time: U32,
    /// The size of a data block in bytes. Must be a power of two between 4096 (4k) and 1048576 (1 MiB)
    pub block_size: U32,
    /// The number of entries in the fragment table.
    pub frag_count: U32,
    /// See [CompressorType]
    pub compressor: U16,
    /// The log2 of the block size. If the two fields do not agree, the archive is considered corrupted.
    pub block_log: U16,
    /// See [SuperblockFlags]
    pub flags: U16,
    /// The number of entries in the ID lookup table.
    pub id_count: U16,
    /// Major version of the format. Must be set to 4.
    pub version_major: U16,
    /// Minor version of the format. Must be set to 0.
    pub version_minor: U16,
    /// A reference to the inode of the root directory.
    pub root_inode: U64,
    /// The number of bytes used by the archive. May be less than the file
    /// size because archives are padded to the device block size.
    pub bytes_used: U64,
    /// The byte offset at which the id table starts.
    pub id_table: U64,
    /// The byte offset at which the xattr id table starts.
    pub xattr_table: U64,
    /// The byte offset at which the inode table starts.
    pub inode_table: U64,
    /// The byte offset at which the directory table starts.
    pub dir_table: U64,
    /// The byte offset at which the fragment table starts.
    pub frag_table: U64,
    /// The byte offset at which the export table starts.
    pub export_table: U64,
}

const _: () = {
    assert!(size_of::<Superblock>() == 96);
};

impl Superblock {
    pub fn flags(&self) -> SuperblockFlags {
        SuperblockFlags::from_bits_retain(self.flags.get())
    }
}

/// An ID designating the compressor used for both data and metadata blocks
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, KnownLayout, TryFromBytes)]
pub enum CompressorType {
    Gzip = 1,
    Lzma,
    Lzo,
    Xz,
    Lz4,
    Zstd,
}

/// Flags containing properties of the squashfs system.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct SuperblockFlags(u16);

bitflags! {
    impl SuperblockFlags : u16 {
        /// Inodes are stored uncompressed.
        const INODES_UNCOMPRESSED = 0x0001;
        /// Data blocks are stored uncompressed.
        const DATA_BLOCKS_UNCOMPRESSED = 0x0002;
        /// Fragments are stored uncompressed.
        const FRAGMENTS_UNCOMPRESSED = 0x0008;
        /// Fragments are not used.
        const FRAGMENTS_UNUSED = 0x0010;
        /// Fragments are always generated.
        const FRAGMENTS_ALWAYS = 0x0020;
        /// Data has been deduplicated.
        const DATA_DEDUPLICATED = 0x0040;
        /// NFS export table exists.
        const NFS_EXPORT_EXISTS = 0x0080;
        /// Xattrs are stored uncompressed.
        const XATTRS_UNCOMPRESSED = 0x0100;
        /// There are no Xattrs in the archive.
        const XATTRS_MISSING = 0x0200;
        /// Compressor options are present.
        const COMPRESSOR_OPTIONS = 0x0400;
        /// The ID table is uncompressed.
        const ID_TABLE_UNCOMPRESSED = 0x0800;
    }
}

/// Common 16-byte prefix of every inode record.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct InodeHeader {
    pub inode_type: U16,
    pub mode: U16,
    pub uid: U16,
    pub gid: U16,
    pub mtime: U32,
    pub inode_number: U32,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, KnownLayout, TryFromBytes)]
pub enum InodeKind {
    Dir = 1,
    Reg,
    Symlink,
    BlockDev,
    CharDev,
    Fifo,
    Socket,
    ExtDir,
    ExtReg,
    ExtSymlink,
    ExtBlockDev,
    ExtCharDev,
    ExtFifo,
    ExtSocket,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DirInode {
    pub start_block: U32,
    pub link_count: U32,
    pub file_size: U16,
    pub offset: U16,
    pub parent_inode: U32,
}

/// Extended directory inode; followed by `index_count` [DirIndex] records.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExtDirInode {
    pub link_count: U32,
    pub file_size: U32,
    pub start_block: U32,
    pub parent_inode: U32,
    pub index_count: U16,
    pub offset: U16,
    pub xattr: U32,
}

/// A directory-index record; followed by `name_size + 1` name bytes.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DirIndex {
    pub index: U32,
    pub start: U32,
    pub name_size: U32,
}

/// Regular file inode; followed by the packed block-size list.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RegFileInode {
    pub start_block: U32,
    pub fragment: U32,
    pub offset: U32,
    pub file_size: U32,
}

/// Extended regular file inode; followed by the packed block-size list.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExtFileInode {
    pub start_block: U64,
    pub file_size: U64,
    pub sparse: U64,
    pub link_count: U32,
    pub fragment: U32,
    pub offset: U32,
    pub xattr: U32,
}

/// Symlink inode; followed by `target_size` name bytes.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct SymlinkInode {
    pub link_count: U32,
    pub target_size: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DeviceInode {
    pub link_count: U32,
    pub rdev: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExtDeviceInode {
    pub link_count: U32,
    pub rdev: U32,
    pub xattr: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct IpcInode {
    pub link_count: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExtIpcInode {
    pub link_count: U32,
    pub xattr: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct FragmentEntry {
    /// The offset within the archive where the fragment block starts
    pub start: U64,
    /// The on-disk size of the fragment block. If the block is uncompressed, bit 24 (i.e. 1 << 24) is set.
    pub size: U32,
    pub _unused: U32,
}

const _: () = {
    assert!(size_of::<FragmentEntry>() == 16);
};

/// Magic number identifying a `sqdelta` patch or expanded-image trailer.
pub const DELTA_MAGIC: u32 = 0x5371_CEB4;

/// Fixed header of the patch format. Appears first in a patch file and
/// last in an expanded image, so a consumer can locate it by seeking to
/// the end.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DeltaHeader {
    pub magic: big_endian::U32,
    /// Reserved, zero.
    pub flags: big_endian::U32,
    /// The compressor value reported by the decompressor.
    pub compression: big_endian::U32,
    /// Number of [BlockDescriptor] records accompanying this header.
    pub block_count: big_endian::U32,
}

/// One replaced block: where the hole sits in the expanded image, how long
/// the original compressed payload was, and how long it decompresses to.
/// Payload positions in the appended region follow from cumulative
/// `uncompressed_length` sums.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct BlockDescriptor {
    pub offset: big_endian::U64,
    pub length: big_endian::U32,
    pub uncompressed_length: big_endian::U32,
}

const _: () = {
    assert!(size_of::<DeltaHeader>() == 16);
    assert!(size_of::<BlockDescriptor>() == 16);
};
