//! Shared test helpers: build small synthetic SquashFS 4.0 images in
//! memory and write them to temp files.
//!
//! The builder emits exactly one regular file plus an optional fragment
//! tail, which is enough surface for the scanner: data blocks in all
//! three encodings (compressed, stored, sparse), the compressor-options
//! block, the inode table and the two-level fragment table.

use std::io::Write;
use std::path::Path;

use squashdelta::structs::{
    BLOCK_UNCOMPRESSED, CompressorType, FragmentEntry, INVALID_FRAG, InodeHeader,
    METADATA_UNCOMPRESSED, RegFileInode, SQUASHFS_MAGIC, Superblock, SuperblockFlags,
};
use squashdelta::{CompressedBlock, Decompressor, Image, scan_blocks};
use zerocopy::IntoBytes;
use zerocopy::little_endian::{U16, U32, U64};

pub const BLOCK_SIZE: u32 = 4096;
pub const BLOCK_LOG: u16 = 12;

/// One entry of the test file's block list.
pub enum BlockSpec {
    /// Content is LZ4-compressed into the image. Must be exactly
    /// BLOCK_SIZE long unless it is the file's final block.
    Compressed(Vec<u8>),
    /// Content is stored verbatim with the uncompressed bit set.
    Stored(Vec<u8>),
    /// A full block of zeros, encoded as a zero-length entry.
    Sparse,
}

pub struct ImageSpec {
    pub blocks: Vec<BlockSpec>,
    /// Fragment tail content, LZ4-compressed into a fragment block.
    pub tail: Option<Vec<u8>>,
    pub compressor: CompressorType,
    pub emit_options: bool,
    /// LZ4-compress the inode table instead of storing it.
    pub compress_metadata: bool,
    pub block_size: u32,
    pub block_log: u16,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            blocks: Vec::new(),
            tail: None,
            compressor: CompressorType::Lz4,
            emit_options: true,
            compress_metadata: false,
            block_size: BLOCK_SIZE,
            block_log: BLOCK_LOG,
        }
    }
}

/// A compressed region the scanner is expected to report.
pub struct ExpectedBlock {
    pub offset: u64,
    pub length: u32,
    /// What the region decompresses to.
    pub content: Vec<u8>,
}

pub struct BuiltImage {
    pub bytes: Vec<u8>,
    /// Every compressed region in offset order: data blocks, the
    /// fragment, and (when metadata compression is on) metadata blocks.
    pub expected: Vec<ExpectedBlock>,
}

fn push_stored_metadata(bytes: &mut Vec<u8>, payload: &[u8]) {
    let header = METADATA_UNCOMPRESSED | payload.len() as u16;
    bytes.extend_from_slice(&header.to_le_bytes());
    bytes.extend_from_slice(payload);
}

fn push_compressed_metadata(bytes: &mut Vec<u8>, payload: &[u8]) -> ExpectedBlock {
    let compressed = lz4_flex::block::compress(payload);
    bytes.extend_from_slice(&(compressed.len() as u16).to_le_bytes());
    let offset = bytes.len() as u64;
    let length = compressed.len() as u32;
    bytes.extend_from_slice(&compressed);
    ExpectedBlock {
        offset,
        length,
        content: payload.to_vec(),
    }
}

pub fn build_image(spec: &ImageSpec) -> BuiltImage {
    let mut bytes = vec![0u8; size_of::<Superblock>()];
    let mut expected = Vec::new();

    if spec.emit_options {
        // LZ4 compressor options: version 1 (legacy), no flags.
        let mut options = 1u32.to_le_bytes().to_vec();
        options.extend_from_slice(&0u32.to_le_bytes());
        push_stored_metadata(&mut bytes, &options);
    }

    // Data blocks, back to back from the file's start_block.
    let start_block = bytes.len() as u64;
    let mut entries = Vec::new();
    let mut file_size = 0u64;
    for block in &spec.blocks {
        match block {
            BlockSpec::Compressed(content) => {
                let compressed = lz4_flex::block::compress(content);
                entries.push(compressed.len() as u32);
                expected.push(ExpectedBlock {
                    offset: bytes.len() as u64,
                    length: compressed.len() as u32,
                    content: content.clone(),
                });
                bytes.extend_from_slice(&compressed);
                file_size += content.len() as u64;
            }
            BlockSpec::Stored(content) => {
                entries.push(content.len() as u32 | BLOCK_UNCOMPRESSED);
                bytes.extend_from_slice(content);
                file_size += content.len() as u64;
            }
            BlockSpec::Sparse => {
                entries.push(0);
                file_size += spec.block_size as u64;
            }
        }
    }

    let fragment = spec.tail.as_ref().map(|tail| {
        let compressed = lz4_flex::block::compress(tail);
        let offset = bytes.len() as u64;
        let length = compressed.len() as u32;
        expected.push(ExpectedBlock {
            offset,
            length,
            content: tail.clone(),
        });
        bytes.extend_from_slice(&compressed);
        file_size += tail.len() as u64;
        (offset, length)
    });

    // Inode table: a single metadata block holding one regular file.
    let inode_table = bytes.len() as u64;
    let mut inode = Vec::new();
    inode.extend_from_slice(
        InodeHeader {
            inode_type: U16::new(2),
            mode: U16::new(0o644),
            uid: U16::new(0),
            gid: U16::new(0),
            mtime: U32::new(0),
            inode_number: U32::new(1),
        }
        .as_bytes(),
    );
    inode.extend_from_slice(
        RegFileInode {
            start_block: U32::new(start_block as u32),
            fragment: U32::new(if fragment.is_some() { 0 } else { INVALID_FRAG }),
            offset: U32::new(0),
            file_size: U32::new(file_size as u32),
        }
        .as_bytes(),
    );
    for entry in &entries {
        inode.extend_from_slice(&entry.to_le_bytes());
    }
    if spec.compress_metadata {
        let block = push_compressed_metadata(&mut bytes, &inode);
        expected.push(block);
    } else {
        push_stored_metadata(&mut bytes, &inode);
    }

    // Fragment table: one metadata block of entries, then the index of
    // pointers to those blocks.
    let (frag_table, frag_count) = match fragment {
        Some((offset, length)) => {
            let entry_block = bytes.len() as u64;
            push_stored_metadata(
                &mut bytes,
                FragmentEntry {
                    start: U64::new(offset),
                    size: U32::new(length),
                    _unused: U32::new(0),
                }
                .as_bytes(),
            );
            let index = bytes.len() as u64;
            bytes.extend_from_slice(&entry_block.to_le_bytes());
            (index, 1u32)
        }
        None => (bytes.len() as u64, 0),
    };

    let flags = if spec.emit_options {
        SuperblockFlags::COMPRESSOR_OPTIONS.bits()
    } else {
        0
    };
    let superblock = Superblock {
        magic: SQUASHFS_MAGIC,
        inode_count: U32::new(1),
        mod_time: U32::new(0),
        block_size: U32::new(spec.block_size),
        frag_count: U32::new(frag_count),
        compressor: U16::new(spec.compressor as u16),
        block_log: U16::new(spec.block_log),
        flags: U16::new(flags),
        id_count: U16::new(0),
        version_major: U16::new(4),
        version_minor: U16::new(0),
        root_inode: U64::new(0),
        bytes_used: U64::new(bytes.len() as u64),
        id_table: U64::new(!0),
        xattr_table: U64::new(!0),
        inode_table: U64::new(inode_table),
        dir_table: U64::new(!0),
        frag_table: U64::new(frag_table),
        export_table: U64::new(!0),
    };
    bytes[..size_of::<Superblock>()].copy_from_slice(superblock.as_bytes());

    expected.sort_by_key(|block| block.offset);
    BuiltImage { bytes, expected }
}

pub fn write_image(image: &BuiltImage) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image.bytes).unwrap();
    file.flush().unwrap();
    file
}

pub fn open_and_scan(path: &Path) -> (Image, Decompressor, Vec<CompressedBlock>) {
    let image = Image::open(path).unwrap();
    let mut decomp = Decompressor::new(image.compressor().unwrap()).unwrap();
    let blocks = scan_blocks(&image, &mut decomp).unwrap();
    (image, decomp, blocks)
}

/// Content that LZ4 can actually shrink.
pub fn repetitive(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i / 64) as u8)).collect()
}
