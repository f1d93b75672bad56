//! Locating, fingerprinting and cross-image matching of compressed
//! blocks.

use tracing::debug;

use crate::decompression::Decompressor;
use crate::hash::murmur3;
use crate::readers::{
    FragmentTableReader, Inode, InodeReader, MetadataBlockReader, block_len,
};
use crate::structs::{BLOCK_UNCOMPRESSED, METADATA_SIZE, Superblock, SuperblockFlags};
use crate::{Error, Image, Result};

/// One compressed block of the image. `uncompressed_length` stays zero
/// until the expanded-image writer decompresses the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedBlock {
    /// Absolute offset of the compressed payload in the image.
    pub offset: u64,
    /// On-disk length of the compressed payload.
    pub length: u32,
    pub uncompressed_length: u32,
    /// MurmurHash3 of the compressed payload, seed 0.
    pub hash: u32,
}

impl CompressedBlock {
    fn new(offset: u64, length: u32) -> Self {
        Self {
            offset,
            length,
            uncompressed_length: 0,
            hash: 0,
        }
    }

    /// The dedup key: blocks with equal length and hash are treated as
    /// identical.
    pub fn signature(&self) -> (u32, u32) {
        (self.length, self.hash)
    }
}

/// Scan an image and return every compressed block reachable from its
/// inodes, its inode metadata table and its fragment table, fingerprinted
/// and deduplicated by offset.
pub fn scan_blocks(image: &Image, decomp: &mut Decompressor) -> Result<Vec<CompressedBlock>> {
    let sb = image.superblock();

    // Compressor parameters, stored as a single metadata block right
    // after the superblock when the corresponding flag is set.
    if sb.flags().contains(SuperblockFlags::COMPRESSOR_OPTIONS) {
        let payload = {
            let mut raw =
                MetadataBlockReader::new(image.map(), size_of::<Superblock>() as u64, decomp)?;
            let mut block = [0u8; METADATA_SIZE];
            let decoded = raw.read(&mut block)?;
            block[..decoded].to_vec()
        };
        decomp.setup(Some(&payload))?;
    } else {
        decomp.setup(None)?;
    }

    let mut data = Vec::new();
    let mut metadata = Vec::new();

    // Walk every inode; only regular files contribute data blocks. The
    // block list stores lengths, so the offsets are the running sums from
    // the file's first block.
    let mut inodes = InodeReader::new(image.map(), sb, decomp)?;
    for _ in 0..sb.inode_count.get() {
        if let Inode::File(file) = inodes.read()? {
            let mut pos = file.start_block;
            for &entry in &file.block_sizes {
                let length = block_len(entry);
                if entry != 0 && entry & BLOCK_UNCOMPRESSED == 0 {
                    data.push(CompressedBlock::new(pos, length));
                }
                pos += length as u64;
            }
        }
    }
    let inode_blocks = inodes.block_num()?;
    drop(inodes);

    // The metadata blocks themselves are compressed too. Replay the chain
    // raw; the compressed bytes are already in hand, so hash them now.
    fingerprint_metadata(image, decomp, sb.inode_table.get(), inode_blocks, &mut metadata)?;

    // Fragments are data blocks reached through the fragment table.
    let mut fragments = FragmentTableReader::new(image.map(), sb, decomp)?;
    for _ in 0..sb.frag_count.get() {
        let entry = fragments.read()?;
        let size = entry.size.get();
        if size & BLOCK_UNCOMPRESSED == 0 {
            data.push(CompressedBlock::new(entry.start.get(), block_len(size)));
        }
    }
    let fragment_blocks = fragments.block_num()?;
    let fragment_start = fragments.start_offset;
    drop(fragments);

    fingerprint_metadata(image, decomp, fragment_start, fragment_blocks, &mut metadata)?;

    // Hash the data blocks in offset order so the mapping is touched
    // sequentially. Files can share blocks, so equal offsets collapse to
    // one record here.
    data.sort_unstable_by_key(|block| block.offset);
    let mut blocks: Vec<CompressedBlock> = Vec::with_capacity(data.len() + metadata.len());
    for mut block in data {
        if let Some(previous) = blocks.last() {
            if previous.offset == block.offset {
                if previous.length != block.length {
                    return Err(Error::Format("blocks share an offset but not a length"));
                }
                continue;
            }
        }
        let payload = image.map().slice_at(block.offset, block.length as usize)?;
        block.hash = murmur3(payload, 0);
        blocks.push(block);
    }

    debug!(
        data = blocks.len(),
        metadata = metadata.len(),
        "scanned image"
    );

    blocks.extend(metadata);
    Ok(blocks)
}

fn fingerprint_metadata(
    image: &Image,
    decomp: &Decompressor,
    start: u64,
    count: u64,
    out: &mut Vec<CompressedBlock>,
) -> Result<()> {
    let mut raw = MetadataBlockReader::new(image.map(), start, decomp)?;
    for _ in 0..count {
        let (offset, payload, compressed) = raw.read_input_block()?;
        if compressed {
            out.push(CompressedBlock {
                offset,
                length: payload.len() as u32,
                uncompressed_length: 0,
                hash: murmur3(payload, 0),
            });
        }
    }
    Ok(())
}

/// Order used by the dedup matcher.
pub fn sort_by_signature(blocks: &mut [CompressedBlock]) {
    blocks.sort_unstable_by_key(CompressedBlock::signature);
}

/// Order used by the expanded-image writer.
pub fn sort_by_offset(blocks: &mut [CompressedBlock]) {
    blocks.sort_unstable_by_key(|block| block.offset);
}

/// Remove from both lists every block whose `(length, hash)` signature
/// appears in the other, leaving only the blocks unique to each image.
/// Both lists must be sorted by signature; the relative order of the
/// survivors is preserved. When signatures match, the whole run of equal
/// signatures is dropped on both sides, so the removal is symmetric.
pub fn drop_shared_blocks(
    source: &mut Vec<CompressedBlock>,
    target: &mut Vec<CompressedBlock>,
) {
    let mut kept_source = Vec::with_capacity(source.len());
    let mut kept_target = Vec::with_capacity(target.len());
    let (mut i, mut j) = (0, 0);

    while i < source.len() && j < target.len() {
        let sig_s = source[i].signature();
        let sig_t = target[j].signature();
        match sig_s.cmp(&sig_t) {
            std::cmp::Ordering::Less => {
                kept_source.push(source[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                kept_target.push(target[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                while i < source.len() && source[i].signature() == sig_s {
                    i += 1;
                }
                while j < target.len() && target[j].signature() == sig_s {
                    j += 1;
                }
            }
        }
    }
    kept_source.extend_from_slice(&source[i..]);
    kept_target.extend_from_slice(&target[j..]);

    debug!(
        source = kept_source.len(),
        target = kept_target.len(),
        "blocks unique to each image"
    );

    *source = kept_source;
    *target = kept_target;
}
