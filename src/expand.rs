//! Writing the expanded image: the original byte-for-byte, except every
//! unique compressed block becomes a filesystem hole, with the
//! decompressed payloads appended and a descriptor trailer at the end.

use std::{
    fs::File,
    io::{Seek, SeekFrom, Write},
};

use tracing::debug;
use zerocopy::{IntoBytes, big_endian};

use crate::blocks::CompressedBlock;
use crate::decompression::Decompressor;
use crate::structs::{BlockDescriptor, DELTA_MAGIC, DeltaHeader, METADATA_SIZE};
use crate::{Error, Image, Result};

/// File writer that can skip bytes, leaving sparse regions where the
/// filesystem supports them. `write_hole` extends the file length without
/// writing data, so the skipped range reads back as zeros.
pub struct SparseWriter {
    file: File,
    position: u64,
}

impl SparseWriter {
    pub fn new(file: File) -> Self {
        Self { file, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    pub fn write_hole(&mut self, length: u64) -> Result<()> {
        let end = self.position + length;
        self.file.set_len(end)?;
        self.file.seek(SeekFrom::Start(end))?;
        self.position = end;
        Ok(())
    }
}

/// Write the expanded form of `image` for the given unique blocks, which
/// must be sorted by offset. Fills in each block's `uncompressed_length`.
///
/// Layout: the image with holes punched over the compressed payloads,
/// then the decompressed payloads in list order, then one descriptor per
/// block, then the trailer header (last, so a consumer can seek to it
/// from the end).
pub fn write_expanded(
    image: &Image,
    blocks: &mut [CompressedBlock],
    decomp: &Decompressor,
    file: File,
) -> Result<()> {
    let map = image.map();
    let mut writer = SparseWriter::new(file);

    // Cover pass: copy the gaps between blocks verbatim and skip the
    // blocks themselves. Offset order keeps the writer position strictly
    // monotonic, which is what makes the holes land where the blocks were.
    let mut covered = 0u64;
    for block in blocks.iter() {
        if block.offset < covered {
            return Err(Error::Format("compressed blocks overlap"));
        }
        writer.write(map.slice_at(covered, (block.offset - covered) as usize)?)?;
        writer.write_hole(block.length as u64)?;
        covered = block.offset + block.length as u64;
    }
    writer.write(map.slice_at(covered, (map.len() - covered) as usize)?)?;
    debug_assert_eq!(writer.position(), map.len());

    // Payload pass: append each block's decompressed bytes. Metadata
    // payloads can reach 8KiB even when the data block size is smaller.
    let mut payload = vec![0u8; (image.block_size() as usize).max(METADATA_SIZE)];
    for block in blocks.iter_mut() {
        let src = map.slice_at(block.offset, block.length as usize)?;
        let decoded = decomp.decompress(src, &mut payload)?;
        writer.write(&payload[..decoded])?;
        block.uncompressed_length = decoded as u32;
    }

    for block in blocks.iter() {
        writer.write(descriptor(block).as_bytes())?;
    }
    let header = DeltaHeader {
        magic: big_endian::U32::new(DELTA_MAGIC),
        flags: big_endian::U32::new(0),
        compression: big_endian::U32::new(decomp.compression_value()),
        block_count: big_endian::U32::new(blocks.len() as u32),
    };
    writer.write(header.as_bytes())?;

    debug!(
        blocks = blocks.len(),
        expanded = writer.position(),
        original = map.len(),
        "wrote expanded image"
    );
    Ok(())
}

pub(crate) fn descriptor(block: &CompressedBlock) -> BlockDescriptor {
    BlockDescriptor {
        offset: big_endian::U64::new(block.offset),
        length: big_endian::U32::new(block.length),
        uncompressed_length: big_endian::U32::new(block.uncompressed_length),
    }
}
