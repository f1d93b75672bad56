//! Squashdelta generates a compact binary delta between two SquashFS 4.0
//! images, so that a recipient holding the source image can reconstruct
//! the target image bit-for-bit.
//!
//! A byte-level delta between two SquashFS images is nearly useless: file
//! contents are stored in independently compressed blocks, so a one-byte
//! change in an input file reshuffles the whole compressed stream. The
//! fix is to diff *expanded* images instead: every compressed block that
//! is unique to one image is replaced by a filesystem hole and its
//! decompressed payload is appended at the end, together with a trailer
//! recording where each block lived. The external delta tool then sees
//! stable bytes everywhere it looks, and the trailer is the recipe for
//! re-compressing and splicing the blocks back.
//!
//! The pipeline:
//!
//! ```text
//! image ─ scan_blocks ─▶ blocks + fingerprints ─┐
//! image ─ scan_blocks ─▶ blocks + fingerprints ─┤ drop_shared_blocks
//!                                               ▼
//!               write_expanded ×2 ─▶ temp files ─▶ xdelta3 ─▶ patch
//! ```

use std::{
    env, fs,
    io::{self, Write},
    path::Path,
    process::ExitStatus,
};

use tracing::{debug, info};
use zerocopy::{FromBytes, IntoBytes, TryFromBytes};

mod blocks;
mod decompression;
mod delta;
mod expand;
mod hash;
mod lzo;
mod readers;
pub mod structs;

pub use blocks::{
    CompressedBlock, drop_shared_blocks, scan_blocks, sort_by_offset, sort_by_signature,
};
pub use decompression::Decompressor;
pub use expand::{SparseWriter, write_expanded};
pub use hash::murmur3;
pub use readers::{
    FileInode, FragmentTableReader, Inode, InodeReader, MetadataBlockReader, MetadataReader,
    MmapReader,
};

use structs::{CompressorType, SQUASHFS_MAGIC, Superblock};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("invalid squashfs image: {0}")]
    Format(&'static str),
    #[error("source and target images use different compressors")]
    CompressorMismatch,
    #[error("unsupported compression algorithm (id {0})")]
    UnsupportedCompression(u16),
    #[error("delta tool failed: {0}")]
    DeltaTool(ExitStatus),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A SquashFS 4.0 image, mapped read-only with its superblock validated.
pub struct Image {
    map: MmapReader,
    superblock: Superblock,
}

impl Image {
    pub fn open(path: &Path) -> Result<Self> {
        let map = MmapReader::open(path)?;
        let superblock =
            Superblock::read_from_bytes(map.slice_at(0, size_of::<Superblock>())?)
                .map_err(|_| Error::Format("superblock unreadable"))?;

        if superblock.magic != SQUASHFS_MAGIC {
            return Err(Error::Format("not a SquashFS image (bad magic)"));
        }
        if superblock.version_major.get() != 4 || superblock.version_minor.get() != 0 {
            return Err(Error::Format("only SquashFS 4.0 is supported"));
        }
        let block_log = superblock.block_log.get();
        if block_log >= 32 || superblock.block_size.get() != 1 << block_log {
            return Err(Error::Format("block size does not match block log"));
        }

        Ok(Self { map, superblock })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn map(&self) -> &MmapReader {
        &self.map
    }

    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn block_size(&self) -> u32 {
        self.superblock.block_size.get()
    }

    pub fn compressor(&self) -> Result<CompressorType> {
        let raw = self.superblock.compressor.get();
        CompressorType::try_read_from_bytes(raw.as_bytes())
            .map_err(|_| Error::UnsupportedCompression(raw))
    }
}

/// Generate a delta between two images and write it to `patch_path`.
///
/// The expanded temporaries live in `TMPDIR` (default `/tmp`); the
/// process changes directory there, so the patch file is opened first to
/// keep its path relative to the caller's working directory.
pub fn generate_delta(source: &Path, target: &Path, patch_path: &Path) -> Result<()> {
    let source_image = Image::open(source)?;
    let target_image = Image::open(target)?;

    if source_image.block_size() != target_image.block_size() {
        return Err(Error::Format("images use different block sizes"));
    }

    // Both images share one decompressor; the algorithms must agree.
    let compressor = source_image.compressor()?;
    if compressor != target_image.compressor()? {
        return Err(Error::CompressorMismatch);
    }
    let mut decomp = Decompressor::new(compressor)?;

    let mut source_blocks = scan_blocks(&source_image, &mut decomp)?;
    decomp.reset();
    let mut target_blocks = scan_blocks(&target_image, &mut decomp)?;
    info!(
        source = source_blocks.len(),
        target = target_blocks.len(),
        "compressed blocks found"
    );

    sort_by_signature(&mut source_blocks);
    sort_by_signature(&mut target_blocks);
    drop_shared_blocks(&mut source_blocks, &mut target_blocks);
    sort_by_offset(&mut source_blocks);
    sort_by_offset(&mut target_blocks);

    let mut patch = fs::File::create(patch_path)?;

    let tmpdir = env::var_os("TMPDIR")
        .filter(|dir| !dir.is_empty())
        .unwrap_or_else(|| "/tmp".into());
    env::set_current_dir(&tmpdir)?;

    // Guards: dropped (and therefore unlinked) on every exit path.
    let source_expanded = tempfile::NamedTempFile::new_in(".")?;
    decomp.reset();
    write_expanded(
        &source_image,
        &mut source_blocks,
        &decomp,
        source_expanded.as_file().try_clone()?,
    )?;

    let target_expanded = tempfile::NamedTempFile::new_in(".")?;
    decomp.reset();
    write_expanded(
        &target_image,
        &mut target_blocks,
        &decomp,
        target_expanded.as_file().try_clone()?,
    )?;

    delta::write_patch_prelude(&mut patch, &source_blocks, &decomp)?;
    patch.flush()?;
    debug!(patch = %patch_path.display(), "patch prelude written");

    delta::run_delta_tool(source_expanded.path(), target_expanded.path(), &patch)?;
    info!(patch = %patch_path.display(), "delta complete");
    Ok(())
}
