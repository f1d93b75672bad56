//! Patch assembly: the `sqdelta` header, the source block descriptors,
//! and the external delta tool whose output follows them.

use std::{
    fs::File,
    io::Write,
    path::Path,
    process::{Command, Stdio},
};

use tracing::debug;
use zerocopy::{IntoBytes, big_endian};

use crate::blocks::CompressedBlock;
use crate::decompression::Decompressor;
use crate::expand::descriptor;
use crate::structs::{DELTA_MAGIC, DeltaHeader};
use crate::{Error, Result};

/// The delta tool and its fixed argument set are part of the patch
/// format: the reconstruction side invokes the decoder with matching
/// parameters.
const DELTA_TOOL: &str = "xdelta3";
const DELTA_TOOL_ARGS: [&str; 4] = ["-9", "-S", "djw", "-e"];

/// Write the patch header and the source image's block descriptors. The
/// reconstruction side needs them to re-expand the source image it holds;
/// the target's descriptors travel inside the delta as the expanded
/// target's trailer.
pub fn write_patch_prelude(
    patch: &mut File,
    blocks: &[CompressedBlock],
    decomp: &Decompressor,
) -> Result<()> {
    let header = DeltaHeader {
        magic: big_endian::U32::new(DELTA_MAGIC),
        flags: big_endian::U32::new(0),
        compression: big_endian::U32::new(decomp.compression_value()),
        block_count: big_endian::U32::new(blocks.len() as u32),
    };
    patch.write_all(header.as_bytes())?;
    for block in blocks {
        patch.write_all(descriptor(block).as_bytes())?;
    }
    Ok(())
}

/// Run the delta tool over the two expanded files, its standard output
/// appended to `patch` at the current offset. The child inherits stderr
/// so its diagnostics reach the user.
pub fn run_delta_tool(source: &Path, target: &Path, patch: &File) -> Result<()> {
    debug!(tool = DELTA_TOOL, "running external delta tool");
    let status = Command::new(DELTA_TOOL)
        .args(DELTA_TOOL_ARGS)
        .arg("-s")
        .arg(source)
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::from(patch.try_clone()?))
        .status()?;
    if !status.success() {
        return Err(Error::DeltaTool(status));
    }
    Ok(())
}
