//! The decompressor capability shared by the scanner and the expanded-image
//! writer.
//!
//! SquashFS names its compressor in the superblock; only algorithms whose
//! output the reconstruction side can reproduce bit-for-bit are supported,
//! so the set is a closed sum. Variant equality doubles as the algorithm
//! agreement check between the two images.

use zerocopy::{FromBytes, little_endian::U32};

use crate::lzo;
use crate::structs::CompressorType;
use crate::{Error, Result};

/// Compressor-id byte carried in the patch header, shifted into bits 24..32.
const COMP_ID_LZO: u32 = 0x01 << 24;
const COMP_ID_LZ4: u32 = 0x02 << 24;

/// The only LZO algorithm mksquashfs emits that round-trips: lzo1x_999.
const LZO1X_999: u32 = 4;
const LZO_DEFAULT_LEVEL: u32 = 8;

const LZ4_VERSION_LEGACY: u32 = 1;
const LZ4_FLAG_HC: u32 = 1;

/// LZO compressor options stored after the superblock.
#[repr(C)]
#[derive(FromBytes)]
struct LzoOptions {
    algorithm: U32,
    level: U32,
}

/// LZ4 compressor options stored after the superblock. Always present.
#[repr(C)]
#[derive(FromBytes)]
struct Lz4Options {
    version: U32,
    flags: U32,
}

/// Decompressor for one of the supported compression algorithms. One
/// instance serves both images of a run; [Decompressor::reset] is called
/// between images and between the scan and the write pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decompressor {
    Lzo { level: u32 },
    Lz4 { hc: bool },
}

impl Decompressor {
    /// Build a decompressor for the superblock's compressor id.
    pub fn new(kind: CompressorType) -> Result<Self> {
        match kind {
            CompressorType::Lzo => Ok(Self::Lzo {
                level: LZO_DEFAULT_LEVEL,
            }),
            CompressorType::Lz4 => Ok(Self::Lz4 { hc: false }),
            other => Err(Error::UnsupportedCompression(other as u16)),
        }
    }

    /// Apply the compressor-options block stored after the superblock, or
    /// the defaults when the image carries none. LZ4 images always carry
    /// options; LZO images only do when mksquashfs was told non-defaults.
    pub fn setup(&mut self, options: Option<&[u8]>) -> Result<()> {
        match self {
            Self::Lzo { level } => {
                let Some(bytes) = options else {
                    return Ok(());
                };
                let opts = read_options::<LzoOptions>(bytes)?;
                if opts.algorithm.get() != LZO1X_999 {
                    return Err(Error::Format("only lzo1x_999 streams are supported"));
                }
                let requested = opts.level.get();
                if !(1..=9).contains(&requested) {
                    return Err(Error::Format("invalid LZO compression level"));
                }
                *level = requested;
            }
            Self::Lz4 { hc } => {
                let bytes =
                    options.ok_or(Error::Format("LZ4 image without compressor options"))?;
                let opts = read_options::<Lz4Options>(bytes)?;
                if opts.version.get() != LZ4_VERSION_LEGACY {
                    return Err(Error::Format("unsupported LZ4 stream version"));
                }
                if opts.flags.get() & !LZ4_FLAG_HC != 0 {
                    return Err(Error::Format("unknown LZ4 flags"));
                }
                *hc = opts.flags.get() & LZ4_FLAG_HC != 0;
            }
        }
        Ok(())
    }

    /// Decompress one block into `dst`, returning the decompressed length.
    /// Output longer than `dst` is an error, which bounds every payload.
    pub fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        match self {
            Self::Lzo { .. } => {
                lzo::decompress(src, dst).map_err(|err| Error::Format(err.as_str()))
            }
            Self::Lz4 { .. } => lz4_flex::block::decompress_into(src, dst)
                .map_err(|_| Error::Format("LZ4 decompression failed")),
        }
    }

    /// Discard per-image state. Kept in the contract so call sites mark the
    /// image and pass boundaries even while no variant carries state.
    pub fn reset(&mut self) {}

    /// The compressor value recorded in the patch header: algorithm id in
    /// the top byte, algorithm-specific parameters below.
    pub fn compression_value(&self) -> u32 {
        match self {
            Self::Lzo { level } => COMP_ID_LZO | level,
            Self::Lz4 { hc } => COMP_ID_LZ4 | *hc as u32,
        }
    }
}

fn read_options<T: FromBytes>(bytes: &[u8]) -> Result<T> {
    let prefix = bytes
        .get(..size_of::<T>())
        .ok_or(Error::Format("compressor options too short"))?;
    T::read_from_bytes(prefix).map_err(|_| Error::Format("compressor options too short"))
}
