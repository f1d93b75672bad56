//! Readers layered over the image: a memory-mapped byte reader with a
//! cursor, the metadata stream decoder, and the inode and fragment-table
//! iterators built on top of it.

use std::{fs, io, path::Path, sync::Arc};

use memmap2::Mmap;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, TryFromBytes, Unaligned,
    little_endian::{U16, U64},
};

use crate::decompression::Decompressor;
use crate::structs::{
    self, BLOCK_LEN_MASK, INVALID_FRAG, InodeHeader, InodeKind, METADATA_SIZE,
    METADATA_UNCOMPRESSED, Superblock,
};
use crate::{Error, Result};

fn eof() -> Error {
    Error::Io(io::ErrorKind::UnexpectedEof.into())
}

/// Read-only memory-mapped view of an image with a cursor. Cloning yields
/// a subordinate reader with its own cursor over the same mapping.
#[derive(Clone)]
pub struct MmapReader {
    map: Arc<Mmap>,
    pos: u64,
}

impl MmapReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        // Safety: the mapping is read-only and the file is not expected to
        // be modified while the tool runs.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            map: Arc::new(map),
            pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.len() {
            return Err(eof());
        }
        self.pos = offset;
        Ok(())
    }

    pub fn skip(&mut self, count: u64) -> Result<()> {
        self.seek(self.pos + count)
    }

    /// Borrow `len` bytes at an absolute offset, without moving the cursor.
    pub fn slice_at(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len as u64).ok_or_else(eof)?;
        if end > self.len() {
            return Err(eof());
        }
        Ok(&self.map[offset as usize..end as usize])
    }

    /// Borrow the next `size_of::<T>()` bytes as a `T` and advance.
    pub fn read_typed<T>(&mut self) -> Result<&T>
    where
        T: FromBytes + KnownLayout + Immutable + Unaligned,
    {
        let start = self.pos;
        let end = start.checked_add(size_of::<T>() as u64).ok_or_else(eof)?;
        if end > self.len() {
            return Err(eof());
        }
        self.pos = end;
        let bytes = &self.map[start as usize..end as usize];
        T::ref_from_bytes(bytes).map_err(|_| Error::Format("unreadable on-disk record"))
    }

    /// Borrow the next `n` records as a slice and advance.
    pub fn read_array<T>(&mut self, n: usize) -> Result<&[T]>
    where
        T: FromBytes + KnownLayout + Immutable + Unaligned,
    {
        let start = self.pos;
        let byte_len = size_of::<T>().checked_mul(n).ok_or_else(eof)?;
        let end = start.checked_add(byte_len as u64).ok_or_else(eof)?;
        if end > self.len() {
            return Err(eof());
        }
        self.pos = end;
        let bytes = &self.map[start as usize..end as usize];
        <[T]>::ref_from_bytes(bytes).map_err(|_| Error::Format("unreadable on-disk record"))
    }
}

/// Reads the chain of metadata blocks one block at a time: each starts
/// with a 16-bit header whose low 15 bits give the on-disk length and
/// whose high bit marks the block as stored uncompressed.
pub struct MetadataBlockReader<'a> {
    file: MmapReader,
    decomp: &'a Decompressor,
}

impl<'a> MetadataBlockReader<'a> {
    pub fn new(map: &MmapReader, offset: u64, decomp: &'a Decompressor) -> Result<Self> {
        let mut file = map.clone();
        file.seek(offset)?;
        Ok(Self { file, decomp })
    }

    /// Decode the next block into `dest` (which must hold
    /// [METADATA_SIZE] bytes) and return the decoded length.
    pub fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        let decomp = self.decomp;
        let (_, data, compressed) = self.read_input_block()?;
        if compressed {
            decomp.decompress(data, dest)
        } else {
            let out = dest
                .get_mut(..data.len())
                .ok_or(Error::Format("metadata block larger than buffer"))?;
            out.copy_from_slice(data);
            Ok(data.len())
        }
    }

    /// Advance past the next block without decoding it, returning the
    /// absolute offset of its payload, the raw payload bytes, and whether
    /// it is compressed. Used to fingerprint metadata blocks.
    pub fn read_input_block(&mut self) -> Result<(u64, &[u8], bool)> {
        let header = self.file.read_typed::<U16>()?.get();
        let length = (header & !METADATA_UNCOMPRESSED) as usize;
        let compressed = header & METADATA_UNCOMPRESSED == 0;
        if length == 0 {
            return Err(Error::Format("zero-length metadata block"));
        }
        if length > METADATA_SIZE {
            return Err(Error::Format("oversized metadata block"));
        }
        let offset = self.file.position();
        let data = self.file.read_array::<u8>(length)?;
        Ok((offset, data, compressed))
    }
}

/// Presents the decoded metadata blocks as one unbounded logical byte
/// stream; reads may straddle block boundaries.
pub struct MetadataReader<'a> {
    blocks: MetadataBlockReader<'a>,
    buf: Vec<u8>,
    start: usize,
    blocks_read: u64,
}

impl<'a> MetadataReader<'a> {
    pub fn new(map: &MmapReader, offset: u64, decomp: &'a Decompressor) -> Result<Self> {
        Ok(Self {
            blocks: MetadataBlockReader::new(map, offset, decomp)?,
            buf: Vec::with_capacity(2 * METADATA_SIZE),
            start: 0,
            blocks_read: 0,
        })
    }

    fn fill(&mut self) -> Result<()> {
        // Shift out consumed bytes once a block's worth has accumulated.
        if self.start >= METADATA_SIZE {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        let mut block = [0u8; METADATA_SIZE];
        let decoded = self.blocks.read(&mut block)?;
        if decoded == 0 {
            return Err(Error::Format("empty metadata block"));
        }
        self.buf.extend_from_slice(&block[..decoded]);
        self.blocks_read += 1;
        Ok(())
    }

    fn ensure(&mut self, len: usize) -> Result<()> {
        while self.buf.len() - self.start < len {
            self.fill()?;
        }
        Ok(())
    }

    /// Read the next `size_of::<T>()` bytes as an owned `T`.
    pub fn read_typed<T: FromBytes>(&mut self) -> Result<T> {
        self.ensure(size_of::<T>())?;
        let bytes = &self.buf[self.start..self.start + size_of::<T>()];
        let value =
            T::read_from_bytes(bytes).map_err(|_| Error::Format("truncated metadata record"))?;
        self.start += size_of::<T>();
        Ok(value)
    }

    pub fn read_bytes(&mut self, mut out: &mut [u8]) -> Result<()> {
        while !out.is_empty() {
            if self.start == self.buf.len() {
                self.fill()?;
            }
            let available = &self.buf[self.start..];
            let step = available.len().min(out.len());
            let (head, tail) = out.split_at_mut(step);
            head.copy_from_slice(&available[..step]);
            self.start += step;
            out = tail;
        }
        Ok(())
    }

    pub fn skip(&mut self, mut count: u64) -> Result<()> {
        while count > 0 {
            if self.start == self.buf.len() {
                self.fill()?;
            }
            let step = ((self.buf.len() - self.start) as u64).min(count);
            self.start += step as usize;
            count -= step;
        }
        Ok(())
    }

    /// Number of metadata blocks consumed so far. The stream must sit
    /// exactly on a block boundary, otherwise the table was truncated.
    pub fn block_num(&self) -> Result<u64> {
        if self.start != self.buf.len() {
            return Err(Error::Format("metadata ended mid-block"));
        }
        Ok(self.blocks_read)
    }
}

/// A regular file inode, normalized over the basic and extended layouts.
/// The only inode kind that references data blocks.
pub struct FileInode {
    /// Absolute offset of the file's first data block.
    pub start_block: u64,
    pub file_size: u64,
    /// Fragment-table index of the tail, or [INVALID_FRAG].
    pub fragment: u32,
    /// Packed on-disk block sizes: bits 0..=23 length, bit 24 stored
    /// uncompressed, zero for a sparse block.
    pub block_sizes: Vec<u32>,
}

pub enum Inode {
    File(FileInode),
    /// Directories, symlinks, devices and IPC nodes carry no data blocks;
    /// they are decoded only to keep the stream position correct.
    Other,
}

/// Walks all inodes of the archive through the inode-table metadata
/// stream.
pub struct InodeReader<'a> {
    stream: MetadataReader<'a>,
    inode_num: u32,
    inode_count: u32,
    block_size: u32,
    block_log: u16,
}

impl<'a> InodeReader<'a> {
    pub fn new(map: &MmapReader, sb: &Superblock, decomp: &'a Decompressor) -> Result<Self> {
        Ok(Self {
            stream: MetadataReader::new(map, sb.inode_table.get(), decomp)?,
            inode_num: 0,
            inode_count: sb.inode_count.get(),
            block_size: sb.block_size.get(),
            block_log: sb.block_log.get(),
        })
    }

    pub fn read(&mut self) -> Result<Inode> {
        if self.inode_num >= self.inode_count {
            return Err(Error::Format("read past the last inode"));
        }
        self.inode_num += 1;

        let header: InodeHeader = self.stream.read_typed()?;
        let kind = InodeKind::try_read_from_bytes(header.inode_type.get().as_bytes())
            .map_err(|_| Error::Format("invalid inode type"))?;

        match kind {
            InodeKind::Reg => {
                let raw: structs::RegFileInode = self.stream.read_typed()?;
                let file_size = raw.file_size.get() as u64;
                let fragment = raw.fragment.get();
                let block_sizes = self.read_block_sizes(file_size, fragment)?;
                Ok(Inode::File(FileInode {
                    start_block: raw.start_block.get() as u64,
                    file_size,
                    fragment,
                    block_sizes,
                }))
            }
            InodeKind::ExtReg => {
                let raw: structs::ExtFileInode = self.stream.read_typed()?;
                let file_size = raw.file_size.get();
                let fragment = raw.fragment.get();
                let block_sizes = self.read_block_sizes(file_size, fragment)?;
                Ok(Inode::File(FileInode {
                    start_block: raw.start_block.get(),
                    file_size,
                    fragment,
                    block_sizes,
                }))
            }
            InodeKind::Dir => {
                let _: structs::DirInode = self.stream.read_typed()?;
                Ok(Inode::Other)
            }
            InodeKind::ExtDir => {
                let raw: structs::ExtDirInode = self.stream.read_typed()?;
                // The directory indexes that follow are variable length.
                for _ in 0..raw.index_count.get() {
                    let index: structs::DirIndex = self.stream.read_typed()?;
                    self.stream.skip(index.name_size.get() as u64 + 1)?;
                }
                Ok(Inode::Other)
            }
            InodeKind::Symlink | InodeKind::ExtSymlink => {
                let raw: structs::SymlinkInode = self.stream.read_typed()?;
                self.stream.skip(raw.target_size.get() as u64)?;
                Ok(Inode::Other)
            }
            InodeKind::BlockDev | InodeKind::CharDev => {
                let _: structs::DeviceInode = self.stream.read_typed()?;
                Ok(Inode::Other)
            }
            InodeKind::ExtBlockDev | InodeKind::ExtCharDev => {
                let _: structs::ExtDeviceInode = self.stream.read_typed()?;
                Ok(Inode::Other)
            }
            InodeKind::Fifo | InodeKind::Socket => {
                let _: structs::IpcInode = self.stream.read_typed()?;
                Ok(Inode::Other)
            }
            InodeKind::ExtFifo | InodeKind::ExtSocket => {
                let _: structs::ExtIpcInode = self.stream.read_typed()?;
                Ok(Inode::Other)
            }
        }
    }

    fn read_block_sizes(&mut self, file_size: u64, fragment: u32) -> Result<Vec<u32>> {
        let count = file_block_count(file_size, fragment, self.block_size, self.block_log);
        let mut sizes = Vec::with_capacity(count as usize);
        let mut raw = [0u8; 4];
        for _ in 0..count {
            self.stream.read_bytes(&mut raw)?;
            sizes.push(u32::from_le_bytes(raw));
        }
        Ok(sizes)
    }

    pub fn block_num(&self) -> Result<u64> {
        self.stream.block_num()
    }
}

/// Number of entries in a file inode's block list. A file with a fragment
/// tail rounds down (the tail lives in the fragment table); one without
/// rounds up.
pub(crate) fn file_block_count(
    file_size: u64,
    fragment: u32,
    block_size: u32,
    block_log: u16,
) -> u64 {
    if fragment == INVALID_FRAG {
        (file_size + block_size as u64 - 1) >> block_log
    } else {
        file_size >> block_log
    }
}

/// Iterates the fragment table: a packed index of pointers to metadata
/// blocks that hold runs of 16-byte fragment entries.
pub struct FragmentTableReader<'a> {
    stream: MetadataReader<'a>,
    entry_num: u32,
    entry_count: u32,
    /// Offset of the first metadata block of the chain, kept for the
    /// fingerprinting replay.
    pub start_offset: u64,
}

impl<'a> FragmentTableReader<'a> {
    pub fn new(map: &MmapReader, sb: &Superblock, decomp: &'a Decompressor) -> Result<Self> {
        // With no fragments there is no index either; anchor at end of
        // file so a stray read reports EOF instead of garbage.
        let start_offset = if sb.frag_count.get() == 0 {
            map.len()
        } else {
            let mut index = map.clone();
            index.seek(sb.frag_table.get())?;
            index.read_typed::<U64>()?.get()
        };
        Ok(Self {
            stream: MetadataReader::new(map, start_offset, decomp)?,
            entry_num: 0,
            entry_count: sb.frag_count.get(),
            start_offset,
        })
    }

    pub fn read(&mut self) -> Result<structs::FragmentEntry> {
        if self.entry_num >= self.entry_count {
            return Err(Error::Format("read past the last fragment"));
        }
        self.entry_num += 1;
        self.stream.read_typed()
    }

    pub fn block_num(&self) -> Result<u64> {
        self.stream.block_num()
    }
}

/// The on-disk length of a data-block or fragment size entry.
pub(crate) fn block_len(size: u32) -> u32 {
    size & BLOCK_LEN_MASK
}
