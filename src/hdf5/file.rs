use crate::error::SyncError;

use super::cursor::{Cursor, Sizes, malformed};
use super::source::ByteSource;

pub const SIGNATURE: &[u8; 8] = b"\x89HDF\r\n\x1a\n";

/// The superblock may follow a user block of 512, 1024, 2048... bytes.
const MAX_USER_BLOCK: u64 = 32 * 1024;

/// An opened HDF5 file: the byte source plus what the superblock says about
/// address widths and where the root group lives.
pub struct Hdf5File<'a> {
    source: &'a dyn ByteSource,
    sizes: Sizes,
    base: u64,
    root: u64,
}

impl<'a> Hdf5File<'a> {
    pub fn open(source: &'a dyn ByteSource) -> Result<Self, SyncError> {
        let start = find_superblock(source)?;
        let version = source.read_at(start + 8, 1)?[0];
        let (sizes, base, root) = match version {
            0 | 1 => read_superblock_v0(source, start, version)?,
            2 | 3 => read_superblock_v2(source, start)?,
            other => return Err(malformed(format!("unsupported superblock version {other}"))),
        };
        Ok(Self {
            source,
            sizes,
            base,
            root,
        })
    }

    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// Reads `len` bytes at a file address (relative to the base address).
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, SyncError> {
        let offset = self
            .base
            .checked_add(address)
            .ok_or_else(|| malformed(format!("address {address} overflows")))?;
        self.source.read_at(offset, len)
    }
}

fn find_superblock(source: &dyn ByteSource) -> Result<u64, SyncError> {
    let mut offset = 0;
    while offset <= MAX_USER_BLOCK {
        match source.read_at(offset, SIGNATURE.len()) {
            Ok(head) if head.as_slice() == SIGNATURE => return Ok(offset),
            Ok(_) => {}
            Err(SyncError::Hdf5Format(_)) => break,
            Err(err) => return Err(err),
        }
        offset = if offset == 0 { 512 } else { offset * 2 };
    }
    Err(malformed("no HDF5 signature found"))
}

fn checked_sizes(offset: u8, length: u8) -> Result<Sizes, SyncError> {
    let valid = |width: u8| matches!(width, 2 | 4 | 8);
    if !valid(offset) || !valid(length) {
        return Err(malformed(format!(
            "unsupported address/length widths {offset}/{length}"
        )));
    }
    Ok(Sizes {
        offset: usize::from(offset),
        length: usize::from(length),
    })
}

fn read_superblock_v0(
    source: &dyn ByteSource,
    start: u64,
    version: u8,
) -> Result<(Sizes, u64, u64), SyncError> {
    let fixed = source.read_at(start, 16)?;
    let sizes = checked_sizes(fixed[13], fixed[14])?;
    // group K values and consistency flags, plus the indexed-storage K in v1
    let prefix = 24 + if version == 1 { 4 } else { 0 };
    let entry = 2 * sizes.offset + 24;
    let buf = source.read_at(start, prefix + 4 * sizes.offset + entry)?;

    let mut cursor = Cursor::new(&buf, sizes);
    cursor.skip(prefix)?;
    let base = cursor.address()?.unwrap_or(0);
    cursor.address()?; // free-space info
    cursor.address()?; // end of file
    cursor.address()?; // driver info
    cursor.address()?; // root link name offset
    let root = cursor.required_address("root object header")?;
    Ok((sizes, base, root))
}

fn read_superblock_v2(source: &dyn ByteSource, start: u64) -> Result<(Sizes, u64, u64), SyncError> {
    let fixed = source.read_at(start, 12)?;
    let sizes = checked_sizes(fixed[9], fixed[10])?;
    let buf = source.read_at(start, 12 + 4 * sizes.offset)?;

    let mut cursor = Cursor::new(&buf, sizes);
    cursor.skip(12)?;
    let base = cursor.address()?.unwrap_or(0);
    cursor.address()?; // superblock extension
    cursor.address()?; // end of file
    let root = cursor.required_address("root object header")?;
    Ok((sizes, base, root))
}
