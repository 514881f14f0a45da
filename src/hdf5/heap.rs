//! The three heap flavours: local heaps hold link names of symbol-table
//! groups, global heaps hold variable-length data, fractal heaps hold dense
//! link and attribute messages.

use crate::error::SyncError;

use super::cursor::{Cursor, encoded_width, log2_floor, malformed, until_nul, utf8};
use super::file::Hdf5File;

pub struct LocalHeap {
    data: Vec<u8>,
}

impl LocalHeap {
    pub fn read(file: &Hdf5File<'_>, address: u64) -> Result<Self, SyncError> {
        let sizes = file.sizes();
        let header = file.read(address, 8 + 2 * sizes.length + sizes.offset)?;
        let mut cursor = Cursor::new(&header, sizes);
        cursor.signature(b"HEAP")?;
        cursor.skip(4)?;
        let data_size = cursor.length()?;
        cursor.length()?; // free list head
        let data_address = cursor.required_address("local heap data")?;
        let data = file.read(data_address, to_usize(data_size)?)?;
        Ok(Self { data })
    }

    pub fn string(&self, offset: u64) -> Result<String, SyncError> {
        let tail = usize::try_from(offset)
            .ok()
            .and_then(|offset| self.data.get(offset..))
            .ok_or_else(|| malformed(format!("local heap offset {offset} out of range")))?;
        utf8(until_nul(tail))
    }
}

/// Payload of object `index` in the global heap collection at `address`.
pub fn global_heap_object(
    file: &Hdf5File<'_>,
    address: u64,
    index: u32,
) -> Result<Vec<u8>, SyncError> {
    let sizes = file.sizes();
    let header_len = 8 + sizes.length;
    let header = file.read(address, header_len)?;
    let mut cursor = Cursor::new(&header, sizes);
    cursor.signature(b"GCOL")?;
    cursor.skip(4)?;
    let collection_size = to_usize(cursor.length()?)?;

    let collection = file.read(address, collection_size)?;
    let mut cursor = Cursor::new(&collection, sizes);
    cursor.skip(header_len)?;
    while cursor.remaining() >= 8 + sizes.length {
        let object_index = cursor.u16()?;
        cursor.skip(6)?; // reference count, reserved
        let size = to_usize(cursor.length()?)?;
        if object_index == 0 {
            break;
        }
        let payload = cursor.bytes(size)?;
        if u32::from(object_index) == index {
            return Ok(payload.to_vec());
        }
        let padding = (size.next_multiple_of(8) - size).min(cursor.remaining());
        cursor.skip(padding)?;
    }
    Err(malformed(format!(
        "global heap object {index} not found in collection at {address}"
    )))
}

/// Header of a fractal heap, enough to resolve managed and tiny object ids.
#[derive(Debug, Clone, PartialEq)]
pub struct FractalHeap {
    filtered: bool,
    max_managed_size: u64,
    table_width: u64,
    start_block_size: u64,
    max_direct_block_size: u64,
    max_heap_bits: u64,
    root: Option<u64>,
    root_rows: u64,
}

impl FractalHeap {
    pub fn read(file: &Hdf5File<'_>, address: u64) -> Result<Self, SyncError> {
        let sizes = file.sizes();
        let len = 22 + 12 * sizes.length + 3 * sizes.offset;
        let buf = file.read(address, len)?;
        let mut cursor = Cursor::new(&buf, sizes);
        cursor.signature(b"FRHP")?;
        cursor.skip(3)?; // version, heap id length
        let filter_len = cursor.u16()?;
        cursor.skip(1)?; // flags
        let max_managed_size = u64::from(cursor.u32()?);
        cursor.length()?; // next huge id
        cursor.address()?; // huge object index
        cursor.length()?; // free space
        cursor.address()?; // free space manager
        for _ in 0..8 {
            cursor.length()?; // managed/huge/tiny space statistics
        }
        let table_width = u64::from(cursor.u16()?);
        let start_block_size = cursor.length()?;
        let max_direct_block_size = cursor.length()?;
        let max_heap_bits = u64::from(cursor.u16()?);
        cursor.u16()?; // starting rows
        let root = cursor.address()?;
        let root_rows = u64::from(cursor.u16()?);

        if table_width == 0 || start_block_size == 0 || max_direct_block_size < start_block_size {
            return Err(malformed("fractal heap with an invalid doubling table"));
        }
        Ok(Self {
            filtered: filter_len > 0,
            max_managed_size,
            table_width,
            start_block_size,
            max_direct_block_size,
            max_heap_bits,
            root,
            root_rows,
        })
    }

    /// Object bytes for a heap id. Huge objects live outside the heap and are
    /// not supported.
    pub fn object(&self, file: &Hdf5File<'_>, id: &[u8]) -> Result<Vec<u8>, SyncError> {
        let first = *id.first().ok_or_else(|| malformed("empty heap id"))?;
        match (first >> 4) & 0x03 {
            0 => self.managed_object(file, &id[1..]),
            2 => {
                let len = usize::from(first & 0x0f) + 1;
                id.get(1..1 + len)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| malformed("tiny heap id shorter than its length"))
            }
            _ => Err(malformed("huge fractal heap objects are not supported")),
        }
    }

    fn offset_width(&self) -> usize {
        self.max_heap_bits.div_ceil(8) as usize
    }

    fn length_width(&self) -> usize {
        let direct = u64::from(log2_floor(self.max_direct_block_size)).div_ceil(8) as usize;
        direct.min(encoded_width(self.max_managed_size))
    }

    fn max_direct_rows(&self) -> u64 {
        u64::from(log2_floor(self.max_direct_block_size) - log2_floor(self.start_block_size)) + 2
    }

    fn row_block_size(&self, row: u64) -> u64 {
        if row == 0 {
            self.start_block_size
        } else {
            self.start_block_size << (row - 1)
        }
    }

    fn rows_for_indirect(&self, block_size: u64) -> u64 {
        let first_row_bits = log2_floor(self.start_block_size) + log2_floor(self.table_width);
        u64::from(log2_floor(block_size).saturating_sub(first_row_bits)) + 1
    }

    fn managed_object(&self, file: &Hdf5File<'_>, id: &[u8]) -> Result<Vec<u8>, SyncError> {
        let mut cursor = Cursor::new(id, file.sizes());
        let offset = cursor.uint(self.offset_width())?;
        let len = to_usize(cursor.uint(self.length_width())?)?;
        let (block, block_offset) = self.locate(file, offset)?;
        file.read(block + (offset - block_offset), len)
    }

    /// Direct block holding heap offset `offset`, with that block's own heap offset.
    fn locate(&self, file: &Hdf5File<'_>, offset: u64) -> Result<(u64, u64), SyncError> {
        let root = self.root.ok_or_else(|| malformed("fractal heap has no root block"))?;
        if self.root_rows == 0 {
            return Ok((root, 0));
        }

        let sizes = file.sizes();
        let (mut block, mut rows, mut block_offset) = (root, self.root_rows, 0u64);
        loop {
            let direct_rows = rows.min(self.max_direct_rows());
            let direct_entry = sizes.offset + if self.filtered { sizes.length + 4 } else { 0 };
            let header = 5 + sizes.offset + self.offset_width();
            let entries = to_usize(
                direct_rows * self.table_width * direct_entry as u64
                    + (rows - direct_rows) * self.table_width * sizes.offset as u64,
            )?;
            let buf = file.read(block, header + entries)?;
            let mut cursor = Cursor::new(&buf, sizes);
            cursor.signature(b"FHIB")?;
            cursor.skip(header - 4)?;

            let mut entry_offset = block_offset;
            let mut descend = None;
            'rows: for row in 0..rows {
                let size = self.row_block_size(row);
                for _ in 0..self.table_width {
                    let child = cursor.address()?;
                    if row < direct_rows && self.filtered {
                        cursor.skip(sizes.length + 4)?;
                    }
                    if (entry_offset..entry_offset + size).contains(&offset) {
                        let child = child.ok_or_else(|| {
                            malformed(format!("heap offset {offset} is in an unallocated block"))
                        })?;
                        if row < direct_rows {
                            return Ok((child, entry_offset));
                        }
                        descend = Some((child, self.rows_for_indirect(size), entry_offset));
                        break 'rows;
                    }
                    entry_offset += size;
                }
            }
            let Some((child, child_rows, child_offset)) = descend else {
                return Err(malformed(format!("heap offset {offset} is out of range")));
            };
            (block, rows, block_offset) = (child, child_rows, child_offset);
        }
    }
}

fn to_usize(value: u64) -> Result<usize, SyncError> {
    usize::try_from(value).map_err(|_| malformed(format!("size {value} does not fit in memory")))
}
