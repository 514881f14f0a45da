//! B-tree walks. Version 1 trees index the symbol table nodes of old-style
//! groups; version 2 trees index dense link and attribute storage. Only full
//! traversals are needed, so keys are skipped.

use std::collections::HashSet;

use crate::error::SyncError;

use super::cursor::{Cursor, encoded_width, malformed};
use super::file::Hdf5File;

/// Addresses of every symbol table node below a group B-tree.
pub fn symbol_table_nodes(file: &Hdf5File<'_>, root: u64) -> Result<Vec<u64>, SyncError> {
    let sizes = file.sizes();
    let header_len = 8 + 2 * sizes.offset;
    let mut nodes = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root];

    while let Some(address) = stack.pop() {
        if !seen.insert(address) {
            continue;
        }
        let header = file.read(address, header_len)?;
        let mut cursor = Cursor::new(&header, sizes);
        cursor.signature(b"TREE")?;
        let node_type = cursor.u8()?;
        if node_type != 0 {
            return Err(malformed(format!("expected a group B-tree node, found type {node_type}")));
        }
        let level = cursor.u8()?;
        let entries = usize::from(cursor.u16()?);

        let body = file.read(
            address + header_len as u64,
            entries * (sizes.length + sizes.offset) + sizes.length,
        )?;
        let mut cursor = Cursor::new(&body, sizes);
        let mut children = Vec::with_capacity(entries);
        for _ in 0..entries {
            cursor.length()?; // key: heap offset of the largest name below
            children.push(cursor.required_address("B-tree child")?);
        }
        if level == 0 {
            nodes.extend(children);
        } else {
            stack.extend(children.into_iter().rev());
        }
    }
    Ok(nodes)
}

struct DepthInfo {
    /// Width of the per-child record count in internal nodes.
    count_width: usize,
    /// Width of the per-child total record count, indexed by child depth.
    total_widths: Vec<usize>,
}

impl DepthInfo {
    fn pointer_len(&self, address_len: usize, depth: usize) -> usize {
        let total = if depth > 1 { self.total_widths[depth - 1] } else { 0 };
        address_len + self.count_width + total
    }
}

const NODE_PREFIX: u64 = 10;

/// Raw records of a version 2 B-tree, in no particular order.
pub fn btree2_records(file: &Hdf5File<'_>, address: u64) -> Result<Vec<Vec<u8>>, SyncError> {
    let sizes = file.sizes();
    let header = file.read(address, 16 + sizes.offset + 2 + sizes.length)?;
    let mut cursor = Cursor::new(&header, sizes);
    cursor.signature(b"BTHD")?;
    cursor.skip(2)?; // version, tree type
    let node_size = u64::from(cursor.u32()?);
    let record_size = usize::from(cursor.u16()?);
    let depth = usize::from(cursor.u16()?);
    cursor.skip(2)?; // split and merge percentages
    let root = cursor.address()?;
    let root_records = usize::from(cursor.u16()?);

    let Some(root) = root else {
        return Ok(Vec::new());
    };
    if record_size == 0 {
        return Err(malformed("v2 B-tree with zero-sized records"));
    }
    let info = depth_info(node_size, record_size as u64, depth, sizes.offset);

    let mut records = Vec::new();
    let mut stack = vec![(root, root_records, depth)];
    while let Some((node, count, level)) = stack.pop() {
        let pointers = if level == 0 {
            0
        } else {
            (count + 1) * info.pointer_len(sizes.offset, level)
        };
        let buf = file.read(node, 6 + count * record_size + pointers)?;
        let mut cursor = Cursor::new(&buf, sizes);
        cursor.signature(if level == 0 { b"BTLF" } else { b"BTIN" })?;
        cursor.skip(2)?;
        for _ in 0..count {
            records.push(cursor.bytes(record_size)?.to_vec());
        }
        if level == 0 {
            continue;
        }
        for _ in 0..=count {
            let child = cursor.required_address("B-tree child")?;
            let child_count = cursor.uint(info.count_width)? as usize;
            if level > 1 {
                cursor.skip(info.total_widths[level - 1])?;
            }
            stack.push((child, child_count, level - 1));
        }
    }
    Ok(records)
}

fn depth_info(node_size: u64, record_size: u64, depth: usize, address_len: usize) -> DepthInfo {
    let leaf_max = node_size.saturating_sub(NODE_PREFIX) / record_size;
    let mut info = DepthInfo {
        count_width: encoded_width(leaf_max),
        total_widths: vec![0],
    };
    let mut cumulative = leaf_max;
    for level in 1..=depth {
        let pointer = info.pointer_len(address_len, level) as u64;
        let max = node_size.saturating_sub(NODE_PREFIX + pointer) / (record_size + pointer);
        cumulative = (max + 1) * cumulative + max;
        info.total_widths.push(encoded_width(cumulative));
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_pointer_widths() {
        // 512-byte nodes of 11-byte link name records
        let info = depth_info(512, 11, 2, 8);
        assert_eq!(info.count_width, 1);
        assert_eq!(info.pointer_len(8, 1), 9);
        assert_eq!(info.total_widths.len(), 3);
        assert_eq!(info.pointer_len(8, 2), 9 + info.total_widths[1]);
    }
}
