//! A read-only walker over the metadata of HDF5 files: the group hierarchy,
//! attributes, links and the values of small datasets. Bulk data, chunked
//! storage and filters are out of reach on purpose; NWB metadata lives in
//! attributes and short contiguous or compact datasets.

mod btree;
mod cursor;
mod datatype;
mod file;
mod heap;
mod object;
mod source;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::SyncError;
use crate::tree::{NodeTree, ROOT, TreeBuilder, normalize_path};
use crate::value::AttrValue;

pub use source::{ByteSource, FileSource, past_end};

use btree::{btree2_records, symbol_table_nodes};
use cursor::{Cursor, malformed};
use datatype::{read_elements, stored_size};
use file::Hdf5File;
use heap::{FractalHeap, LocalHeap};
use object::{
    ATTRIBUTE, ATTRIBUTE_INFO, DataLayout, LAYOUT, LINK, LINK_INFO, Link, LinkTarget,
    ObjectHeader, ObjectKind, SYMBOL_TABLE, dense_storage, parse_attribute, parse_layout,
    parse_link,
};

/// Datasets larger than this are listed without a value.
pub const VALUE_LIMIT: u64 = 4096;

/// Symbol table entries caching a soft link keep its value's heap offset here.
const SOFT_LINK_CACHE: u32 = 2;

/// Reads the object hierarchy of an HDF5 file.
///
/// Every object reachable from the root group is visited once. A hard link to
/// an object already visited becomes a link to its first path, which is how
/// cycles are kept finite. Undecodable attribute or dataset values are logged
/// and skipped; a malformed structure fails the whole read.
pub fn read_tree(source: &dyn ByteSource) -> Result<NodeTree, SyncError> {
    let file = Hdf5File::open(source)?;
    let mut builder = TreeBuilder::new();
    let mut visited = HashMap::from([(file.root(), ROOT.to_string())]);
    let mut pending = vec![(file.root(), ROOT.to_string())];

    while let Some((address, path)) = pending.pop() {
        let header = ObjectHeader::read(&file, address)?;
        match header.kind() {
            ObjectKind::Group => {
                builder = builder.group(&path);
                let mut links = group_links(&file, &header)?;
                links.sort_by(|a, b| a.name.cmp(&b.name));
                let mut discovered = Vec::new();
                for link in links {
                    let child = child_path(&path, &link.name);
                    match link.target {
                        LinkTarget::Hard(target) => match visited.get(&target) {
                            Some(first) => builder = builder.link(&child, first),
                            None => {
                                visited.insert(target, child.clone());
                                discovered.push((target, child));
                            }
                        },
                        LinkTarget::Soft(target) => {
                            let target = if target.starts_with('/') {
                                normalize_path(&target)
                            } else {
                                child_path(&path, &target)
                            };
                            builder = builder.link(&child, &target);
                        }
                        LinkTarget::External => {
                            debug!(path = %child, "skipping external link");
                        }
                    }
                }
                pending.extend(discovered.into_iter().rev());
            }
            ObjectKind::Dataset => {
                builder = builder.dataset(&path, dataset_value(&file, &header, &path));
            }
            ObjectKind::Other => {
                debug!(path = %path, "skipping object that is neither group nor dataset");
                continue;
            }
        }
        for (name, value) in attributes(&file, &header, &path)? {
            builder = builder.attr(&path, &name, value);
        }
    }
    Ok(builder.build())
}

fn child_path(parent: &str, name: &str) -> String {
    normalize_path(&format!("{parent}/{name}"))
}

fn group_links(file: &Hdf5File<'_>, header: &ObjectHeader) -> Result<Vec<Link>, SyncError> {
    if let Some(message) = header.find(SYMBOL_TABLE) {
        return symbol_table_links(file, &message.data);
    }
    let mut links = header
        .all(LINK)
        .map(|message| parse_link(&message.data, file.sizes()))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(message) = header.find(LINK_INFO) {
        if let Some(dense) = dense_storage(message, file.sizes())? {
            for object in dense_objects(file, dense.heap, dense.name_index, DenseIndex::LinkName)? {
                links.push(parse_link(&object, file.sizes())?);
            }
        }
    }
    Ok(links)
}

fn symbol_table_links(file: &Hdf5File<'_>, data: &[u8]) -> Result<Vec<Link>, SyncError> {
    let sizes = file.sizes();
    let mut cursor = Cursor::new(data, sizes);
    let btree = cursor.required_address("group B-tree")?;
    let heap = LocalHeap::read(file, cursor.required_address("group local heap")?)?;
    let entry_len = 2 * sizes.offset + 24;

    let mut links = Vec::new();
    for node in symbol_table_nodes(file, btree)? {
        let head = file.read(node, 8)?;
        let mut cursor = Cursor::new(&head, sizes);
        cursor.signature(b"SNOD")?;
        cursor.skip(2)?; // version, reserved
        let count = usize::from(cursor.u16()?);
        let entries = file.read(node + 8, count * entry_len)?;
        let mut cursor = Cursor::new(&entries, sizes);
        for _ in 0..count {
            let name = heap.string(cursor.length()?)?;
            let address = cursor.address()?;
            let cache_type = cursor.u32()?;
            cursor.skip(4)?;
            let scratch = cursor.bytes(16)?;
            let target = match (cache_type, address) {
                (SOFT_LINK_CACHE, _) => {
                    let offset = Cursor::new(scratch, sizes).u32()?;
                    LinkTarget::Soft(heap.string(u64::from(offset))?)
                }
                (_, Some(address)) => LinkTarget::Hard(address),
                (_, None) => return Err(malformed(format!("symbol table entry {name} has no address"))),
            };
            links.push(Link { name, target });
        }
    }
    Ok(links)
}

#[derive(Clone, Copy)]
enum DenseIndex {
    /// Records are a 4-byte name hash followed by the heap id.
    LinkName,
    /// Records start with an 8-byte heap id.
    AttributeName,
}

fn dense_objects(
    file: &Hdf5File<'_>,
    heap: u64,
    index: u64,
    layout: DenseIndex,
) -> Result<Vec<Vec<u8>>, SyncError> {
    let heap = FractalHeap::read(file, heap)?;
    btree2_records(file, index)?
        .iter()
        .map(|record| {
            let id = match layout {
                DenseIndex::LinkName => record.get(4..),
                DenseIndex::AttributeName => record.get(..8),
            }
            .ok_or_else(|| malformed("B-tree record shorter than a heap id"))?;
            heap.object(file, id)
        })
        .collect()
}

fn attributes(
    file: &Hdf5File<'_>,
    header: &ObjectHeader,
    path: &str,
) -> Result<Vec<(String, AttrValue)>, SyncError> {
    let mut messages = header
        .all(ATTRIBUTE)
        .map(|message| message.data.clone())
        .collect::<Vec<_>>();
    if let Some(message) = header.find(ATTRIBUTE_INFO) {
        if let Some(dense) = dense_storage(message, file.sizes())? {
            messages.extend(dense_objects(
                file,
                dense.heap,
                dense.name_index,
                DenseIndex::AttributeName,
            )?);
        }
    }

    let mut attrs = Vec::with_capacity(messages.len());
    for data in messages {
        let raw = parse_attribute(&data, file)?;
        match read_elements(file, &raw.datatype, &raw.dataspace, &raw.data) {
            Ok(value) => attrs.push((raw.name, value)),
            Err(err) => warn!(path = %path, attribute = %raw.name, error = %err, "skipping unreadable attribute"),
        }
    }
    Ok(attrs)
}

fn dataset_value(file: &Hdf5File<'_>, header: &ObjectHeader, path: &str) -> Option<AttrValue> {
    match read_dataset_value(file, header) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path, error = %err, "skipping unreadable dataset value");
            None
        }
    }
}

fn read_dataset_value(
    file: &Hdf5File<'_>,
    header: &ObjectHeader,
) -> Result<Option<AttrValue>, SyncError> {
    let dataspace = header.dataspace(file.sizes())?;
    let datatype = header.datatype(file)?;
    let size = stored_size(&datatype, &dataspace, file.sizes())
        .ok_or_else(|| malformed("dataset size overflows"))?;
    if size > VALUE_LIMIT {
        return Ok(None);
    }
    let layout = header
        .find(LAYOUT)
        .ok_or_else(|| malformed("dataset without a layout"))?;
    let raw = match parse_layout(&layout.data, file.sizes())? {
        DataLayout::Compact(data) => data,
        DataLayout::Contiguous {
            address: Some(address),
            ..
        } => file.read(address, size as usize)?,
        DataLayout::Contiguous { address: None, .. } | DataLayout::Chunked | DataLayout::Virtual => {
            return Ok(None);
        }
    };
    read_elements(file, &datatype, &dataspace, &raw).map(Some)
}
