//! Object headers and the messages read from them.

use std::collections::HashSet;

use crate::error::SyncError;

use super::cursor::{Cursor, Sizes, malformed, padded8, until_nul, utf8};
use super::datatype::{Dataspace, Datatype};
use super::file::Hdf5File;

pub const DATASPACE: u16 = 0x01;
pub const LINK_INFO: u16 = 0x02;
pub const DATATYPE: u16 = 0x03;
pub const LINK: u16 = 0x06;
pub const LAYOUT: u16 = 0x08;
pub const ATTRIBUTE: u16 = 0x0c;
pub const CONTINUATION: u16 = 0x10;
pub const SYMBOL_TABLE: u16 = 0x11;
pub const ATTRIBUTE_INFO: u16 = 0x15;

const SHARED_MESSAGE: u8 = 0x02;

#[derive(Debug, Clone)]
pub struct Message {
    pub kind: u16,
    pub flags: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ObjectHeader {
    messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Group,
    Dataset,
    Other,
}

impl ObjectHeader {
    pub fn read(file: &Hdf5File<'_>, address: u64) -> Result<Self, SyncError> {
        let first = file.read(address, 4)?;
        let messages = if first.as_slice() == b"OHDR" {
            read_v2(file, address)?
        } else if first[0] == 1 {
            read_v1(file, address)?
        } else {
            return Err(malformed(format!("no object header at address {address}")));
        };
        Ok(Self { messages })
    }

    pub fn find(&self, kind: u16) -> Option<&Message> {
        self.messages.iter().find(|message| message.kind == kind)
    }

    pub fn all(&self, kind: u16) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(move |message| message.kind == kind)
    }

    pub fn kind(&self) -> ObjectKind {
        if self.find(SYMBOL_TABLE).is_some()
            || self.find(LINK_INFO).is_some()
            || self.find(LINK).is_some()
        {
            ObjectKind::Group
        } else if self.find(LAYOUT).is_some() {
            ObjectKind::Dataset
        } else {
            ObjectKind::Other
        }
    }

    pub fn dataspace(&self, sizes: Sizes) -> Result<Dataspace, SyncError> {
        let message = self
            .find(DATASPACE)
            .ok_or_else(|| malformed("dataset without a dataspace"))?;
        Dataspace::parse(&message.data, sizes)
    }

    pub fn datatype(&self, file: &Hdf5File<'_>) -> Result<Datatype, SyncError> {
        let message = self
            .find(DATATYPE)
            .ok_or_else(|| malformed("dataset without a datatype"))?;
        if message.flags & SHARED_MESSAGE != 0 {
            return committed_datatype(file, &message.data);
        }
        Datatype::parse(&mut Cursor::new(&message.data, file.sizes()))
    }
}

fn read_v1(file: &Hdf5File<'_>, address: u64) -> Result<Vec<Message>, SyncError> {
    let prefix = file.read(address, 16)?;
    let mut cursor = Cursor::new(&prefix, file.sizes());
    cursor.skip(2)?; // version, reserved
    let expected = usize::from(cursor.u16()?);
    cursor.u32()?; // reference count
    let size = cursor.u32()? as usize;

    let mut messages = Vec::with_capacity(expected);
    let mut chunks = vec![(address + 16, size)];
    let mut seen = HashSet::new();
    while let Some((chunk, len)) = chunks.pop() {
        if !seen.insert(chunk) {
            continue;
        }
        let buf = file.read(chunk, len)?;
        let mut cursor = Cursor::new(&buf, file.sizes());
        while cursor.remaining() >= 8 && messages.len() < expected {
            let kind = cursor.u16()?;
            let size = usize::from(cursor.u16()?);
            let flags = cursor.u8()?;
            cursor.skip(3)?;
            let data = cursor.bytes(size)?.to_vec();
            if kind == CONTINUATION {
                chunks.push(continuation(&data, file.sizes())?);
            }
            messages.push(Message { kind, flags, data });
        }
    }
    Ok(messages)
}

const STORES_TIMES: u8 = 0x20;
const STORES_PHASE_CHANGE: u8 = 0x10;
const TRACKS_ORDER: u8 = 0x04;

fn read_v2(file: &Hdf5File<'_>, address: u64) -> Result<Vec<Message>, SyncError> {
    let head = file.read(address, 6)?;
    let flags = head[5];
    let optional = if flags & STORES_TIMES != 0 { 16 } else { 0 }
        + if flags & STORES_PHASE_CHANGE != 0 { 4 } else { 0 };
    let width = 1usize << (flags & 0x03);
    let size_field = file.read(address + 6 + optional as u64, width)?;
    let size = Cursor::new(&size_field, file.sizes()).uint(width)? as usize;

    let mut messages = Vec::new();
    let first = address + (6 + optional + width) as u64;
    let mut chunks = vec![(first, size, false)];
    let mut seen = HashSet::new();
    while let Some((chunk, len, signed)) = chunks.pop() {
        if !seen.insert(chunk) {
            continue;
        }
        let buf = file.read(chunk, len)?;
        let mut cursor = Cursor::new(&buf, file.sizes());
        if signed {
            cursor.signature(b"OCHK")?;
        }
        let header_len = if flags & TRACKS_ORDER != 0 { 6 } else { 4 };
        // continuation chunks end in a checksum
        let end = if signed { 4 } else { 0 };
        while cursor.remaining() >= header_len + end {
            let kind = u16::from(cursor.u8()?);
            let size = usize::from(cursor.u16()?);
            let message_flags = cursor.u8()?;
            if flags & TRACKS_ORDER != 0 {
                cursor.u16()?;
            }
            let data = cursor.bytes(size)?.to_vec();
            if kind == CONTINUATION {
                let (next, next_len) = continuation(&data, file.sizes())?;
                chunks.push((next, next_len, true));
            }
            messages.push(Message {
                kind,
                flags: message_flags,
                data,
            });
        }
    }
    Ok(messages)
}

fn continuation(data: &[u8], sizes: Sizes) -> Result<(u64, usize), SyncError> {
    let mut cursor = Cursor::new(data, sizes);
    let address = cursor.required_address("continuation chunk")?;
    let len = cursor.length()? as usize;
    Ok((address, len))
}

/// A datatype stored once in its own object header and referenced by address.
fn committed_datatype(file: &Hdf5File<'_>, data: &[u8]) -> Result<Datatype, SyncError> {
    let mut cursor = Cursor::new(data, file.sizes());
    let version = cursor.u8()?;
    match version {
        1 => cursor.skip(7)?,
        2 => cursor.skip(1)?,
        3 => {
            if cursor.u8()? != 2 {
                return Err(malformed("datatypes in shared message storage are not supported"));
            }
        }
        other => return Err(malformed(format!("unsupported shared message version {other}"))),
    }
    let address = cursor.required_address("committed datatype")?;
    let header = ObjectHeader::read(file, address)?;
    let message = header
        .find(DATATYPE)
        .ok_or_else(|| malformed("committed datatype without a datatype message"))?;
    Datatype::parse(&mut Cursor::new(&message.data, file.sizes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Hard(u64),
    Soft(String),
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub target: LinkTarget,
}

const LINK_TYPE_PRESENT: u8 = 0x08;
const LINK_ORDER_PRESENT: u8 = 0x04;
const LINK_CHARSET_PRESENT: u8 = 0x10;

pub fn parse_link(data: &[u8], sizes: Sizes) -> Result<Link, SyncError> {
    let mut cursor = Cursor::new(data, sizes);
    let version = cursor.u8()?;
    if version != 1 {
        return Err(malformed(format!("unsupported link message version {version}")));
    }
    let flags = cursor.u8()?;
    let link_type = if flags & LINK_TYPE_PRESENT != 0 {
        cursor.u8()?
    } else {
        0
    };
    if flags & LINK_ORDER_PRESENT != 0 {
        cursor.skip(8)?;
    }
    if flags & LINK_CHARSET_PRESENT != 0 {
        cursor.skip(1)?;
    }
    let name_len = cursor.uint(1 << (flags & 0x03))? as usize;
    let name = utf8(cursor.bytes(name_len)?)?;
    let target = match link_type {
        0 => LinkTarget::Hard(cursor.required_address("hard link")?),
        1 => {
            let len = usize::from(cursor.u16()?);
            LinkTarget::Soft(utf8(cursor.bytes(len)?)?)
        }
        _ => LinkTarget::External,
    };
    Ok(Link { name, target })
}

/// Heap and name-index addresses of dense link or attribute storage.
pub struct DenseStorage {
    pub heap: u64,
    pub name_index: u64,
}

/// Parses a link info or attribute info message; `None` when storage is compact.
pub fn dense_storage(message: &Message, sizes: Sizes) -> Result<Option<DenseStorage>, SyncError> {
    let mut cursor = Cursor::new(&message.data, sizes);
    cursor.u8()?; // version
    let flags = cursor.u8()?;
    if flags & 0x01 != 0 {
        // max creation index: 8 bytes for links, 2 for attributes
        cursor.skip(if message.kind == LINK_INFO { 8 } else { 2 })?;
    }
    let heap = cursor.address()?;
    let name_index = cursor.address()?;
    Ok(match (heap, name_index) {
        (Some(heap), Some(name_index)) => Some(DenseStorage { heap, name_index }),
        _ => None,
    })
}

/// A decoded attribute message: name, type, shape and the raw element bytes.
pub struct RawAttribute {
    pub name: String,
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    pub data: Vec<u8>,
}

const SHARED_DATATYPE: u8 = 0x01;

pub fn parse_attribute(data: &[u8], file: &Hdf5File<'_>) -> Result<RawAttribute, SyncError> {
    let sizes = file.sizes();
    let mut cursor = Cursor::new(data, sizes);
    let version = cursor.u8()?;
    let flags = cursor.u8()?;
    let name_len = usize::from(cursor.u16()?);
    let datatype_len = usize::from(cursor.u16()?);
    let dataspace_len = usize::from(cursor.u16()?);
    let pad = |len: usize| if version == 1 { padded8(len) } else { len };
    match version {
        1 | 2 => {}
        3 => cursor.skip(1)?, // name encoding
        other => return Err(malformed(format!("unsupported attribute version {other}"))),
    }

    let name = utf8(until_nul(cursor.bytes(pad(name_len))?))?;
    let datatype_raw = cursor.bytes(pad(datatype_len))?;
    let dataspace_raw = cursor.bytes(pad(dataspace_len))?;
    let datatype = if version > 1 && flags & SHARED_DATATYPE != 0 {
        committed_datatype(file, datatype_raw)?
    } else {
        Datatype::parse(&mut Cursor::new(datatype_raw, sizes))?
    };
    Ok(RawAttribute {
        name,
        datatype,
        dataspace: Dataspace::parse(dataspace_raw, sizes)?,
        data: cursor.rest().to_vec(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLayout {
    Compact(Vec<u8>),
    Contiguous { address: Option<u64>, size: u64 },
    Chunked,
    Virtual,
}

pub fn parse_layout(data: &[u8], sizes: Sizes) -> Result<DataLayout, SyncError> {
    let mut cursor = Cursor::new(data, sizes);
    let version = cursor.u8()?;
    match version {
        1 | 2 => {
            let rank = usize::from(cursor.u8()?);
            let class = cursor.u8()?;
            cursor.skip(5)?;
            let address = if class == 0 { None } else { cursor.address()? };
            let mut dims = Vec::with_capacity(rank);
            for _ in 0..rank {
                dims.push(u64::from(cursor.u32()?));
            }
            match class {
                0 => {
                    let size = cursor.u32()? as usize;
                    Ok(DataLayout::Compact(cursor.bytes(size)?.to_vec()))
                }
                1 => Ok(DataLayout::Contiguous {
                    address,
                    size: dims.iter().product(),
                }),
                _ => Ok(DataLayout::Chunked),
            }
        }
        3 | 4 => match cursor.u8()? {
            0 => {
                let size = usize::from(cursor.u16()?);
                Ok(DataLayout::Compact(cursor.bytes(size)?.to_vec()))
            }
            1 => Ok(DataLayout::Contiguous {
                address: cursor.address()?,
                size: cursor.length()?,
            }),
            2 => Ok(DataLayout::Chunked),
            _ => Ok(DataLayout::Virtual),
        },
        other => Err(malformed(format!("unsupported layout version {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const SIZES: Sizes = Sizes {
        offset: 8,
        length: 8,
    };

    #[test]
    fn parses_hard_and_soft_links() {
        let mut hard = vec![1, 0x00, 4];
        hard.extend(b"ts_a");
        hard.extend(640u64.to_le_bytes());
        assert_eq!(
            parse_link(&hard, SIZES).unwrap(),
            Link {
                name: "ts_a".to_string(),
                target: LinkTarget::Hard(640)
            }
        );

        let mut soft = vec![1, 0x0c, 1];
        soft.extend(3u64.to_le_bytes());
        soft.push(5);
        soft.extend(b"alias");
        soft.extend(4u16.to_le_bytes());
        soft.extend(b"ts_a");
        assert_eq!(
            parse_link(&soft, SIZES).unwrap().target,
            LinkTarget::Soft("ts_a".to_string())
        );
    }

    #[test]
    fn external_links_are_recognised() {
        let mut external = vec![1, 0x08, 64, 3];
        external.extend(b"ext");
        external.extend(2u16.to_le_bytes());
        external.extend([0, 0]);
        assert_eq!(parse_link(&external, SIZES).unwrap().target, LinkTarget::External);
    }

    #[test]
    fn layout_versions() {
        let mut compact = vec![3, 0];
        compact.extend(2u16.to_le_bytes());
        compact.extend(b"ok");
        assert_eq!(
            parse_layout(&compact, SIZES).unwrap(),
            DataLayout::Compact(b"ok".to_vec())
        );

        let mut contiguous = vec![4, 1];
        contiguous.extend(96u64.to_le_bytes());
        contiguous.extend(8u64.to_le_bytes());
        assert_eq!(
            parse_layout(&contiguous, SIZES).unwrap(),
            DataLayout::Contiguous {
                address: Some(96),
                size: 8
            }
        );

        // version 1 contiguous: size is the product of the dimension sizes
        let mut old = vec![1, 2, 1, 0, 0, 0, 0, 0];
        old.extend(200u64.to_le_bytes());
        old.extend(3u32.to_le_bytes());
        old.extend(8u32.to_le_bytes());
        assert_eq!(
            parse_layout(&old, SIZES).unwrap(),
            DataLayout::Contiguous {
                address: Some(200),
                size: 24
            }
        );

        assert_eq!(parse_layout(&[4, 2, 0], SIZES).unwrap(), DataLayout::Chunked);
        assert_matches!(parse_layout(&[9], SIZES), Err(SyncError::Hdf5Format(_)));
    }

    #[test]
    fn compact_link_info_has_no_dense_storage() {
        let mut data = vec![0, 0];
        data.extend([0xff; 16]);
        let message = Message {
            kind: LINK_INFO,
            flags: 0,
            data,
        };
        assert!(dense_storage(&message, SIZES).unwrap().is_none());
    }
}
