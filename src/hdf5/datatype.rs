//! Dataspaces, datatypes and decoding raw elements into [`AttrValue`]s.

use crate::error::SyncError;
use crate::value::AttrValue;

use super::cursor::{Cursor, Sizes, le_uint, malformed, padded8, until_nul};
use super::file::Hdf5File;
use super::heap::global_heap_object;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataspace {
    dims: Vec<u64>,
    null: bool,
}

impl Dataspace {
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<Self, SyncError> {
        let mut cursor = Cursor::new(data, sizes);
        let version = cursor.u8()?;
        let rank = usize::from(cursor.u8()?);
        cursor.u8()?; // flags
        let null = match version {
            1 => {
                cursor.skip(5)?;
                false
            }
            2 => cursor.u8()? == 2,
            other => return Err(malformed(format!("unsupported dataspace version {other}"))),
        };
        let dims = (0..rank)
            .map(|_| cursor.length())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { dims, null })
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty() && !self.null
    }

    pub fn element_count(&self) -> u64 {
        if self.null {
            0
        } else {
            self.dims.iter().product()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    NullTerminated,
    NullPadded,
    SpacePadded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Datatype {
    Integer {
        size: usize,
        signed: bool,
        big_endian: bool,
    },
    Float {
        size: usize,
        big_endian: bool,
    },
    FixedString {
        size: usize,
        padding: Padding,
    },
    VarString,
    Sequence {
        base: Box<Datatype>,
    },
    Enum {
        size: usize,
        base: Box<Datatype>,
        members: Vec<(String, Vec<u8>)>,
    },
    Reference {
        size: usize,
    },
    /// Compound, array, opaque, bitfield and time types.
    Other {
        class: u8,
        size: usize,
    },
}

const VLEN_STRING: u8 = 1;

impl Datatype {
    pub fn parse(cursor: &mut Cursor<'_>) -> Result<Self, SyncError> {
        let class_and_version = cursor.u8()?;
        let class = class_and_version & 0x0f;
        let version = class_and_version >> 4;
        let bits = cursor.bytes(3)?;
        let size = cursor.u32()? as usize;

        let datatype = match class {
            0 => {
                cursor.skip(4)?; // bit offset, precision
                Datatype::Integer {
                    size,
                    signed: bits[0] & 0x08 != 0,
                    big_endian: bits[0] & 0x01 != 0,
                }
            }
            1 => {
                cursor.skip(12)?;
                Datatype::Float {
                    size,
                    big_endian: bits[0] & 0x01 != 0,
                }
            }
            3 => Datatype::FixedString {
                size,
                padding: match bits[0] & 0x0f {
                    0 => Padding::NullTerminated,
                    2 => Padding::SpacePadded,
                    _ => Padding::NullPadded,
                },
            },
            7 => Datatype::Reference { size },
            8 => {
                let base = Datatype::parse(cursor)?;
                let count = usize::from(bits[0]) | (usize::from(bits[1]) << 8);
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    let (name, used) = cursor.cstring()?;
                    if version < 3 {
                        cursor.skip(padded8(used) - used)?;
                    }
                    names.push(name);
                }
                let members = names
                    .into_iter()
                    .map(|name| Ok((name, cursor.bytes(base.size())?.to_vec())))
                    .collect::<Result<Vec<_>, SyncError>>()?;
                Datatype::Enum {
                    size,
                    base: Box::new(base),
                    members,
                }
            }
            9 => {
                let base = Datatype::parse(cursor)?;
                if bits[0] & 0x0f == VLEN_STRING {
                    Datatype::VarString
                } else {
                    Datatype::Sequence {
                        base: Box::new(base),
                    }
                }
            }
            class => Datatype::Other { class, size },
        };
        Ok(datatype)
    }

    /// Declared size; zero for variable-length types, which store a heap
    /// reference per element instead.
    fn size(&self) -> usize {
        match self {
            Datatype::Integer { size, .. }
            | Datatype::Float { size, .. }
            | Datatype::FixedString { size, .. }
            | Datatype::Enum { size, .. }
            | Datatype::Reference { size }
            | Datatype::Other { size, .. } => *size,
            Datatype::VarString | Datatype::Sequence { .. } => 0,
        }
    }

    /// Bytes per element as stored: variable-length elements are a length,
    /// a global heap collection address and an object index.
    fn element_size(&self, sizes: Sizes) -> usize {
        match self {
            Datatype::VarString | Datatype::Sequence { .. } => 4 + sizes.offset + 4,
            other => other.size(),
        }
    }

    pub fn decode(&self, raw: &[u8], file: &Hdf5File<'_>) -> Result<AttrValue, SyncError> {
        let value = match self {
            Datatype::Integer {
                size,
                signed,
                big_endian,
            } => decode_integer(raw, *size, *signed, *big_endian),
            Datatype::Float { size, big_endian } => decode_float(raw, *size, *big_endian),
            Datatype::FixedString { padding, .. } => text(match padding {
                Padding::SpacePadded => raw.trim_ascii_end(),
                Padding::NullTerminated | Padding::NullPadded => until_nul(raw),
            }),
            Datatype::VarString => text(&variable_length_bytes(raw, file)?),
            Datatype::Sequence { base } => {
                let bytes = variable_length_bytes(raw, file)?;
                let width = base.element_size(file.sizes());
                if width == 0 {
                    AttrValue::List(Vec::new())
                } else {
                    AttrValue::List(
                        bytes
                            .chunks_exact(width)
                            .map(|item| base.decode(item, file))
                            .collect::<Result<Vec<_>, _>>()?,
                    )
                }
            }
            Datatype::Enum { base, members, .. } => {
                match members.iter().find(|(_, value)| value.as_slice() == raw) {
                    Some((name, _)) if is_bool_enum(members) => AttrValue::Bool(name == "TRUE"),
                    Some((name, _)) => AttrValue::Str(name.clone()),
                    None => base.decode(raw, file)?,
                }
            }
            Datatype::Reference { .. } => AttrValue::Opaque("<HDF5 object reference>".to_string()),
            Datatype::Other { class, .. } => AttrValue::Opaque(format!("<HDF5 class {class} value>")),
        };
        Ok(value)
    }
}

/// Decodes packed elements and shapes them after the dataspace:
/// scalars come back bare, arrays as (nested) lists.
pub fn read_elements(
    file: &Hdf5File<'_>,
    datatype: &Datatype,
    dataspace: &Dataspace,
    raw: &[u8],
) -> Result<AttrValue, SyncError> {
    let width = datatype.element_size(file.sizes());
    let count = usize::try_from(dataspace.element_count())
        .map_err(|_| malformed("element count does not fit in memory"))?;
    if width == 0 {
        return Ok(AttrValue::Opaque("<HDF5 empty type>".to_string()));
    }
    let needed = count
        .checked_mul(width)
        .filter(|needed| *needed <= raw.len())
        .ok_or_else(|| malformed(format!("{count} elements of {width} bytes exceed the stored data")))?;
    let mut items = raw[..needed]
        .chunks_exact(width)
        .map(|element| datatype.decode(element, file))
        .collect::<Result<Vec<_>, _>>()?;

    if dataspace.is_scalar() {
        return Ok(items.pop().unwrap_or(AttrValue::List(Vec::new())));
    }
    for dim in dataspace.dims.iter().skip(1).rev() {
        let dim = (*dim).max(1) as usize;
        let mut grouped = Vec::with_capacity(items.len() / dim);
        let mut rest = items.into_iter();
        loop {
            let row = rest.by_ref().take(dim).collect::<Vec<_>>();
            if row.is_empty() {
                break;
            }
            grouped.push(AttrValue::List(row));
        }
        items = grouped;
    }
    Ok(AttrValue::List(items))
}

pub fn stored_size(datatype: &Datatype, dataspace: &Dataspace, sizes: Sizes) -> Option<u64> {
    dataspace
        .element_count()
        .checked_mul(datatype.element_size(sizes) as u64)
}

fn variable_length_bytes(raw: &[u8], file: &Hdf5File<'_>) -> Result<Vec<u8>, SyncError> {
    let mut cursor = Cursor::new(raw, file.sizes());
    let len = cursor.u32()?;
    let collection = cursor.address()?;
    let index = cursor.u32()?;
    match collection {
        Some(address) if len > 0 && index > 0 => global_heap_object(file, address, index),
        _ => Ok(Vec::new()),
    }
}

fn is_bool_enum(members: &[(String, Vec<u8>)]) -> bool {
    members.len() == 2
        && members
            .iter()
            .all(|(name, _)| name == "TRUE" || name == "FALSE")
}

fn text(raw: &[u8]) -> AttrValue {
    match String::from_utf8(raw.to_vec()) {
        Ok(text) => AttrValue::Str(text),
        Err(err) => AttrValue::Bytes(err.into_bytes()),
    }
}

fn ordered(raw: &[u8], big_endian: bool) -> Vec<u8> {
    let mut bytes = raw.to_vec();
    if big_endian {
        bytes.reverse();
    }
    bytes
}

fn decode_integer(raw: &[u8], size: usize, signed: bool, big_endian: bool) -> AttrValue {
    if size == 0 || size > 8 || raw.len() < size {
        return AttrValue::Opaque(format!("<HDF5 {}-byte integer>", size));
    }
    let value = le_uint(&ordered(&raw[..size], big_endian));
    if signed {
        let shift = 64 - 8 * size as u32;
        AttrValue::Int(((value << shift) as i64) >> shift)
    } else {
        AttrValue::UInt(value)
    }
}

fn decode_float(raw: &[u8], size: usize, big_endian: bool) -> AttrValue {
    let bytes = ordered(&raw[..size.min(raw.len())], big_endian);
    match bytes.len() {
        4 => AttrValue::Float(f64::from(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))),
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes);
            AttrValue::Float(f64::from_le_bytes(buf))
        }
        other => AttrValue::Opaque(format!("<HDF5 {other}-byte float>")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: Sizes = Sizes {
        offset: 8,
        length: 8,
    };

    fn parse(bytes: &[u8]) -> Datatype {
        Datatype::parse(&mut Cursor::new(bytes, SIZES)).unwrap()
    }

    #[test]
    fn parses_numeric_types() {
        let int16 = [0x10, 0x08, 0, 0, 2, 0, 0, 0, 0, 0, 16, 0];
        assert_eq!(
            parse(&int16),
            Datatype::Integer {
                size: 2,
                signed: true,
                big_endian: false
            }
        );
        assert_eq!(decode_integer(&[0xfe, 0xff], 2, true, false), AttrValue::Int(-2));
        assert_eq!(decode_integer(&[0x01, 0x00], 2, false, true), AttrValue::UInt(256));
        assert_eq!(
            decode_float(&1.5f32.to_be_bytes(), 4, true),
            AttrValue::Float(1.5)
        );
    }

    #[test]
    fn variable_length_string_consumes_its_base_type() {
        let mut bytes = vec![0x19, 0x01, 0x01, 0x00, 16, 0, 0, 0];
        bytes.extend([0x10, 0, 0, 0, 1, 0, 0, 0, 0, 0, 8, 0]);
        bytes.push(0xaa);
        let mut cursor = Cursor::new(&bytes, SIZES);
        assert_eq!(Datatype::parse(&mut cursor).unwrap(), Datatype::VarString);
        assert_eq!(cursor.remaining(), 1);
    }

    #[test]
    fn dataspace_versions() {
        let scalar = Dataspace::parse(&[1, 0, 0, 0, 0, 0, 0, 0], SIZES).unwrap();
        assert!(scalar.is_scalar());
        assert_eq!(scalar.element_count(), 1);

        let mut simple = vec![2, 2, 0, 1];
        simple.extend(3u64.to_le_bytes());
        simple.extend(2u64.to_le_bytes());
        let simple = Dataspace::parse(&simple, SIZES).unwrap();
        assert!(!simple.is_scalar());
        assert_eq!(simple.element_count(), 6);

        let null = Dataspace::parse(&[2, 0, 0, 2], SIZES).unwrap();
        assert_eq!(null.element_count(), 0);
    }

    #[test]
    fn fixed_string_padding_modes() {
        let spaced = [0x13, 0x02, 0, 0, 6, 0, 0, 0];
        assert_eq!(
            parse(&spaced),
            Datatype::FixedString {
                size: 6,
                padding: Padding::SpacePadded
            }
        );
        assert_eq!(text(b"mouse ".trim_ascii_end()), AttrValue::from("mouse"));
        assert_eq!(text(until_nul(b"rat\0\0\0")), AttrValue::from("rat"));
        assert_eq!(text(&[0xff, 0x61]), AttrValue::Bytes(vec![0xff, 0x61]));
    }

    #[test]
    fn two_member_true_false_enum_is_boolean() {
        // enum of int8 with FALSE=0, TRUE=1 (version 1, names padded to 8)
        let mut bytes = vec![0x18, 0x02, 0x00, 0x00, 1, 0, 0, 0];
        bytes.extend([0x10, 0x08, 0, 0, 1, 0, 0, 0, 0, 0, 8, 0]);
        bytes.extend(b"FALSE\0\0\0TRUE\0\0\0\0");
        bytes.extend([0, 1]);
        let Datatype::Enum { members, .. } = parse(&bytes) else {
            panic!("expected an enum");
        };
        assert!(is_bool_enum(&members));
        assert_eq!(members[1], ("TRUE".to_string(), vec![1]));
    }
}
