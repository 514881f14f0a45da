//! Decoding of LINDI indexes: a Zarr-style JSON reference store describing an
//! HDF5 file. Groups and arrays are recovered from `.zgroup` / `.zarray` keys,
//! attributes from `.zattrs`, soft links from the reserved `_SOFT_LINK`
//! attribute. Inline chunks are decoded directly; a chunk that points into the
//! remote HDF5 file is fetched only for small scalar datasets, and only when a
//! [`ChunkSource`] is supplied.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};

use tracing::debug;

use crate::error::SyncError;
use crate::hdf5::VALUE_LIMIT;
use crate::tree::{NodeTree, TreeBuilder, normalize_path};
use crate::value::AttrValue;

const RESERVED_ATTRS: &[&str] = &["_SCALAR", "_SOFT_LINK", "_EXTERNAL_ARRAY_LINK"];

/// Byte ranges of the files an index refers to.
pub trait ChunkSource {
    fn read_range(&self, url: &str, offset: u64, size: u64) -> Result<Vec<u8>, SyncError>;
}

/// Parses an index without touching the network.
pub fn parse_index(bytes: &[u8]) -> Result<NodeTree, SyncError> {
    parse_index_with(bytes, None)
}

pub fn parse_index_with(
    bytes: &[u8],
    chunks: Option<&dyn ChunkSource>,
) -> Result<NodeTree, SyncError> {
    let index: Value =
        serde_json::from_slice(bytes).map_err(|err| SyncError::IndexParse(err.to_string()))?;
    tree_from_index_with(&index, chunks)
}

pub fn tree_from_index(index: &Value) -> Result<NodeTree, SyncError> {
    tree_from_index_with(index, None)
}

pub fn tree_from_index_with(
    index: &Value,
    chunks: Option<&dyn ChunkSource>,
) -> Result<NodeTree, SyncError> {
    let refs = index
        .get("refs")
        .and_then(Value::as_object)
        .ok_or_else(|| SyncError::IndexParse("missing refs object".to_string()))?;

    let mut groups = Vec::new();
    let mut arrays = Vec::new();
    for key in refs.keys() {
        if let Some(prefix) = strip_meta_key(key, ".zgroup") {
            groups.push(normalize_path(prefix));
        } else if let Some(prefix) = strip_meta_key(key, ".zarray") {
            arrays.push(normalize_path(prefix));
        }
    }

    let mut builder = TreeBuilder::new();
    for path in &groups {
        let attrs = node_attrs(refs, path);
        match soft_link_target(attrs) {
            Some(target) => builder = builder.link(path, &target),
            None => builder = builder.group(path),
        }
    }
    for path in &arrays {
        let value = refs
            .get(&meta_key(path, ".zarray"))
            .and_then(|zarray| decode_array(refs, path, zarray, node_attrs(refs, path), chunks));
        builder = builder.dataset(path, value);
    }
    for path in groups.iter().chain(arrays.iter()) {
        let Some(attrs) = node_attrs(refs, path) else {
            continue;
        };
        if soft_link_target(Some(attrs)).is_some() {
            continue;
        }
        for (name, value) in attrs {
            if RESERVED_ATTRS.contains(&name.as_str()) {
                continue;
            }
            builder = builder.attr(path, name, attr_value(value));
        }
    }
    Ok(builder.build())
}

fn strip_meta_key<'a>(key: &'a str, suffix: &str) -> Option<&'a str> {
    if key == suffix {
        return Some("");
    }
    key.strip_suffix(suffix)?.strip_suffix('/')
}

fn meta_key(path: &str, suffix: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        suffix.to_string()
    } else {
        format!("{trimmed}/{suffix}")
    }
}

fn node_attrs<'a>(refs: &'a Map<String, Value>, path: &str) -> Option<&'a Map<String, Value>> {
    refs.get(&meta_key(path, ".zattrs"))
        .and_then(Value::as_object)
}

fn soft_link_target(attrs: Option<&Map<String, Value>>) -> Option<String> {
    attrs?
        .get("_SOFT_LINK")?
        .get("path")?
        .as_str()
        .map(normalize_path)
}

fn attr_value(value: &Value) -> AttrValue {
    match value {
        Value::Object(map) if map.contains_key("_REFERENCE") => {
            AttrValue::Opaque(value.to_string())
        }
        other => AttrValue::from(other.clone()),
    }
}

fn decode_array(
    refs: &Map<String, Value>,
    path: &str,
    zarray: &Value,
    attrs: Option<&Map<String, Value>>,
    chunks: Option<&dyn ChunkSource>,
) -> Option<AttrValue> {
    if zarray.get("compressor").is_some_and(|value| !value.is_null()) {
        return None;
    }
    let shape = dims(zarray, "shape").unwrap_or_default();
    let scalar = shape.is_empty()
        || attrs.is_some_and(|attrs| attrs.get("_SCALAR").is_some_and(|v| v == &Value::Bool(true)));
    let dtype = zarray.get("dtype").and_then(Value::as_str).unwrap_or("|O");

    let key = single_chunk_key(zarray, &shape)?;
    let chunk = match refs.get(&meta_key(path, &key))? {
        Value::String(text) => match text.strip_prefix("base64:") {
            Some(encoded) => STANDARD.decode(encoded).ok()?,
            None => text.as_bytes().to_vec(),
        },
        Value::Array(location) if scalar => fetch_chunk(location, chunks?, path)?,
        _ => return None,
    };
    let value = if dtype == "|O" {
        decode_object_chunk(&chunk)?
    } else {
        decode_numeric_chunk(dtype, &chunk)?
    };
    Some(if scalar { unwrap_scalar(value) } else { value })
}

fn dims(zarray: &Value, field: &str) -> Option<Vec<u64>> {
    zarray
        .get(field)
        .and_then(Value::as_array)
        .map(|dims| dims.iter().filter_map(Value::as_u64).collect())
}

/// Key of the only chunk of an array stored as a single chunk; `None` when the
/// array spans several chunks or none at all.
fn single_chunk_key(zarray: &Value, shape: &[u64]) -> Option<String> {
    if shape.is_empty() {
        return Some("0".to_string());
    }
    let chunk_shape = dims(zarray, "chunks").unwrap_or_else(|| shape.to_vec());
    if chunk_shape.len() != shape.len() {
        return None;
    }
    let single = shape
        .iter()
        .zip(&chunk_shape)
        .all(|(len, chunk)| *len > 0 && *chunk >= *len);
    if !single {
        return None;
    }
    let separator = zarray
        .get("dimension_separator")
        .and_then(Value::as_str)
        .unwrap_or(".");
    Some(vec!["0"; shape.len()].join(separator))
}

/// Reads a `[url, offset, size]` reference into the remote file.
fn fetch_chunk(location: &[Value], chunks: &dyn ChunkSource, path: &str) -> Option<Vec<u8>> {
    let [url, offset, size] = location else {
        return None;
    };
    let (url, offset, size) = (url.as_str()?, offset.as_u64()?, size.as_u64()?);
    if size > VALUE_LIMIT {
        return None;
    }
    match chunks.read_range(url, offset, size) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            debug!(path = %path, url = %url, error = %err, "could not fetch referenced chunk");
            None
        }
    }
}

/// Object arrays use the numcodecs JSON layout: `[item..., dtype, shape]`.
fn decode_object_chunk(chunk: &[u8]) -> Option<AttrValue> {
    let parsed: Value = match serde_json::from_slice(chunk) {
        Ok(value) => value,
        Err(_) => return Some(AttrValue::Bytes(chunk.to_vec())),
    };
    match parsed {
        Value::Array(mut items) if items.len() >= 2 && items[items.len() - 1].is_array() => {
            items.truncate(items.len() - 2);
            Some(AttrValue::List(items.into_iter().map(AttrValue::from).collect()))
        }
        other => Some(AttrValue::from(other)),
    }
}

fn decode_numeric_chunk(dtype: &str, chunk: &[u8]) -> Option<AttrValue> {
    let mut chars = dtype.chars();
    let order = chars.next()?;
    let kind = chars.next()?;
    let width = chars.as_str().parse::<usize>().ok()?;
    if width == 0 || order == '>' {
        return None;
    }
    let values = chunk
        .chunks_exact(width)
        .map(|raw| decode_element(kind, raw))
        .collect::<Option<Vec<_>>>()?;
    Some(AttrValue::List(values))
}

fn decode_element(kind: char, raw: &[u8]) -> Option<AttrValue> {
    let mut buf = [0u8; 8];
    match kind {
        'S' => return Some(AttrValue::Bytes(raw.iter().copied().take_while(|b| *b != 0).collect())),
        'b' => return Some(AttrValue::Bool(raw.first().is_some_and(|b| *b != 0))),
        _ => {}
    }
    if raw.len() > 8 {
        return None;
    }
    buf[..raw.len()].copy_from_slice(raw);
    match (kind, raw.len()) {
        ('i', width) => {
            let shift = 64 - 8 * width as u32;
            Some(AttrValue::Int((i64::from_le_bytes(buf) << shift) >> shift))
        }
        ('u', _) => Some(AttrValue::UInt(u64::from_le_bytes(buf))),
        ('f', 4) => Some(AttrValue::Float(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64)),
        ('f', 8) => Some(AttrValue::Float(f64::from_le_bytes(buf))),
        _ => None,
    }
}

fn unwrap_scalar(value: AttrValue) -> AttrValue {
    match value {
        AttrValue::List(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    }
}
