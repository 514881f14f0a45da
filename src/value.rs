use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Number, Value};

/// Raw attribute or dataset value as read out of an NWB file.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bytes(Vec<u8>),
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    List(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
    /// Object references, compound records and anything else without a JSON shape.
    Opaque(String),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bytes(bytes) => write!(f, "{}", decode_utf8_dropping_invalid(bytes)),
            AttrValue::Str(value) => write!(f, "{value}"),
            AttrValue::Int(value) => write!(f, "{value}"),
            AttrValue::UInt(value) => write!(f, "{value}"),
            AttrValue::Float(value) => write!(f, "{value}"),
            AttrValue::Bool(value) => write!(f, "{value}"),
            AttrValue::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            AttrValue::Map(map) => {
                write!(f, "{{")?;
                for (idx, (key, item)) in map.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {item}")?;
                }
                write!(f, "}}")
            }
            AttrValue::Opaque(repr) => write!(f, "{repr}"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<Value> for AttrValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => AttrValue::Opaque("None".to_string()),
            Value::Bool(value) => AttrValue::Bool(value),
            Value::Number(number) => {
                if let Some(value) = number.as_i64() {
                    AttrValue::Int(value)
                } else if let Some(value) = number.as_u64() {
                    AttrValue::UInt(value)
                } else {
                    AttrValue::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(value) => AttrValue::Str(value),
            Value::Array(items) => AttrValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => AttrValue::Map(
                map.into_iter()
                    .map(|(key, value)| (key, value.into()))
                    .collect(),
            ),
        }
    }
}

/// Converts any attribute value into JSON. Never fails.
pub fn normalize(value: &AttrValue) -> Value {
    match value {
        AttrValue::Bytes(bytes) => Value::String(decode_utf8_dropping_invalid(bytes)),
        AttrValue::Str(value) => Value::String(value.clone()),
        AttrValue::Int(value) => Value::Number((*value).into()),
        AttrValue::UInt(value) => Value::Number((*value).into()),
        AttrValue::Float(value) => Number::from_f64(*value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string())),
        AttrValue::Bool(value) => Value::Bool(*value),
        AttrValue::List(items) => Value::Array(items.iter().map(normalize).collect()),
        AttrValue::Map(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), normalize(value)))
                .collect::<Map<_, _>>(),
        ),
        AttrValue::Opaque(repr) => Value::String(repr.clone()),
    }
}

/// Like [`normalize`], but numeric scalars come back as strings. Used for the
/// well-known session and subject fields, which downstream consumers treat as text.
pub fn normalize_text(value: &AttrValue) -> Value {
    match value {
        AttrValue::Int(_) | AttrValue::UInt(_) | AttrValue::Float(_) | AttrValue::Bool(_) => {
            Value::String(value.to_string())
        }
        AttrValue::List(items) => Value::Array(items.iter().map(normalize_text).collect()),
        other => normalize(other),
    }
}

/// Decodes UTF-8, dropping undecodable bytes instead of substituting U+FFFD.
fn decode_utf8_dropping_invalid(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn bytes_decode_as_utf8() {
        let value = AttrValue::Bytes(b"caf\xc3\xa9".to_vec());
        assert_eq!(normalize(&value), json!("café"));
    }

    #[test]
    fn undecodable_bytes_are_dropped() {
        assert_eq!(normalize(&AttrValue::Bytes(b"\xff\xfe".to_vec())), json!(""));
        assert_eq!(
            normalize(&AttrValue::Bytes(b"ab\xffcd".to_vec())),
            json!("abcd")
        );
    }

    #[test]
    fn nested_mapping_is_normalized() {
        let mut map = BTreeMap::new();
        map.insert(
            "a".to_string(),
            AttrValue::List(vec![AttrValue::Int(1), AttrValue::Bytes(b"x".to_vec())]),
        );
        assert_eq!(normalize(&AttrValue::Map(map)), json!({"a": [1, "x"]}));
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(normalize(&AttrValue::Float(2.5)), json!(2.5));
        assert_eq!(normalize(&AttrValue::UInt(u64::MAX)), json!(u64::MAX));
        assert_eq!(normalize(&AttrValue::from("P90D")), json!("P90D"));
    }

    #[test]
    fn non_finite_and_opaque_fall_back_to_text() {
        assert_eq!(normalize(&AttrValue::Float(f64::NAN)), json!("NaN"));
        assert_eq!(
            normalize(&AttrValue::Opaque("<HDF5 object reference>".to_string())),
            json!("<HDF5 object reference>")
        );
    }

    #[test]
    fn text_variant_stringifies_numbers() {
        assert_eq!(normalize_text(&AttrValue::Int(42)), json!("42"));
        assert_eq!(
            normalize_text(&AttrValue::List(vec![AttrValue::Float(1.5)])),
            json!(["1.5"])
        );
        assert_eq!(normalize_text(&AttrValue::from("M")), json!("M"));
    }
}
