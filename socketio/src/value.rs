use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Number};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

const PLACEHOLDER: &str = "_placeholder";
const PLACEHOLDER_NUM: &str = "num";

/// The data carried by `socket.io` packets. It mirrors JSON with one extra
/// leaf for binary data, which never travels inside the JSON text: the
/// encoder swaps every [`Value::Binary`] for a placeholder and sends the
/// bytes as separate attachments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Binary(Bytes),
}

impl Value {
    /// Converts anything serde can serialize. Binary fields of `value` end up
    /// as arrays of numbers, use [`Value::Binary`] to send raw bytes.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Value> {
        Ok(Value::from(serde_json::to_value(value)?))
    }

    /// Whether a binary leaf is reachable from this value.
    pub fn has_binary(&self) -> bool {
        match self {
            Value::Binary(_) => true,
            Value::Array(values) => values.iter().any(Value::has_binary),
            Value::Object(map) => map.values().any(Value::has_binary),
            _ => false,
        }
    }

    /// Replaces every binary leaf with a placeholder pointing into `buffers`,
    /// in depth first order.
    pub(crate) fn deconstruct(self, buffers: &mut Vec<Bytes>) -> Value {
        match self {
            Value::Binary(data) => {
                let num = buffers.len();
                buffers.push(data);
                let mut placeholder = BTreeMap::new();
                placeholder.insert(PLACEHOLDER.to_owned(), Value::Bool(true));
                placeholder.insert(PLACEHOLDER_NUM.to_owned(), Value::from(num as u64));
                Value::Object(placeholder)
            }
            Value::Array(values) => Value::Array(
                values
                    .into_iter()
                    .map(|value| value.deconstruct(buffers))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, value.deconstruct(buffers)))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Puts the attachments back where their placeholders are. A placeholder
    /// pointing outside of `buffers` fails the whole packet.
    pub(crate) fn reconstruct(self, buffers: &[Bytes]) -> Result<Value> {
        match self {
            Value::Object(map) if is_placeholder(&map) => {
                let index = map
                    .get(PLACEHOLDER_NUM)
                    .and_then(Value::as_u64)
                    .and_then(|num| usize::try_from(num).ok())
                    .filter(|num| *num < buffers.len())
                    .ok_or(Error::IllegalAttachments())?;
                Ok(Value::Binary(buffers[index].clone()))
            }
            Value::Array(values) => values
                .into_iter()
                .map(|value| value.reconstruct(buffers))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => map
                .into_iter()
                .map(|(key, value)| Ok((key, value.reconstruct(buffers)?)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Value::Object),
            other => Ok(other),
        }
    }

    /// The JSON form of this value. Binary leaves become arrays of byte values.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(values) => {
                serde_json::Value::Array(values.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect::<Map<_, _>>(),
            ),
            Value::Binary(data) => {
                serde_json::Value::Array(data.iter().map(|b| serde_json::Value::from(*b)).collect())
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up `key` if this is an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }
}

fn is_placeholder(map: &BTreeMap<String, Value>) -> bool {
    map.get(PLACEHOLDER) == Some(&Value::Bool(true))
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(values) => {
                Value::Array(values.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        value.to_json()
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

/// Non finite numbers have no JSON form and turn into [`Value::Null`].
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(data: Bytes) -> Self {
        Value::Binary(data)
    }
}

impl From<Vec<u8>> for Value {
    fn from(data: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(data))
    }
}

impl From<&'static [u8]> for Value {
    fn from(data: &'static [u8]) -> Self {
        Value::Binary(Bytes::from_static(data))
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Array(values)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn nested() -> Value {
        let mut map = BTreeMap::new();
        map.insert("name".to_owned(), Value::from("avatar"));
        map.insert("image".to_owned(), Value::from(vec![1_u8, 2, 3]));
        map.insert(
            "thumbs".to_owned(),
            Value::Array(vec![Value::from(vec![4_u8]), Value::from(7)]),
        );
        Value::Object(map)
    }

    #[test]
    fn binary_is_found_at_any_depth() {
        assert!(nested().has_binary());
        assert!(!Value::from(json!({"a": [1, {"b": "c"}]})).has_binary());
        assert!(Value::Array(vec![Value::Null, Value::from(Bytes::new())]).has_binary());
    }

    #[test]
    fn deconstruct_replaces_binary_with_placeholders() {
        let mut buffers = Vec::new();
        let value = nested().deconstruct(&mut buffers);

        assert!(!value.has_binary());
        // keys are visited in order: image, name, thumbs
        assert_eq!(
            buffers,
            vec![Bytes::from_static(&[1, 2, 3]), Bytes::from_static(&[4])]
        );
        assert_eq!(
            value.to_json(),
            json!({
                "name": "avatar",
                "image": {"_placeholder": true, "num": 0},
                "thumbs": [{"_placeholder": true, "num": 1}, 7],
            })
        );

        assert_eq!(value.reconstruct(&buffers).unwrap(), nested());
    }

    #[test]
    fn placeholder_outside_of_attachments_is_rejected() {
        let value = Value::from(json!([{"_placeholder": true, "num": 1}]));
        let result = value.reconstruct(&[Bytes::from_static(b"x")]);
        assert!(matches!(result, Err(Error::IllegalAttachments())));

        let value = Value::from(json!({"_placeholder": true, "num": "0"}));
        assert!(matches!(
            value.reconstruct(&[Bytes::from_static(b"x")]),
            Err(Error::IllegalAttachments())
        ));
    }

    #[test]
    fn objects_that_merely_look_similar_are_kept() {
        let value = Value::from(json!({"_placeholder": false, "num": 0}));
        assert_eq!(value.clone().reconstruct(&[]).unwrap(), value);
    }

    #[test]
    fn serializable_types_are_converted() {
        #[derive(Serialize)]
        struct Position {
            x: f64,
            y: f64,
        }

        let value = Value::from_serializable(&Position { x: 1.5, y: -2.0 }).unwrap();
        assert_eq!(value.get("x").and_then(Value::as_f64), Some(1.5));
        assert_eq!(value.get("y").and_then(Value::as_f64), Some(-2.0));
        assert_eq!(Value::from(f64::NAN), Value::Null);
    }
}
