use bytes::Bytes;
use std::ops::Index;

use crate::value::Value;

/// The arguments of an event or of an acknowledgement. A single value
/// converts into a payload with one argument, vectors of JSON values or
/// strings into one argument per element.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload(Vec<Value>);

impl Payload {
    pub fn new(args: Vec<Value>) -> Self {
        Payload(args)
    }

    pub fn args(&self) -> &[Value] {
        &self.0
    }

    pub fn into_args(self) -> Vec<Value> {
        self.0
    }

    pub fn first(&self) -> Option<&Value> {
        self.0.first()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_binary(&self) -> bool {
        self.0.iter().any(Value::has_binary)
    }

    pub(crate) fn last(&self) -> Option<&Value> {
        self.0.last()
    }
}

impl Index<usize> for Payload {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.0[index]
    }
}

impl IntoIterator for Payload {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<()> for Payload {
    fn from(_: ()) -> Self {
        Payload::default()
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload(vec![value])
    }
}

impl From<Vec<Value>> for Payload {
    fn from(args: Vec<Value>) -> Self {
        Payload(args)
    }
}

impl From<&str> for Payload {
    fn from(string: &str) -> Self {
        Payload::from(Value::from(string))
    }
}

impl From<String> for Payload {
    fn from(string: String) -> Self {
        Payload::from(Value::from(string))
    }
}

impl From<Vec<&str>> for Payload {
    fn from(strings: Vec<&str>) -> Self {
        Payload(strings.into_iter().map(Value::from).collect())
    }
}

impl From<Vec<String>> for Payload {
    fn from(strings: Vec<String>) -> Self {
        Payload(strings.into_iter().map(Value::from).collect())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::from(Value::from(value))
    }
}

impl From<Vec<serde_json::Value>> for Payload {
    fn from(values: Vec<serde_json::Value>) -> Self {
        Payload(values.into_iter().map(Value::from).collect())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::from(Value::from(data))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(data: &'static [u8]) -> Self {
        Payload::from(Value::from(data))
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::from(Value::from(data))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_from() {
        let sut = Payload::from("foo ™");
        assert_eq!(sut.args(), &[Value::String("foo ™".to_owned())]);

        let sut = Payload::from(String::from("foo ™"));
        assert_eq!(sut.args(), &[Value::String("foo ™".to_owned())]);

        let sut = Payload::from(json!({"foo": "bar"}));
        assert_eq!(sut.len(), 1);
        assert_eq!(sut[0].get("foo").and_then(Value::as_str), Some("bar"));

        let sut = Payload::from(vec![1, 2, 3]);
        assert_eq!(sut.args(), &[Value::Binary(Bytes::from_static(&[1, 2, 3]))]);
        assert!(sut.has_binary());

        let sut = Payload::from(&[1_u8, 2_u8, 3_u8][..]);
        assert_eq!(sut.args(), &[Value::Binary(Bytes::from_static(&[1, 2, 3]))]);

        let sut = Payload::from(vec!["foo ™", "bar ™"]);
        assert_eq!(
            sut.into_args(),
            vec![Value::from("foo ™"), Value::from("bar ™")]
        );

        let sut = Payload::from(vec![json!("foo ™"), json!(1)]);
        assert_eq!(sut.into_args(), vec![Value::from("foo ™"), Value::from(1)]);

        assert!(Payload::from(()).is_empty());
    }
}
