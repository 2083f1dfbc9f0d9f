//! Self-describing event-name/value documents. A document is an ordered
//! sequence of named values; the first field of a data document names the
//! operation and the remaining fields are its parameters. Two codecs share
//! the same contract: a binary form used in production and a YAML-like text
//! form kept for debuggability. The choice is per-channel and fixed at
//! connect time.

use flint::shared::WireResult;

pub mod binary;
pub mod text;

pub use self::binary::BinaryCodec;
pub use self::text::TextCodec;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    /// Opaque marshalled payload tagged with the class literal of the type
    /// that produced it. The core never looks inside.
    Marshalled {
        class: String,
        data: Vec<u8>,
    },
    Nested(Document),
}

impl Value {
    /// Widening view of any integer variant.
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(v) => Some(i64::from(*v)),
            Value::I16(v) => Some(i64::from(*v)),
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_nested(&self) -> Option<&Document> {
        match self {
            Value::Nested(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    #[inline]
    pub fn new() -> Document {
        Document { fields: Vec::new() }
    }

    /// Builder-style append, used all over request construction.
    #[inline]
    pub fn with<N: Into<String>>(mut self, name: N, value: Value) -> Document {
        self.push(name, value);
        self
    }

    #[inline]
    pub fn push<N: Into<String>>(&mut self, name: N, value: Value) {
        self.fields.push((name.into(), value));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[inline]
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// The first field, which on data documents names the operation.
    #[inline]
    pub fn first(&self) -> Option<(&str, &Value)> {
        self.fields.first().map(|(name, value)| (name.as_str(), value))
    }

    /// First value stored under `name`, if any.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    #[inline]
    pub fn i64_field(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    #[inline]
    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    #[inline]
    pub fn text_field(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_text)
    }

    #[inline]
    pub fn bytes_field(&self, name: &str) -> Option<&[u8]> {
        self.get(name).and_then(Value::as_bytes)
    }
}

/// Shared encoder/decoder contract for the two wire forms.
pub trait Codec: Send + Sync {
    fn encode(&self, doc: &Document, out: &mut Vec<u8>) -> WireResult<()>;
    fn decode(&self, buf: &[u8]) -> WireResult<Document>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WireFormat {
    Binary,
    Text,
}

static BINARY: BinaryCodec = BinaryCodec;
static TEXT: TextCodec = TextCodec;

impl WireFormat {
    #[inline]
    pub fn codec(self) -> &'static dyn Codec {
        match self {
            WireFormat::Binary => &BINARY,
            WireFormat::Text => &TEXT,
        }
    }

    pub fn parse(name: &str) -> Option<WireFormat> {
        match name {
            "binary" => Some(WireFormat::Binary),
            "text" => Some(WireFormat::Text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_access() {
        let doc = Document::new()
            .with("get", Value::Null)
            .with("key", Value::Bytes(vec![1, 2]))
            .with("count", Value::I32(7))
            .with("flag", Value::Bool(true))
            .with("label", Value::Text("views".to_string()));

        assert_eq!(doc.first().unwrap().0, "get");
        assert_eq!(doc.bytes_field("key"), Some(&[1u8, 2][..]));
        assert_eq!(doc.i64_field("count"), Some(7));
        assert_eq!(doc.bool_field("flag"), Some(true));
        assert_eq!(doc.text_field("label"), Some("views"));
        assert_eq!(doc.get("missing"), None);
    }

    #[test]
    fn test_int_widening() {
        assert_eq!(Value::I8(-3).as_i64(), Some(-3));
        assert_eq!(Value::I16(300).as_i64(), Some(300));
        assert_eq!(Value::I64(1 << 40).as_i64(), Some(1 << 40));
        assert_eq!(Value::Bool(true).as_i64(), None);
    }

    #[test]
    fn test_duplicate_names_first_wins() {
        let doc = Document::new()
            .with("x", Value::I32(1))
            .with("x", Value::I32(2));

        assert_eq!(doc.i64_field("x"), Some(1));
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(WireFormat::parse("binary"), Some(WireFormat::Binary));
        assert_eq!(WireFormat::parse("text"), Some(WireFormat::Text));
        assert_eq!(WireFormat::parse("yaml"), None);
    }
}
