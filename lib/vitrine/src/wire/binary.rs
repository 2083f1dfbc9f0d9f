use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use flint::shared::{ErrorType, SizedRead, WireError, WireResult};

use crate::wire::{Codec, Document, Value};

// One tag byte per value, followed by the value encoding. Field names are
// length-prefixed UTF-8. All integers little-endian.
const TAG_NULL: u8 = 0;
const TAG_I8: u8 = 1;
const TAG_I16: u8 = 2;
const TAG_I32: u8 = 3;
const TAG_I64: u8 = 4;
const TAG_BOOL: u8 = 5;
const TAG_TEXT: u8 = 6;
const TAG_BYTES: u8 = 7;
const TAG_MARSHALLED: u8 = 8;
const TAG_NESTED: u8 = 9;

const MAX_NAME_LEN: usize = u16::max_value() as usize;
const MAX_DEPTH: usize = 16;

/// The production codec.
#[derive(Debug, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn encode(&self, doc: &Document, out: &mut Vec<u8>) -> WireResult<()> {
        encode_doc(doc, out, 0)
    }

    fn decode(&self, buf: &[u8]) -> WireResult<Document> {
        let mut cursor = Cursor::new(buf);
        let doc = decode_doc(&mut cursor, buf.len(), 0)?;

        if cursor.remaining_data() != 0 {
            return Err(WireError::Fatal(ErrorType::Codec));
        }

        Ok(doc)
    }
}

fn encode_doc(doc: &Document, out: &mut Vec<u8>, depth: usize) -> WireResult<()> {
    if depth > MAX_DEPTH {
        return Err(WireError::Fatal(ErrorType::Codec));
    }

    for (name, value) in doc.fields() {
        write_name(name, out)?;
        encode_value(value, out, depth)?;
    }

    Ok(())
}

fn encode_value(value: &Value, out: &mut Vec<u8>, depth: usize) -> WireResult<()> {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::I8(v) => {
            out.push(TAG_I8);
            out.write_i8(*v).map_err(WireError::from)?;
        }
        Value::I16(v) => {
            out.push(TAG_I16);
            out.write_i16::<LittleEndian>(*v).map_err(WireError::from)?;
        }
        Value::I32(v) => {
            out.push(TAG_I32);
            out.write_i32::<LittleEndian>(*v).map_err(WireError::from)?;
        }
        Value::I64(v) => {
            out.push(TAG_I64);
            out.write_i64::<LittleEndian>(*v).map_err(WireError::from)?;
        }
        Value::Bool(v) => {
            out.push(TAG_BOOL);
            out.push(*v as u8);
        }
        Value::Text(v) => {
            out.push(TAG_TEXT);
            write_blob(v.as_bytes(), out)?;
        }
        Value::Bytes(v) => {
            out.push(TAG_BYTES);
            write_blob(v, out)?;
        }
        Value::Marshalled { class, data } => {
            out.push(TAG_MARSHALLED);
            write_name(class, out)?;
            write_blob(data, out)?;
        }
        Value::Nested(inner) => {
            out.push(TAG_NESTED);
            let mut nested = Vec::new();
            encode_doc(inner, &mut nested, depth + 1)?;
            write_blob(&nested, out)?;
        }
    }

    Ok(())
}

fn decode_doc(cursor: &mut Cursor<&[u8]>, end: usize, depth: usize) -> WireResult<Document> {
    if depth > MAX_DEPTH {
        return Err(WireError::Fatal(ErrorType::Codec));
    }

    let mut doc = Document::new();

    while (cursor.position() as usize) < end {
        let name = read_name(cursor)?;
        let value = decode_value(cursor, depth)?;
        doc.push(name, value);
    }

    Ok(doc)
}

fn decode_value(cursor: &mut Cursor<&[u8]>, depth: usize) -> WireResult<Value> {
    let tag = cursor.read_u8().map_err(codec_err)?;

    let value = match tag {
        TAG_NULL => Value::Null,
        TAG_I8 => Value::I8(cursor.read_i8().map_err(codec_err)?),
        TAG_I16 => Value::I16(cursor.read_i16::<LittleEndian>().map_err(codec_err)?),
        TAG_I32 => Value::I32(cursor.read_i32::<LittleEndian>().map_err(codec_err)?),
        TAG_I64 => Value::I64(cursor.read_i64::<LittleEndian>().map_err(codec_err)?),
        TAG_BOOL => match cursor.read_u8().map_err(codec_err)? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            _ => return Err(WireError::Fatal(ErrorType::Codec)),
        },
        TAG_TEXT => {
            let blob = read_blob(cursor)?;
            Value::Text(String::from_utf8(blob).map_err(|_| WireError::Fatal(ErrorType::Codec))?)
        }
        TAG_BYTES => Value::Bytes(read_blob(cursor)?),
        TAG_MARSHALLED => {
            let class = read_name(cursor)?;
            let data = read_blob(cursor)?;
            Value::Marshalled { class, data }
        }
        TAG_NESTED => {
            let blob = read_blob(cursor)?;
            let mut nested = Cursor::new(&blob[..]);
            let doc = decode_doc(&mut nested, blob.len(), depth + 1)?;
            Value::Nested(doc)
        }
        _ => return Err(WireError::Fatal(ErrorType::Codec)),
    };

    Ok(value)
}

fn write_name(name: &str, out: &mut Vec<u8>) -> WireResult<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(WireError::Fatal(ErrorType::Codec));
    }

    out.write_u16::<LittleEndian>(name.len() as u16)
        .map_err(WireError::from)?;
    out.extend_from_slice(name.as_bytes());
    Ok(())
}

fn read_name(cursor: &mut Cursor<&[u8]>) -> WireResult<String> {
    let len = cursor.read_u16::<LittleEndian>().map_err(codec_err)? as usize;
    let bytes = take(cursor, len)?;
    String::from_utf8(bytes).map_err(|_| WireError::Fatal(ErrorType::Codec))
}

fn write_blob(data: &[u8], out: &mut Vec<u8>) -> WireResult<()> {
    out.write_u32::<LittleEndian>(data.len() as u32)
        .map_err(WireError::from)?;
    out.extend_from_slice(data);
    Ok(())
}

fn read_blob(cursor: &mut Cursor<&[u8]>) -> WireResult<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>().map_err(codec_err)? as usize;
    take(cursor, len)
}

fn take(cursor: &mut Cursor<&[u8]>, len: usize) -> WireResult<Vec<u8>> {
    if cursor.remaining_data() < len {
        return Err(WireError::Fatal(ErrorType::Codec));
    }

    let start = cursor.position() as usize;
    let bytes = cursor.get_ref()[start..start + len].to_vec();
    cursor.set_position((start + len) as u64);
    Ok(bytes)
}

#[inline]
fn codec_err(_: std::io::Error) -> WireError {
    WireError::Fatal(ErrorType::Codec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(doc: &Document) -> Document {
        let codec = BinaryCodec;
        let mut out = Vec::new();
        codec.encode(doc, &mut out).unwrap();
        codec.decode(&out).unwrap()
    }

    #[test]
    fn test_scalar_roundtrip() {
        let doc = Document::new()
            .with("put", Value::Null)
            .with("tiny", Value::I8(-5))
            .with("small", Value::I16(-300))
            .with("mid", Value::I32(1 << 20))
            .with("wide", Value::I64(-(1 << 40)))
            .with("flag", Value::Bool(true))
            .with("name", Value::Text("café".to_string()))
            .with("key", Value::Bytes(vec![0, 1, 255]));

        assert_eq!(roundtrip(&doc), doc);
    }

    #[test]
    fn test_nested_and_marshalled_roundtrip() {
        let inner = Document::new()
            .with("type", Value::Text("set-proxy".to_string()))
            .with("cid", Value::I64(42));

        let doc = Document::new()
            .with("reply", Value::Nested(inner))
            .with(
                "blob",
                Value::Marshalled {
                    class: "net.vitrine.Payload".to_string(),
                    data: vec![9; 100],
                },
            );

        assert_eq!(roundtrip(&doc), doc);
    }

    #[test]
    fn test_empty_document() {
        let doc = Document::new();
        assert_eq!(roundtrip(&doc), doc);
    }

    #[test]
    fn test_truncated_input_rejected() {
        let codec = BinaryCodec;
        let mut out = Vec::new();
        codec
            .encode(&Document::new().with("key", Value::Bytes(vec![1, 2, 3])), &mut out)
            .unwrap();

        for cut in 1..out.len() {
            let result = codec.decode(&out[..cut]);
            assert_eq!(result, Err(WireError::Fatal(ErrorType::Codec)), "cut {}", cut);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let codec = BinaryCodec;
        // Field name "x" followed by tag 200.
        let bytes = [1u8, 0, b'x', 200];
        assert_eq!(codec.decode(&bytes), Err(WireError::Fatal(ErrorType::Codec)));
    }

    #[test]
    fn test_bad_bool_rejected() {
        let codec = BinaryCodec;
        let bytes = [1u8, 0, b'x', TAG_BOOL, 2];
        assert_eq!(codec.decode(&bytes), Err(WireError::Fatal(ErrorType::Codec)));
    }

    #[test]
    fn test_depth_limit() {
        let mut doc = Document::new().with("leaf", Value::I8(1));
        for _ in 0..MAX_DEPTH + 1 {
            doc = Document::new().with("sub", Value::Nested(doc));
        }

        let codec = BinaryCodec;
        let mut out = Vec::new();
        assert_eq!(
            codec.encode(&doc, &mut out),
            Err(WireError::Fatal(ErrorType::Codec))
        );
    }
}
