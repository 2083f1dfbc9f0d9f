use flint::shared::{ErrorType, WireError, WireResult};

use crate::wire::{Codec, Document, Value};

/// Debug codec: one `name: value` line per field, nested documents indented
/// by two spaces, non-text values introduced by a `!type` tag. Shares the
/// reader/writer contract with the binary codec so a channel can be flipped
/// to text wholesale when eyeballing traffic.
#[derive(Debug, Default)]
pub struct TextCodec;

const INDENT: usize = 2;

impl Codec for TextCodec {
    fn encode(&self, doc: &Document, out: &mut Vec<u8>) -> WireResult<()> {
        let mut text = String::new();
        encode_doc(doc, 0, &mut text)?;
        out.extend_from_slice(text.as_bytes());
        Ok(())
    }

    fn decode(&self, buf: &[u8]) -> WireResult<Document> {
        let text = std::str::from_utf8(buf).map_err(|_| codec_err())?;
        let lines: Vec<&str> = text.lines().collect();
        let mut pos = 0;
        let doc = parse_block(&lines, &mut pos, 0)?;

        if pos != lines.len() {
            return Err(codec_err());
        }

        Ok(doc)
    }
}

fn encode_doc(doc: &Document, depth: usize, out: &mut String) -> WireResult<()> {
    for (name, value) in doc.fields() {
        if name.is_empty() || name.contains(':') || name.contains('\n') || name.contains(' ') {
            return Err(codec_err());
        }

        for _ in 0..depth * INDENT {
            out.push(' ');
        }
        out.push_str(name);

        match value {
            Value::Nested(inner) => {
                out.push_str(":\n");
                encode_doc(inner, depth + 1, out)?;
            }
            other => {
                out.push_str(": ");
                encode_value(other, out);
                out.push('\n');
            }
        }
    }

    Ok(())
}

fn encode_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("!null"),
        Value::I8(v) => out.push_str(&format!("!i8 {}", v)),
        Value::I16(v) => out.push_str(&format!("!i16 {}", v)),
        Value::I32(v) => out.push_str(&format!("!i32 {}", v)),
        Value::I64(v) => out.push_str(&format!("!i64 {}", v)),
        Value::Bool(v) => out.push_str(&format!("!bool {}", v)),
        Value::Text(v) => {
            if needs_quoting(v) {
                out.push_str(&quote(v));
            } else {
                out.push_str(v);
            }
        }
        Value::Bytes(v) => {
            out.push_str("!bytes ");
            out.push_str(&to_hex(v));
        }
        Value::Marshalled { class, data } => {
            out.push_str("!marshalled ");
            out.push_str(class);
            out.push(' ');
            out.push_str(&to_hex(data));
        }
        Value::Nested(_) => unreachable!("nested handled by encode_doc"),
    }
}

fn parse_block(lines: &[&str], pos: &mut usize, depth: usize) -> WireResult<Document> {
    let mut doc = Document::new();
    let own_indent = depth * INDENT;

    while *pos < lines.len() {
        let line = lines[*pos];

        if line.trim().is_empty() {
            *pos += 1;
            continue;
        }

        let indent = line.len() - line.trim_start_matches(' ').len();

        if indent < own_indent {
            break;
        }
        if indent != own_indent {
            return Err(codec_err());
        }

        let content = &line[own_indent..];
        let colon = content.find(':').ok_or_else(codec_err)?;
        let name = &content[..colon];
        let rest = &content[colon + 1..];

        if name.is_empty() || name.contains(' ') {
            return Err(codec_err());
        }

        *pos += 1;

        if rest.is_empty() {
            let inner = parse_block(lines, pos, depth + 1)?;
            doc.push(name, Value::Nested(inner));
        } else {
            if !rest.starts_with(' ') {
                return Err(codec_err());
            }
            doc.push(name, parse_value(&rest[1..])?);
        }
    }

    Ok(doc)
}

fn parse_value(text: &str) -> WireResult<Value> {
    if let Some(stripped) = text.strip_prefix('!') {
        let (tag, arg) = match stripped.find(' ') {
            Some(space) => (&stripped[..space], &stripped[space + 1..]),
            None => (stripped, ""),
        };

        return match tag {
            "null" => Ok(Value::Null),
            "i8" => arg.parse().map(Value::I8).map_err(|_| codec_err()),
            "i16" => arg.parse().map(Value::I16).map_err(|_| codec_err()),
            "i32" => arg.parse().map(Value::I32).map_err(|_| codec_err()),
            "i64" => arg.parse().map(Value::I64).map_err(|_| codec_err()),
            "bool" => arg.parse().map(Value::Bool).map_err(|_| codec_err()),
            "bytes" => from_hex(arg).map(Value::Bytes),
            "marshalled" => {
                let space = arg.find(' ').ok_or_else(codec_err)?;
                let class = arg[..space].to_string();
                let data = from_hex(&arg[space + 1..])?;
                Ok(Value::Marshalled { class, data })
            }
            _ => Err(codec_err()),
        };
    }

    if text.starts_with('"') {
        return unquote(text).map(Value::Text);
    }

    Ok(Value::Text(text.to_string()))
}

fn needs_quoting(text: &str) -> bool {
    text.is_empty()
        || text.starts_with('!')
        || text.starts_with('"')
        || text.starts_with(' ')
        || text.ends_with(' ')
        || text.contains('\n')
        || text.contains('\r')
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ch => out.push(ch),
        }
    }
    out.push('"');
    out
}

fn unquote(text: &str) -> WireResult<String> {
    if text.len() < 2 || !text.ends_with('"') {
        return Err(codec_err());
    }

    let body = &text[1..text.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }

        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            _ => return Err(codec_err()),
        }
    }

    Ok(out)
}

fn to_hex(data: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

fn from_hex(text: &str) -> WireResult<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(codec_err());
    }

    let digits = text.as_bytes();
    let mut out = Vec::with_capacity(digits.len() / 2);

    for pair in digits.chunks(2) {
        let hi = hex_digit(pair[0])?;
        let lo = hex_digit(pair[1])?;
        out.push(hi << 4 | lo);
    }

    Ok(out)
}

fn hex_digit(digit: u8) -> WireResult<u8> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(codec_err()),
    }
}

#[inline]
fn codec_err() -> WireError {
    WireError::Fatal(ErrorType::Codec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(doc: &Document) -> Document {
        let codec = TextCodec;
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
            .with("flag", Value::Bool(false))
            .with("name", Value::Text("plain text with spaces".to_string()))
            .with("key", Value::Bytes(vec![0, 1, 255]));

        assert_eq!(roundtrip(&doc), doc);
    }

    #[test]
    fn test_awkward_text_roundtrip() {
        let doc = Document::new()
            .with("empty", Value::Text(String::new()))
            .with("bang", Value::Text("!looks like a tag".to_string()))
            .with("multi", Value::Text("line one\nline two".to_string()))
            .with("quoted", Value::Text("\"already\" \\ quoted".to_string()))
            .with("colony", Value::Text("path: /a/b?view=map".to_string()));

        assert_eq!(roundtrip(&doc), doc);
    }

    #[test]
    fn test_nested_roundtrip() {
        let inner = Document::new()
            .with("type", Value::Text("set-proxy".to_string()))
            .with("cid", Value::I64(7));
        let doc = Document::new()
            .with("reply", Value::Nested(inner))
            .with("after", Value::Bool(true));

        assert_eq!(roundtrip(&doc), doc);
    }

    #[test]
    fn test_empty_nested_roundtrip() {
        let doc = Document::new()
            .with("sub", Value::Nested(Document::new()))
            .with("tail", Value::I32(1));

        assert_eq!(roundtrip(&doc), doc);
    }

    #[test]
    fn test_marshalled_roundtrip() {
        let doc = Document::new().with(
            "blob",
            Value::Marshalled {
                class: "net.vitrine.Payload".to_string(),
                data: vec![0xde, 0xad],
            },
        );

        assert_eq!(roundtrip(&doc), doc);
    }

    #[test]
    fn test_readable_output() {
        let codec = TextCodec;
        let doc = Document::new()
            .with("get", Value::Null)
            .with("key", Value::Bytes(vec![0xab]));

        let mut out = Vec::new();
        codec.encode(&doc, &mut out).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "get: !null\nkey: !bytes ab\n");
    }

    #[test]
    fn test_bad_indent_rejected() {
        let codec = TextCodec;
        let result = codec.decode(b"   key: !i8 1\n");
        assert_eq!(result, Err(WireError::Fatal(ErrorType::Codec)));
    }

    #[test]
    fn test_bad_hex_rejected() {
        let codec = TextCodec;
        assert_eq!(
            codec.decode(b"key: !bytes 0g\n"),
            Err(WireError::Fatal(ErrorType::Codec))
        );
        assert_eq!(
            codec.decode(b"key: !bytes 012\n"),
            Err(WireError::Fatal(ErrorType::Codec))
        );
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let codec = TextCodec;
        assert_eq!(
            codec.decode(b"key: !f32 1.5\n"),
            Err(WireError::Fatal(ErrorType::Codec))
        );
    }
}
