//! Reader for the protobuf text format.
//!
//! Envoy renders `xds.route_metadata` with `DebugString()` on some builds,
//! which yields text such as
//!
//! ```text
//! filter_metadata {
//!   key: "envoy.filters.http.ext_proc"
//!   value { fields { key: "EnableBackendBasedAIRatelimit" value { string_value: "true" } } }
//! }
//! ```
//!
//! The output is a JSON tree shaped like the struct form of the same metadata:
//! map entries become objects keyed by `key`, `google.protobuf.Value` wrappers
//! collapse to their scalar and a `Struct` collapses to its `fields`.

use crate::error::TextFormatError;
use serde_json::{Map, Number, Value};

enum Node {
    Scalar(Value),
    Message(Vec<(String, Node)>),
}

pub fn to_json(text: &str) -> Result<Value, TextFormatError> {
    let mut parser = Parser { src: text, pos: 0 };
    let fields = parser.fields(None)?;
    Ok(message_to_json(fields))
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn skip_trivia(&mut self) {
        loop {
            let rest = &self.src[self.pos..];
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if !trimmed.starts_with('#') {
                return;
            }
            self.pos += trimmed.find('\n').unwrap_or(trimmed.len());
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_trivia();
        self.src[self.pos..].chars().next()
    }

    /// Next raw character, without skipping whitespace.
    fn bump(&mut self) -> Option<char> {
        let c = self.src[self.pos..].chars().next()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn unexpected(&mut self) -> TextFormatError {
        match self.peek() {
            Some(found) => TextFormatError::Unexpected {
                found,
                offset: self.pos,
            },
            None => TextFormatError::UnexpectedEnd,
        }
    }

    /// Fields up to `close`, or to the end of input at the top level.
    fn fields(&mut self, close: Option<char>) -> Result<Vec<(String, Node)>, TextFormatError> {
        let mut out = Vec::new();
        loop {
            match (self.peek(), close) {
                (None, None) => return Ok(out),
                (None, Some(_)) => return Err(TextFormatError::UnexpectedEnd),
                (Some(c), Some(end)) if c == end => {
                    self.bump();
                    return Ok(out);
                }
                _ => {}
            }

            let name = self.field_name()?;
            let has_colon = self.peek() == Some(':');
            if has_colon {
                self.bump();
            }
            if has_colon && self.peek() == Some('[') {
                self.bump();
                self.list(&name, &mut out)?;
            } else {
                let node = self.value(has_colon)?;
                out.push((name, node));
            }

            if matches!(self.peek(), Some(',' | ';')) {
                self.bump();
            }
        }
    }

    /// `name: [a, b]` is shorthand for repeating the field.
    fn list(&mut self, name: &str, out: &mut Vec<(String, Node)>) -> Result<(), TextFormatError> {
        loop {
            if self.peek() == Some(']') {
                self.bump();
                return Ok(());
            }
            out.push((name.to_string(), self.value(true)?));
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(']') => {}
                _ => return Err(self.unexpected()),
            }
        }
    }

    fn value(&mut self, allow_scalar: bool) -> Result<Node, TextFormatError> {
        match self.peek() {
            Some('{') => {
                self.bump();
                Ok(Node::Message(self.fields(Some('}'))?))
            }
            Some('<') => {
                self.bump();
                Ok(Node::Message(self.fields(Some('>'))?))
            }
            Some('"' | '\'') if allow_scalar => Ok(Node::Scalar(Value::String(self.string()?))),
            Some(_) if allow_scalar => Ok(Node::Scalar(self.bare()?)),
            _ => Err(self.unexpected()),
        }
    }

    fn field_name(&mut self) -> Result<String, TextFormatError> {
        if self.peek() == Some('[') {
            // Extension or Any type URL.
            let rest = &self.src[self.pos..];
            let end = rest.find(']').ok_or(TextFormatError::UnexpectedEnd)?;
            self.pos += end + 1;
            return Ok(rest[1..end].trim().to_string());
        }
        let word = self.word();
        if word.is_empty() {
            return Err(self.unexpected());
        }
        Ok(word.to_string())
    }

    fn word(&mut self) -> &'a str {
        self.skip_trivia();
        let rest: &'a str = &self.src[self.pos..];
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+')))
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn bare(&mut self) -> Result<Value, TextFormatError> {
        let word = self.word();
        if word.is_empty() {
            return Err(self.unexpected());
        }
        Ok(match word {
            "true" | "True" => Value::Bool(true),
            "false" | "False" => Value::Bool(false),
            _ => word
                .parse::<i64>()
                .map(Value::from)
                .ok()
                .or_else(|| word.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number))
                .unwrap_or_else(|| Value::String(word.to_string())),
        })
    }

    /// One or more adjacent quoted strings, concatenated.
    fn string(&mut self) -> Result<String, TextFormatError> {
        let mut bytes = Vec::new();
        while let Some(quote @ ('"' | '\'')) = self.peek() {
            let start = self.pos;
            self.bump();
            loop {
                match self.bump() {
                    None | Some('\n') => return Err(TextFormatError::UnterminatedString(start)),
                    Some(c) if c == quote => break,
                    Some('\\') => self.escape(&mut bytes, start)?,
                    Some(c) => push_char(&mut bytes, c),
                }
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn escape(&mut self, bytes: &mut Vec<u8>, start: usize) -> Result<(), TextFormatError> {
        let c = self.bump().ok_or(TextFormatError::UnterminatedString(start))?;
        let byte = match c {
            'n' => b'\n',
            't' => b'\t',
            'r' => b'\r',
            'a' => 0x07,
            'b' => 0x08,
            'f' => 0x0c,
            'v' => 0x0b,
            'x' => self.digits(16, 2),
            '0'..='7' => {
                self.pos -= 1;
                self.digits(8, 3)
            }
            other => {
                push_char(bytes, other);
                return Ok(());
            }
        };
        bytes.push(byte);
        Ok(())
    }

    fn digits(&mut self, radix: u32, max: usize) -> u8 {
        let rest = &self.src[self.pos..];
        let len = rest.chars().take(max).take_while(|c| c.is_digit(radix)).count();
        self.pos += len;
        u32::from_str_radix(&rest[..len], radix).map_or(0, |n| n as u8)
    }
}

fn push_char(bytes: &mut Vec<u8>, c: char) {
    let mut buf = [0; 4];
    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversion
// ─────────────────────────────────────────────────────────────────────────────

fn node_to_json(node: Node) -> Value {
    match node {
        Node::Scalar(value) => value,
        Node::Message(fields) => message_to_json(fields),
    }
}

fn message_to_json(fields: Vec<(String, Node)>) -> Value {
    let mut object = Map::new();
    for (name, node) in fields {
        let node = match node {
            Node::Message(entry) if is_map_entry(&entry) => {
                let (key, value) = map_entry(entry);
                if let Value::Object(map) = object
                    .entry(name)
                    .or_insert_with(|| Value::Object(Map::new()))
                {
                    map.insert(key, value);
                }
                continue;
            }
            other => other,
        };

        let value = node_to_json(node);
        match object.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                object.insert(name, value);
            }
        }
    }
    collapse_well_known(object)
}

fn is_map_entry(fields: &[(String, Node)]) -> bool {
    fields
        .iter()
        .any(|(name, node)| name == "key" && matches!(node, Node::Scalar(_)))
        && fields.iter().all(|(name, _)| name == "key" || name == "value")
}

fn map_entry(fields: Vec<(String, Node)>) -> (String, Value) {
    let mut key = String::new();
    let mut value = Value::Null;
    for (name, node) in fields {
        match (name.as_str(), node) {
            ("key", Node::Scalar(Value::String(s))) => key = s,
            ("key", Node::Scalar(other)) => key = other.to_string(),
            ("value", node) => value = node_to_json(node),
            _ => {}
        }
    }
    (key, value)
}

fn collapse_well_known(mut object: Map<String, Value>) -> Value {
    if object.len() != 1 {
        return Value::Object(object);
    }
    for name in ["string_value", "number_value", "bool_value", "struct_value", "fields"] {
        if let Some(inner) = object.remove(name) {
            return inner;
        }
    }
    if object.remove("null_value").is_some() {
        return Value::Null;
    }
    if let Some(list) = object.remove("list_value") {
        return match list {
            Value::Object(mut list) => match list.remove("values") {
                Some(Value::Array(items)) => Value::Array(items),
                Some(single) => Value::Array(vec![single]),
                None => Value::Array(Vec::new()),
            },
            other => other,
        };
    }
    Value::Object(object)
}
