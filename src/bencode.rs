//! # Bencode Codec
//!
//! Decoder and canonical encoder for the bencoded dictionary format used by
//! metainfo files and tracker replies.
//!
//! ## Format
//!
//! - Integer: `i<digits>e`
//! - Byte string: `<length>:<bytes>`
//! - List: `l<values>e`
//! - Dictionary: `d<key><value>...e`, keys are byte strings in
//!   byte-lexicographic order
//!
//! The decoder is strict: leading zeros, `-0`, missing terminators, dangling
//! bytes after the top-level value and oversized string lengths are all
//! rejected. The encoder always emits canonical form (dictionary keys
//! sorted), so `encode(decode(x)) == x` holds for every well-formed input.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A decoded bencode value.
///
/// Dictionaries are kept in a `BTreeMap` so re-encoding naturally produces
/// the canonical key order the info digest depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Encode into canonical bencoded bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Int(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Value::Bytes(bytes) => {
                buf.extend_from_slice(bytes.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(bytes);
            }
            Value::List(items) => {
                buf.push(b'l');
                for item in items {
                    item.encode_into(buf);
                }
                buf.push(b'e');
            }
            Value::Dict(entries) => {
                buf.push(b'd');
                for (key, value) in entries {
                    buf.extend_from_slice(key.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(key);
                    value.encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }
}

/// Decode a complete bencoded value, rejecting trailing bytes.
pub fn decode(data: &[u8]) -> Result<Value> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.parse_value()?;
    if decoder.pos != data.len() {
        return Err(malformed(format!(
            "{} trailing bytes after value",
            data.len() - decoder.pos
        )));
    }
    Ok(value)
}

fn malformed(detail: String) -> Error {
    Error::Metainfo(format!("malformed bencode: {detail}"))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| malformed("unexpected end of input".into()))
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_bytes()?)),
            other => Err(malformed(format!(
                "invalid prefix byte {:#04x} at offset {}",
                other, self.pos
            ))),
        }
    }

    fn parse_int(&mut self) -> Result<Value> {
        self.pos += 1; // skip 'i'
        let end = self.find(b'e', "unterminated integer")?;
        let digits = &self.data[self.pos..end];

        let valid = match digits {
            [] => false,
            b"-0" => false,
            [b'0', _, ..] => false,
            [b'-', b'0', ..] | [b'-'] => false,
            _ => digits
                .iter()
                .enumerate()
                .all(|(i, b)| b.is_ascii_digit() || (i == 0 && *b == b'-')),
        };
        if !valid {
            return Err(malformed(format!("invalid integer {:?}", digits)));
        }

        let text = std::str::from_utf8(digits)
            .map_err(|_| malformed("non-ascii integer".into()))?;
        let n: i64 = text
            .parse()
            .map_err(|_| malformed(format!("integer out of range: {text}")))?;

        self.pos = end + 1;
        Ok(Value::Int(n))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let colon = self.find(b':', "missing ':' in string length")?;
        let digits = &self.data[self.pos..colon];

        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(malformed(format!("invalid string length {:?}", digits)));
        }
        if digits[0] == b'0' && digits.len() > 1 {
            return Err(malformed("leading zeros in string length".into()));
        }

        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| malformed("string length out of range".into()))?;

        let start = colon + 1;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| malformed("string length exceeds input".into()))?;

        self.pos = end;
        Ok(self.data[start..end].to_vec())
    }

    fn parse_list(&mut self) -> Result<Value> {
        self.pos += 1; // skip 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.pos += 1; // skip 'e'
        Ok(Value::List(items))
    }

    fn parse_dict(&mut self) -> Result<Value> {
        self.pos += 1; // skip 'd'
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            // keys must be byte strings
            if !self.peek()?.is_ascii_digit() {
                return Err(malformed("dictionary key is not a string".into()));
            }
            let key = self.parse_bytes()?;
            let value = self.parse_value()?;
            entries.insert(key, value);
        }
        self.pos += 1; // skip 'e'
        Ok(Value::Dict(entries))
    }

    fn find(&self, byte: u8, what: &str) -> Result<usize> {
        self.data[self.pos..]
            .iter()
            .position(|b| *b == byte)
            .map(|i| self.pos + i)
            .ok_or_else(|| malformed(what.into()))
    }
}
