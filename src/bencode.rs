//! # Bencoding Codec
//!
//! Decoder and encoder for the bencoding format used by torrent metadata
//! and tracker responses.
//!
//! ## Format
//!
//! Bencoding has four value kinds:
//!
//! - Integer: `i<digits>e` (e.g. `i42e`, `i-42e`)
//! - Byte string: `<length>:<bytes>` (e.g. `4:spam`)
//! - List: `l<values>e`
//! - Dictionary: `d<key><value>...e`, keys are byte strings
//!
//! ## Byte fidelity
//!
//! Every decoded value records the byte range it occupied in the source
//! buffer. The `info` dictionary of a torrent must be hashed exactly as it
//! appeared on disk: some torrents carry keys in non-canonical order, and a
//! re-encoded dictionary would produce a different digest than the one the
//! swarm expects. [`Value::raw`] returns the original slice for any
//! sub-value, so hashing never goes through a re-serialization round trip.
//!
//! Dictionaries keep their source key order in memory. [`encode`] emits keys
//! sorted by raw bytes regardless; [`encode_canonical`] refuses to reorder
//! and fails if the stored order is not already canonical.

use std::fmt;
use std::ops::Range;

use thiserror::Error;

/// What went wrong while decoding or encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid digit")]
    InvalidDigit,
    #[error("invalid leading zero")]
    InvalidLeadingZero,
    #[error("duplicate dictionary key")]
    DuplicateKey,
    #[error("dictionary keys out of canonical order")]
    KeysOutOfOrder,
    #[error("trailing bytes after value")]
    TrailingBytes,
}

/// A codec error together with the byte offset it was detected at.
///
/// For decoding the offset points into the source buffer; for encoding it
/// points into the output produced so far.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at byte {offset}")]
pub struct Error {
    pub kind: ErrorKind,
    pub offset: usize,
}

impl Error {
    fn new(kind: ErrorKind, offset: usize) -> Error {
        Error { kind, offset }
    }
}

/// A decoded bencoded value and the byte range it was decoded from.
#[derive(Debug, Clone)]
pub struct Value {
    pub kind: Kind,
    /// Range of this value in the buffer passed to [`decode`].
    /// Empty for values built in memory.
    pub span: Range<usize>,
}

/// The four bencoded value kinds.
///
/// Dictionary pairs are kept in source order; canonical ordering is applied
/// at encode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Vec<(Vec<u8>, Value)>),
}

impl PartialEq for Value {
    /// Structural equality: spans are ignored, dictionaries compare as
    /// ordered sequences of pairs.
    fn eq(&self, other: &Value) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Value {}

/// Constructors for building values in memory (empty spans).
#[allow(dead_code)]
impl Value {
    pub fn int(n: i64) -> Value {
        Value { kind: Kind::Int(n), span: 0..0 }
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value { kind: Kind::Bytes(b.into()), span: 0..0 }
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value { kind: Kind::List(items), span: 0..0 }
    }

    pub fn dict(pairs: Vec<(Vec<u8>, Value)>) -> Value {
        Value { kind: Kind::Dict(pairs), span: 0..0 }
    }
}

impl Value {
    /// The exact bytes this value was decoded from.
    ///
    /// `input` must be the buffer this value came out of.
    pub fn raw<'a>(&self, input: &'a [u8]) -> &'a [u8] {
        &input[self.span.clone()]
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.kind {
            Kind::Int(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.kind {
            Kind::Bytes(ref b) => Some(b),
            _ => None,
        }
    }

    /// Byte string interpreted as UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self.kind {
            Kind::Bytes(ref b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self.kind {
            Kind::List(ref l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, Value)]> {
        match self.kind {
            Kind::Dict(ref d) => Some(d),
            _ => None,
        }
    }

    /// Look up a dictionary entry by raw key bytes.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Int(n) => write!(f, "{}", n),
            Kind::Bytes(ref b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{:?}", s),
                Err(_) => write!(f, "<{} bytes>", b.len()),
            },
            Kind::List(ref l) => write!(f, "<list of {}>", l.len()),
            Kind::Dict(ref d) => write!(f, "<dict of {}>", d.len()),
        }
    }
}

/// Decode a complete bencoded value from `data`.
///
/// The whole input must be consumed; trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<Value, Error> {
    let mut parser = Parser { data, pos: 0 };
    let value = parser.value()?;
    if parser.pos != data.len() {
        return Err(Error::new(ErrorKind::TrailingBytes, parser.pos));
    }
    Ok(value)
}

/// Encode `value`, emitting dictionary keys in ascending byte-lexicographic
/// order regardless of their stored order.
#[allow(dead_code)]
pub fn encode(value: &Value) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    write_value(value, &mut out, true)?;
    Ok(out)
}

/// Encode `value` without reordering dictionary keys.
///
/// Fails with `KeysOutOfOrder` if any dictionary's stored order is not
/// already ascending. Callers that must reproduce source bytes exactly use
/// this to detect values that cannot be re-emitted faithfully.
pub fn encode_canonical(value: &Value) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    write_value(value, &mut out, false)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut Vec<u8>, sort: bool) -> Result<(), Error> {
    match value.kind {
        Kind::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Kind::Bytes(ref b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Kind::List(ref items) => {
            out.push(b'l');
            for item in items {
                write_value(item, out, sort)?;
            }
            out.push(b'e');
        }
        Kind::Dict(ref pairs) => {
            out.push(b'd');
            let mut ordered: Vec<&(Vec<u8>, Value)> = pairs.iter().collect();
            if sort {
                ordered.sort_by(|a, b| a.0.cmp(&b.0));
            }
            let mut prev: Option<&[u8]> = None;
            for (key, val) in ordered {
                match prev {
                    Some(p) if p == key.as_slice() => {
                        return Err(Error::new(ErrorKind::DuplicateKey, out.len()));
                    }
                    Some(p) if p > key.as_slice() => {
                        return Err(Error::new(ErrorKind::KeysOutOfOrder, out.len()));
                    }
                    _ => {}
                }
                prev = Some(key.as_slice());
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                write_value(val, out, sort)?;
            }
            out.push(b'e');
        }
    }
    Ok(())
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, kind: ErrorKind) -> Error {
        Error::new(kind, self.pos)
    }

    fn peek(&self) -> Result<u8, Error> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.err(ErrorKind::UnexpectedEof))
    }

    fn value(&mut self) -> Result<Value, Error> {
        let start = self.pos;
        let kind = match self.peek()? {
            b'i' => {
                self.pos += 1;
                Kind::Int(self.integer()?)
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value()?);
                }
                self.pos += 1;
                Kind::List(items)
            }
            b'd' => {
                self.pos += 1;
                let mut pairs: Vec<(Vec<u8>, Value)> = Vec::new();
                while self.peek()? != b'e' {
                    let key_offset = self.pos;
                    let key = self.byte_string()?;
                    if pairs.iter().any(|(k, _)| *k == key) {
                        return Err(Error::new(ErrorKind::DuplicateKey, key_offset));
                    }
                    let val = self.value()?;
                    pairs.push((key, val));
                }
                self.pos += 1;
                Kind::Dict(pairs)
            }
            b'0'..=b'9' => Kind::Bytes(self.byte_string()?),
            _ => return Err(self.err(ErrorKind::InvalidDigit)),
        };
        Ok(Value { kind, span: start..self.pos })
    }

    /// Digits of an integer body, already past the `i`, consuming the `e`.
    fn integer(&mut self) -> Result<i64, Error> {
        let negative = if self.peek()? == b'-' {
            self.pos += 1;
            true
        } else {
            false
        };
        let digits_start = self.pos;
        let mut n: i64 = 0;
        while let Some(&b) = self.data.get(self.pos) {
            if b == b'e' {
                break;
            }
            if !b.is_ascii_digit() {
                return Err(self.err(ErrorKind::InvalidDigit));
            }
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add(i64::from(b - b'0')))
                .ok_or_else(|| self.err(ErrorKind::InvalidDigit))?;
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(self.err(ErrorKind::InvalidDigit));
        }
        if self.data[digits_start] == b'0' && (negative || self.pos - digits_start > 1) {
            // Covers i-0e, i03e and i-03e.
            return Err(Error::new(ErrorKind::InvalidLeadingZero, digits_start));
        }
        if self.peek()? != b'e' {
            return Err(self.err(ErrorKind::InvalidDigit));
        }
        self.pos += 1;
        Ok(if negative { -n } else { n })
    }

    /// A length-prefixed byte string starting at the current position.
    fn byte_string(&mut self) -> Result<Vec<u8>, Error> {
        let digits_start = self.pos;
        let mut len: usize = 0;
        while let Some(&b) = self.data.get(self.pos) {
            if b == b':' {
                break;
            }
            if !b.is_ascii_digit() {
                return Err(self.err(ErrorKind::InvalidDigit));
            }
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add(usize::from(b - b'0')))
                .ok_or_else(|| self.err(ErrorKind::InvalidDigit))?;
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(self.err(ErrorKind::InvalidDigit));
        }
        if self.data[digits_start] == b'0' && self.pos - digits_start > 1 {
            return Err(Error::new(ErrorKind::InvalidLeadingZero, digits_start));
        }
        if self.peek()? != b':' {
            return Err(self.err(ErrorKind::UnexpectedEof));
        }
        self.pos += 1;
        if self.pos + len > self.data.len() {
            return Err(self.err(ErrorKind::UnexpectedEof));
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(err: Error) -> ErrorKind {
        err.kind
    }

    #[test]
    fn round_trip_dict() {
        let input = b"d3:cow3:moo4:spaml1:a1:bee";
        let value = decode(input).unwrap();
        let expected = Value::dict(vec![
            (b"cow".to_vec(), Value::bytes(&b"moo"[..])),
            (
                b"spam".to_vec(),
                Value::list(vec![Value::bytes(&b"a"[..]), Value::bytes(&b"b"[..])]),
            ),
        ]);
        assert_eq!(value, expected);
        assert_eq!(encode(&value).unwrap(), input.to_vec());
        assert_eq!(decode(&encode(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn integer_edge_cases() {
        assert_eq!(decode(b"i0e").unwrap().as_int(), Some(0));
        assert_eq!(decode(b"i-42e").unwrap().as_int(), Some(-42));
        assert_eq!(
            kind_of(decode(b"i-0e").unwrap_err()),
            ErrorKind::InvalidLeadingZero
        );
        assert_eq!(
            kind_of(decode(b"i03e").unwrap_err()),
            ErrorKind::InvalidLeadingZero
        );
        assert_eq!(kind_of(decode(b"ie").unwrap_err()), ErrorKind::InvalidDigit);
        assert_eq!(kind_of(decode(b"i42").unwrap_err()), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn strings_and_eof() {
        assert_eq!(decode(b"0:").unwrap().as_bytes(), Some(&b""[..]));
        assert_eq!(decode(b"4:spam").unwrap().as_bytes(), Some(&b"spam"[..]));
        assert_eq!(
            kind_of(decode(b"4:spa").unwrap_err()),
            ErrorKind::UnexpectedEof
        );
        assert_eq!(
            kind_of(decode(b"03:foo").unwrap_err()),
            ErrorKind::InvalidLeadingZero
        );
        assert_eq!(
            kind_of(decode(b"le extra").unwrap_err()),
            ErrorKind::TrailingBytes
        );
    }

    #[test]
    fn duplicate_keys_rejected() {
        let err = decode(b"d1:ai1e1:ai2ee").unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateKey);
    }

    #[test]
    fn unsorted_input_sorted_output() {
        // Keys arrive as b, a; decode preserves that order.
        let input = b"d1:bi2e1:ai1ee";
        let value = decode(input).unwrap();
        let keys: Vec<&[u8]> = value
            .as_dict()
            .unwrap()
            .iter()
            .map(|(k, _)| k.as_slice())
            .collect();
        assert_eq!(keys, vec![&b"b"[..], &b"a"[..]]);

        // encode emits canonically, encode_canonical refuses.
        assert_eq!(encode(&value).unwrap(), b"d1:ai1e1:bi2ee".to_vec());
        assert_eq!(
            encode_canonical(&value).unwrap_err().kind,
            ErrorKind::KeysOutOfOrder
        );
        // A canonically ordered value passes both and matches its source.
        let canonical = decode(b"d1:ai1e1:bi2ee").unwrap();
        assert_eq!(encode_canonical(&canonical).unwrap(), b"d1:ai1e1:bi2ee".to_vec());
    }

    #[test]
    fn sub_value_spans_track_source_bytes() {
        // The nested dict is non-canonical; its raw slice must still be
        // recoverable byte-for-byte.
        let input = b"d4:infod1:bi2e1:ai1ee3:numi7ee";
        let value = decode(input).unwrap();
        let info = value.get(b"info").unwrap();
        assert_eq!(info.raw(input), &b"d1:bi2e1:ai1ee"[..]);
        let num = value.get(b"num").unwrap();
        assert_eq!(num.raw(input), &b"i7e"[..]);
        assert_eq!(num.as_int(), Some(7));
    }

    #[test]
    fn error_offsets_point_at_source() {
        let err = decode(b"d3:cow").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnexpectedEof);
        assert_eq!(err.offset, 6);
        let err = decode(b"i03e").unwrap_err();
        assert_eq!(err.offset, 1);
    }
}
