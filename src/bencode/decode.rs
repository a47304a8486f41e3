use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes a bencode value from a byte slice.
///
/// The input must contain exactly one complete bencode value with no
/// trailing data.
///
/// # Errors
///
/// Returns an error if the input is empty or truncated, contains invalid
/// bencode syntax, nests deeper than 64 levels, or has data after the value.
///
/// # Examples
///
/// ```
/// use spate::bencode::decode;
///
/// let dict = decode(b"d4:porti6881ee").unwrap();
/// assert_eq!(dict.get(b"port").and_then(|v| v.as_integer()), Some(6881));
/// ```
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut dec = Decoder::new(data);
    let value = dec.value(0)?;

    if dec.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(value)
}

/// Returns the exact byte sub-slice of the `info` value within a bencoded
/// torrent, as it appeared in the input.
///
/// The info hash is defined over these verbatim bytes. Re-encoding a decoded
/// dictionary can renormalize content and produce a different hash, so the
/// slice is located by walking the outer dictionary without building values.
///
/// Returns `None` if the input is not a dictionary, is malformed, or has no
/// `info` key.
pub fn info_slice(data: &[u8]) -> Option<&[u8]> {
    let mut dec = Decoder::new(data);

    if dec.next()? != b'd' {
        return None;
    }
    dec.pos += 1;

    while dec.next()? != b'e' {
        let key = dec.raw_bytes().ok()?;
        let start = dec.pos;
        dec.skip(0).ok()?;
        if key == b"info" {
            return Some(&data[start..dec.pos]);
        }
    }

    None
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn next(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.next().ok_or(BencodeError::UnexpectedEof)? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(Bytes::copy_from_slice(self.raw_bytes()?))),
            c => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    /// Advances past one value without building it.
    fn skip(&mut self, depth: usize) -> Result<(), BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.next().ok_or(BencodeError::UnexpectedEof)? {
            b'i' => {
                self.integer()?;
            }
            b'0'..=b'9' => {
                self.raw_bytes()?;
            }
            b'l' => {
                self.pos += 1;
                while self.next().ok_or(BencodeError::UnexpectedEof)? != b'e' {
                    self.skip(depth + 1)?;
                }
                self.pos += 1;
            }
            b'd' => {
                self.pos += 1;
                while self.next().ok_or(BencodeError::UnexpectedEof)? != b'e' {
                    self.raw_bytes()?;
                    self.skip(depth + 1)?;
                }
                self.pos += 1;
            }
            c => return Err(BencodeError::UnexpectedChar(c as char)),
        }
        Ok(())
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;

        let start = self.pos;
        while self.next().ok_or(BencodeError::UnexpectedEof)? != b'e' {
            self.pos += 1;
        }

        let digits = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| BencodeError::InvalidInteger("invalid utf8".into()))?;

        if digits.is_empty() {
            return Err(BencodeError::InvalidInteger("empty".into()));
        }

        if digits.starts_with("-0") || (digits.starts_with('0') && digits.len() > 1) {
            return Err(BencodeError::InvalidInteger("leading zeros".into()));
        }

        let value: i64 = digits
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(digits.into()))?;

        self.pos += 1;
        Ok(Value::Integer(value))
    }

    /// Parses a length-prefixed byte string and returns the borrowed payload.
    fn raw_bytes(&mut self) -> Result<&'a [u8], BencodeError> {
        let start = self.pos;
        while self.next().ok_or(BencodeError::UnexpectedEof)? != b':' {
            self.pos += 1;
        }

        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;

        self.pos += 1;

        if self.pos + len > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }

        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut list = Vec::new();

        while self.next().ok_or(BencodeError::UnexpectedEof)? != b'e' {
            list.push(self.value(depth + 1)?);
        }

        self.pos += 1;
        Ok(Value::List(list))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut dict = BTreeMap::new();

        while self.next().ok_or(BencodeError::UnexpectedEof)? != b'e' {
            let key = Bytes::copy_from_slice(self.raw_bytes()?);
            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }

        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}
