//! Property-table encoding with the fixed token dictionary.
//!
//! A property table is a sequence of (name, value) string pairs, each string
//! terminated by a zero byte. Fourteen well-known strings are abbreviated to
//! a single byte holding their 1-based index into [`TOKEN_DICTIONARY`]; a
//! received one-byte string in that range is expanded back. Lookup scans the
//! raw table, so received properties are never re-allocated.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{BlipError, Result};

/// Names and values encoded as a single byte on the wire, 1-indexed.
///
/// Frozen for protocol compatibility: reordering, removing, or inserting
/// entries breaks interoperability with deployed peers.
pub const TOKEN_DICTIONARY: [&str; 14] = [
    "Profile",
    "Error-Code",
    "Error-Domain",
    "Content-Type",
    "application/json",
    "application/octet-stream",
    "text/plain; charset=UTF-8",
    "text/xml",
    "Accept",
    "Cache-Control",
    "must-revalidate",
    "If-Match",
    "If-None-Match",
    "Location",
];

/// Token for `s`, if it is one of the dictionary entries.
fn tokenize(s: &[u8]) -> Option<u8> {
    TOKEN_DICTIONARY
        .iter()
        .position(|entry| entry.as_bytes() == s)
        .and_then(|index| u8::try_from(index + 1).ok())
}

/// Dictionary entry for a received one-byte string, if it is a token.
fn expand(s: &[u8]) -> Option<&'static [u8]> {
    match s {
        [byte @ 1..=14] => Some(TOKEN_DICTIONARY[usize::from(*byte) - 1].as_bytes()),
        _ => None,
    }
}

/// A received string, with tokens expanded.
fn expanded(s: &[u8]) -> &[u8] {
    expand(s).unwrap_or(s)
}

/// Append one property string (tokenized when possible) plus its terminator.
///
/// # Errors
///
/// Returns [`BlipError::InvalidProperty`] if `s` contains a zero byte or
/// starts with a control byte: such strings would be indistinguishable from
/// tokens or terminators on the wire.
pub(crate) fn encode_string(s: &[u8], dst: &mut BytesMut) -> Result<()> {
    if s.contains(&0) || s.first().is_some_and(|first| *first < 32) {
        return Err(BlipError::InvalidProperty);
    }
    match tokenize(s) {
        Some(token) => dst.put_u8(token),
        None => dst.put_slice(s),
    }
    dst.put_u8(0);
    Ok(())
}

/// Decode a complete property table into expanded (name, value) pairs.
///
/// # Errors
///
/// Returns [`BlipError::MalformedProperties`] if the buffer does not end on
/// a terminator boundary, holds an odd number of strings, or contains a
/// string that is not valid UTF-8 after token expansion.
pub fn decode(table: &[u8]) -> Result<Vec<(String, String)>> {
    if !table.is_empty() && table.last() != Some(&0) {
        return Err(BlipError::MalformedProperties);
    }
    let mut pairs = Vec::new();
    let mut iter = PropertyIter { rest: table };
    loop {
        let Some(name) = iter.next_string() else { break };
        let value = iter.next_string().ok_or(BlipError::MalformedProperties)?;
        let name = std::str::from_utf8(name).map_err(|_| BlipError::MalformedProperties)?;
        let value = std::str::from_utf8(value).map_err(|_| BlipError::MalformedProperties)?;
        pairs.push((name.to_owned(), value.to_owned()));
    }
    Ok(pairs)
}

/// Encode (name, value) pairs into a property table.
///
/// This is the inverse of [`decode`] and is mostly useful for tests and
/// tooling; message assembly goes through
/// [`MessageBuilder`](crate::builder::MessageBuilder).
pub fn encode<'a, I>(pairs: I) -> Result<Bytes>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = BytesMut::new();
    for (name, value) in pairs {
        encode_string(name.as_bytes(), &mut out)?;
        encode_string(value.as_bytes(), &mut out)?;
    }
    Ok(out.freeze())
}

/// The raw (still tokenized) property table of a received message.
///
/// Lookups scan the buffer and expand tokens on the fly; the common case of
/// a handful of short properties does not justify building a map.
#[derive(Clone, Debug, Default)]
pub struct Properties {
    raw: Bytes,
}

impl Properties {
    /// Wrap a raw table. The caller has checked the trailing terminator.
    pub(crate) fn from_raw(raw: Bytes) -> Self {
        Self { raw }
    }

    /// Whether the table holds no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The raw table bytes, tokens included.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Iterate over expanded (name, value) byte pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        PropertyPairs {
            inner: PropertyIter { rest: &self.raw },
        }
    }

    /// Value of the property named `name`, if present and valid UTF-8.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(key, _)| *key == name.as_bytes())
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
    }

    /// Value of `name` parsed as a signed decimal integer.
    ///
    /// Returns `default` when the property is missing or its value is not a
    /// well-formed integer.
    #[must_use]
    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        self.get(name)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }
}

/// Walks NUL-terminated strings in a raw table.
struct PropertyIter<'a> {
    rest: &'a [u8],
}

impl<'a> PropertyIter<'a> {
    /// The next expanded string, or `None` at the end of the buffer or on a
    /// missing terminator.
    fn next_string(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() {
            return None;
        }
        let end = self.rest.iter().position(|byte| *byte == 0)?;
        let (string, rest) = self.rest.split_at(end);
        self.rest = &rest[1..];
        Some(expanded(string))
    }
}

/// Pairs up the strings of a table, ignoring a trailing odd string.
struct PropertyPairs<'a> {
    inner: PropertyIter<'a>,
}

impl<'a> Iterator for PropertyPairs<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.inner.next_string()?;
        let value = self.inner.next_string()?;
        Some((name, value))
    }
}
