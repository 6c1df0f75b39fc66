//! Order-preserving tuple encoding for archive keys.
//!
//! Every key in the archive is a packed tuple of integers, strings, and raw
//! byte segments. The byte order of packed keys equals the element-wise order
//! of the source tuples, so prefix scans over the store walk tuples in their
//! natural order. Elements are type-tagged and self-delimiting: packing a
//! tuple yields a proper prefix of any extension of that tuple.

use std::fmt;

use crate::error::{ArchiveError, Result};

const TAG_INT: u8 = 0x01;
const TAG_STR: u8 = 0x02;
const TAG_BYTES: u8 = 0x03;

const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0xFF;

/// A single tuple element. Variant order matches tag order, so the derived
/// `Ord` agrees with the packed byte order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Element {
    Int(u64),
    Str(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tuple(pub Vec<Element>);

impl Tuple {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for element in &self.0 {
            element.encode(&mut out);
        }
        out
    }

    pub fn unpack(bytes: &[u8]) -> Result<Tuple> {
        let mut elements = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            let (element, consumed) = Element::decode(rest)?;
            elements.push(element);
            rest = &rest[consumed..];
        }
        Ok(Tuple(elements))
    }

    pub fn elements(&self) -> &[Element] {
        &self.0
    }
}

impl Element {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Element::Int(value) => {
                out.push(TAG_INT);
                out.extend_from_slice(&value.to_be_bytes());
            }
            Element::Str(value) => {
                out.push(TAG_STR);
                escape_into(value.as_bytes(), out);
            }
            Element::Bytes(value) => {
                out.push(TAG_BYTES);
                escape_into(value, out);
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<(Element, usize)> {
        match bytes[0] {
            TAG_INT => {
                if bytes.len() < 9 {
                    return Err(ArchiveError::MalformedKey(
                        "truncated integer element".into(),
                    ));
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[1..9]);
                Ok((Element::Int(u64::from_be_bytes(raw)), 9))
            }
            TAG_STR => {
                let (raw, consumed) = unescape(&bytes[1..])?;
                let value = String::from_utf8(raw).map_err(|err| {
                    ArchiveError::MalformedKey(format!("invalid utf-8 in string element: {err}"))
                })?;
                Ok((Element::Str(value), consumed + 1))
            }
            TAG_BYTES => {
                let (raw, consumed) = unescape(&bytes[1..])?;
                Ok((Element::Bytes(raw), consumed + 1))
            }
            tag => Err(ArchiveError::MalformedKey(format!(
                "unknown element tag {tag:#04x}"
            ))),
        }
    }
}

/// Appends `data` with embedded NULs escaped as `0x00 0xFF`, then the bare
/// NUL terminator. The escape byte is maximal, so an embedded NUL still sorts
/// below every other continuation while staying distinguishable from the
/// terminator.
fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &byte in data {
        out.push(byte);
        if byte == TERMINATOR {
            out.push(ESCAPE);
        }
    }
    out.push(TERMINATOR);
}

fn unescape(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        if byte == TERMINATOR {
            if data.get(i + 1) == Some(&ESCAPE) {
                out.push(TERMINATOR);
                i += 2;
                continue;
            }
            return Ok((out, i + 1));
        }
        out.push(byte);
        i += 1;
    }
    Err(ArchiveError::MalformedKey("unterminated element".into()))
}

impl From<u64> for Element {
    fn from(value: u64) -> Self {
        Element::Int(value)
    }
}

impl From<&str> for Element {
    fn from(value: &str) -> Self {
        Element::Str(value.to_string())
    }
}

impl From<String> for Element {
    fn from(value: String) -> Self {
        Element::Str(value)
    }
}

impl From<Vec<u8>> for Element {
    fn from(value: Vec<u8>) -> Self {
        Element::Bytes(value)
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Int(value) => write!(f, "{value}"),
            Element::Str(value) => write!(f, "{value:?}"),
            Element::Bytes(value) => {
                write!(f, "0x")?;
                for byte in value {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{element}")?;
        }
        write!(f, ")")
    }
}
