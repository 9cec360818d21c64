//! BER-TLV codec, restricted to what EMV cards actually send.
//!
//! Tags are at most two bytes (the second byte is read when the low five bits of the
//! first are all set), and lengths are either short form (0x00-0x7F) or the single-byte
//! long form (0x81 xx). Longer length forms are rejected rather than misparsed, so the
//! largest value this codec handles, in either direction, is 255 bytes.

use crate::errors::{Error, Result};
use nom::bytes::complete::take;
use nom::number::complete::be_u8;
use nom::sequence::pair;

pub type IResult<'a, T> = nom::IResult<&'a [u8], T, Error>;

/// A BER tag, with a two-byte tag stored big-endian (eg. 0x9F46).
pub type Tag = u16;

const TAG_VALUE_CONT: u8 = 0x1F;
const TAG_CONSTRUCTED: u8 = 0x20;
const LEN_LONG_1: u8 = 0x81;

impl nom::error::ParseError<&[u8]> for Error {
    fn from_error_kind(_input: &[u8], kind: nom::error::ErrorKind) -> Self {
        match kind {
            nom::error::ErrorKind::Eof => Error::Truncated,
            kind => Error::Nom(kind),
        }
    }

    fn append(_input: &[u8], _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

impl From<nom::Err<Error>> for Error {
    fn from(e: nom::Err<Error>) -> Self {
        match e {
            nom::Err::Error(err) => err,
            nom::Err::Failure(err) => err,
            nom::Err::Incomplete(_) => Error::Truncated,
        }
    }
}

/// Parses a TLV tag. If the lower 5 bits of the first byte are all set, one more byte follows.
pub fn parse_tag(input: &[u8]) -> IResult<Tag> {
    let (input, first) = be_u8(input)?;
    if first & TAG_VALUE_CONT != TAG_VALUE_CONT {
        return Ok((input, first as Tag));
    }
    let (input, second) = be_u8(input)?;
    Ok((input, (first as Tag) << 8 | second as Tag))
}

/// Parses a TLV value's length. If bit 8 of the first byte is 0, bits 1-7 are the length.
/// Otherwise only 0x81 (one subsequent length byte) is accepted.
pub fn parse_len(input: &[u8]) -> IResult<usize> {
    let (input, first) = be_u8(input)?;
    match first {
        0x00..=0x7F => Ok((input, first as usize)),
        LEN_LONG_1 => be_u8(input).map(|(i, v)| (i, v as usize)),
        _ => Err(nom::Err::Failure(Error::UnsupportedLength(first))),
    }
}

/// Parses a tag and length header, leaving the input positioned at the value.
pub fn parse_tl(input: &[u8]) -> IResult<(Tag, usize)> {
    pair(parse_tag, parse_len)(input)
}

/// Parses a complete tag-value pair.
pub fn parse_next(input: &[u8]) -> IResult<Tlv> {
    let (input, (tag, len)) = parse_tl(input)?;
    let (input, value) = take(len)(input)?;
    Ok((input, Tlv { tag, value }))
}

/// True if the tag's first byte has the "constructed" bit set.
pub fn is_constructed(tag: Tag) -> bool {
    let first = if tag > 0xFF { (tag >> 8) as u8 } else { tag as u8 };
    first & TAG_CONSTRUCTED == TAG_CONSTRUCTED
}

/// A borrowed tag-value pair.
///
/// Equality compares tag and value bytes, so `Option<Tlv>` comparisons treat two
/// missing elements as equal and a missing one as different from any present one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: Tag,
    pub value: &'a [u8],
}

impl<'a> Tlv<'a> {
    pub fn new(tag: Tag, value: &'a [u8]) -> Self {
        Self { tag, value }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn is_constructed(&self) -> bool {
        is_constructed(self.tag)
    }

    /// Encodes the tag, length and value in minimal form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = self.value.len();
        if len > 0xFF {
            return Err(Error::ValueTooLong(len));
        }

        let mut out = Vec::with_capacity(len + 4);
        if self.tag > 0xFF {
            out.extend_from_slice(&self.tag.to_be_bytes());
        } else {
            out.push(self.tag as u8);
        }
        if len > 0x7F {
            out.push(LEN_LONG_1);
        }
        out.push(len as u8);
        out.extend_from_slice(self.value);
        Ok(out)
    }

    /// Reads a one-byte value. An empty value reads as 0.
    pub fn get_u8(&self) -> Option<u8> {
        match self.value {
            [] => Some(0),
            [v] => Some(*v),
            _ => None,
        }
    }

    /// Reads a value of up to 4 bytes as a little-endian integer. An empty value reads as 0.
    pub fn get_int(&self) -> Option<u32> {
        if self.value.len() > 4 {
            return None;
        }
        Some(
            self.value
                .iter()
                .enumerate()
                .fold(0, |acc, (i, v)| acc | (*v as u32) << (i * 8)),
        )
    }
}

/// Iterates over consecutive TLVs in a buffer, without descending into constructed ones.
pub struct TLVIterator<'a> {
    pub input: &'a [u8],
}

pub fn iter(input: &[u8]) -> TLVIterator<'_> {
    TLVIterator::new(input)
}

impl<'a> TLVIterator<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }
}

impl<'a> Iterator for TLVIterator<'a> {
    type Item = Result<Tlv<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.input.is_empty() {
            return None;
        }
        match parse_next(self.input) {
            Ok((i, v)) => {
                self.input = i;
                Some(Ok(v))
            }
            Err(e) => {
                self.input = &[];
                Some(Err(e.into()))
            }
        }
    }
}
