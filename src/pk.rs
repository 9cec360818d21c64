//! EMV public keys, and the text format CA keys are distributed in.
//!
//! One CA key per line:
//!
//! ```text
//! a0:00:00:00:03 01 291231 rsa 03 b6:c8:...:db sha1 5d:29:...:c8
//! RID            IDX YYMMDD    EXP MODULUS        HASH
//! ```

use crate::crypto::{HashAlgo, Hasher, PkAlgo};
use crate::errors::{Error, Result};
use chrono::{Datelike, NaiveDate};
use nom::bytes::complete::{tag, take_while_m_n};
use nom::character::complete::{char, space1};
use nom::combinator::{all_consuming, map, map_res, verify};
use nom::multi::separated_list1;
use nom::sequence::{terminated, tuple};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

type StrResult<'a, T> = nom::IResult<&'a str, T>;

pub const MAX_EXPONENT_LEN: usize = 3;
pub const MAX_MODULUS_LEN: usize = 2048 / 8;

/// An RSA public key, either a CA root key or one recovered from a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmvPk {
    /// Registered Application Provider Identifier of the CA.
    pub rid: [u8; 5],
    /// CA Public Key Index.
    pub index: u8,
    pub serial: [u8; 3],
    /// Compressed numeric PAN (or PAN prefix), 0xFF-padded. Only set on recovered keys.
    pub pan: [u8; 10],
    pub hash_algo: u8,
    pub pk_algo: u8,
    /// Checksum over RID, index, modulus and exponent. Only set on CA keys.
    pub hash: [u8; 20],
    pub exp: Vec<u8>,
    pub modulus: Vec<u8>,
    /// Packed BCD YYMMDD.
    pub expire: u32,
}

impl EmvPk {
    /// An RSA/SHA-1 key with everything but the modulus and exponent zeroed.
    pub fn new(modulus: Vec<u8>, exp: Vec<u8>) -> Result<Self> {
        if exp.len() > MAX_EXPONENT_LEN {
            return Err(Error::ExponentTooLong(exp.len()));
        }
        Ok(Self {
            rid: [0; 5],
            index: 0,
            serial: [0; 3],
            pan: [0xFF; 10],
            hash_algo: HashAlgo::Sha1.into(),
            pk_algo: PkAlgo::Rsa.into(),
            hash: [0; 20],
            exp,
            modulus,
            expire: 0,
        })
    }

    /// Parses one key-store line.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        all_consuming(pk_line)(line)
            .map(|(_, pk)| pk)
            .map_err(|err| {
                Error::KeyStore(match err {
                    nom::Err::Error(e) | nom::Err::Failure(e) => {
                        format!("{:?} at column {}", e.code, line.len() - e.input.len() + 1)
                    }
                    nom::Err::Incomplete(_) => "incomplete line".into(),
                })
            })
    }

    /// True if the stored hash matches the key's RID, index, modulus and exponent.
    pub fn verify(&self) -> bool {
        let Ok(mut h) = Hasher::open(self.hash_algo) else {
            return false;
        };
        h.update(&self.rid);
        h.update(&[self.index]);
        h.update(&self.modulus);
        h.update(&self.exp);
        let size = h.output_size();
        h.finalize()[..] == self.hash[..size]
    }

    /// The last day the key is valid on. Day 31 (which recovered keys always carry)
    /// is read as the last day of the month.
    pub fn expiry_date(&self) -> Option<NaiveDate> {
        let year = bcd((self.expire >> 16) as u8)? as i32;
        let month = bcd((self.expire >> 8) as u8)?;
        let day = bcd(self.expire as u8)?;
        let year = if year < 50 { 2000 + year } else { 1900 + year };

        let first = NaiveDate::from_ymd_opt(year, month, 1)?;
        let last = match month {
            12 => NaiveDate::from_ymd_opt(year + 1, 1, 1),
            _ => NaiveDate::from_ymd_opt(year, month + 1, 1),
        }?
        .pred_opt()?;
        match day {
            0 => None,
            d if d >= last.day() => Some(last),
            d => first.with_day(d),
        }
    }

    /// True if `today` is past the expiry date, or the expiry date is invalid.
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry_date().map_or(true, |last| today > last)
    }
}

fn bcd(v: u8) -> Option<u32> {
    let (hi, lo) = (v >> 4, v & 0x0F);
    (hi <= 9 && lo <= 9).then(|| (hi * 10 + lo) as u32)
}

fn hex_byte(input: &str) -> StrResult<u8> {
    map_res(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |s: &str| u8::from_str_radix(s, 16),
    )(input)
}

/// Colon-separated hex bytes, eg. `a0:00:03`.
fn hex_bytes(input: &str) -> StrResult<Vec<u8>> {
    separated_list1(char(':'), hex_byte)(input)
}

fn hex_array<const N: usize>(input: &str) -> StrResult<[u8; N]> {
    map_res(hex_bytes, <[u8; N]>::try_from)(input)
}

fn bcd_byte(input: &str) -> StrResult<u8> {
    map(
        take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
        |s: &str| s.bytes().fold(0u8, |acc, c| acc << 4 | (c - b'0')),
    )(input)
}

/// YYMMDD, packed as BCD.
fn expiry(input: &str) -> StrResult<u32> {
    map(
        verify(
            tuple((bcd_byte, bcd_byte, bcd_byte)),
            |(_, m, d): &(u8, u8, u8)| *m <= 0x12 && *d <= 0x31,
        ),
        |(y, m, d)| (y as u32) << 16 | (m as u32) << 8 | d as u32,
    )(input)
}

fn pk_line(input: &str) -> StrResult<EmvPk> {
    let (input, rid) = terminated(hex_array::<5>, space1)(input)?;
    let (input, [index]) = terminated(hex_array::<1>, space1)(input)?;
    let (input, expire) = terminated(expiry, space1)(input)?;
    let (input, _) = terminated(tag("rsa"), space1)(input)?;
    let (input, exp) = terminated(
        verify(hex_bytes, |e: &[u8]| e.len() <= MAX_EXPONENT_LEN),
        space1,
    )(input)?;
    let (input, modulus) = terminated(
        verify(hex_bytes, |m: &[u8]| m.len() <= MAX_MODULUS_LEN),
        space1,
    )(input)?;
    let (input, _) = terminated(tag("sha1"), space1)(input)?;
    let (input, hash) = hex_array::<20>(input)?;
    Ok((
        input,
        EmvPk {
            rid,
            index,
            serial: [0; 3],
            pan: [0xFF; 10],
            hash_algo: HashAlgo::Sha1.into(),
            pk_algo: PkAlgo::Rsa.into(),
            hash,
            exp,
            modulus,
            expire,
        },
    ))
}

struct ColonHex<'a>(&'a [u8]);

impl fmt::Display for ColonHex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Writes the key in key-store line format.
impl fmt::Display for EmvPk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02x} {:06x} ",
            ColonHex(&self.rid),
            self.index,
            self.expire
        )?;
        match PkAlgo::try_from(self.pk_algo) {
            Ok(PkAlgo::Rsa) => f.write_str("rsa ")?,
            Err(_) => write!(f, "??{:02x} ", self.pk_algo)?,
        }
        write!(f, "{} {} ", ColonHex(&self.exp), ColonHex(&self.modulus))?;
        match HashAlgo::try_from(self.hash_algo) {
            Ok(HashAlgo::Sha1) => f.write_str("sha1 ")?,
            Err(_) => write!(f, "??{:02x} ", self.hash_algo)?,
        }
        write!(f, "{}", ColonHex(&self.hash))
    }
}

/// A set of trusted CA keys.
#[derive(Debug, Clone, Default)]
pub struct CaKeyStore {
    keys: Vec<EmvPk>,
}

impl CaKeyStore {
    /// Parses key-store text. Blank lines and `#` comments are ignored; lines that fail
    /// to parse are logged and skipped.
    pub fn parse(text: &str) -> Self {
        let mut keys = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match EmvPk::parse(line) {
                Ok(pk) => keys.push(pk),
                Err(err) => warn!(line = lineno + 1, %err, "Skipping CA key"),
            }
        }
        Self { keys }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn push(&mut self, pk: EmvPk) {
        self.keys.push(pk);
    }

    /// Looks up a CA key, skipping any whose checksum doesn't verify.
    pub fn get(&self, rid: &[u8; 5], index: u8) -> Result<&EmvPk> {
        for pk in self
            .keys
            .iter()
            .filter(|pk| pk.rid == *rid && pk.index == index)
        {
            if pk.verify() {
                debug!(
                    rid = %ColonHex(rid),
                    index,
                    bits = pk.modulus.len() * 8,
                    "Verified CA key"
                );
                return Ok(pk);
            }
            warn!(rid = %ColonHex(rid), index, "CA key checksum failed");
        }
        Err(Error::KeyNotFound { rid: *rid, index })
    }

    pub fn iter(&self) -> impl Iterator<Item = &EmvPk> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
