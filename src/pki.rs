//! Offline data authentication: recovering issuer and ICC keys from their certificates,
//! and checking static and dynamic signatures with them.
//!
//! Every certificate is one RSA block, which the enclosing key "decrypts" into an
//! ISO/IEC 9796-2 message:
//!
//! ```text
//! 6A | type | ... data ... | hash | BC
//! ```
//!
//! The hash covers everything between the header and the hash itself, followed by
//! data the card sends outside the certificate (exponents, modulus remainders, signed
//! records, terminal data), so none of that can be altered either.

pub mod cert;
pub mod sign;

use crate::ber::{self, Tag};
use crate::crypto::{self, Hasher, PkAlgo};
use crate::errors::{Error, Result};
use crate::pk::EmvPk;
use crate::tlvdb::TlvDb;
use cert::{CertKind, KeyLayout};
use tap::TapFallible;
use tracing::{debug, trace_span, warn};
use zeroize::Zeroizing;

const HEADER: u8 = 0x6A;
const TRAILER: u8 = 0xBC;

pub const TAG_PAN: Tag = 0x5A;
pub const TAG_SSAD: Tag = 0x93;
pub const TAG_SDA_TAG_LIST: Tag = 0x9F4A;
pub const TAG_SDAD: Tag = 0x9F4B;
pub const TAG_DAC: Tag = 0x9F45;
pub const TAG_IDN: Tag = 0x9F4C;
pub const TAG_ATC: Tag = 0x9F36;
pub const TAG_CID: Tag = 0x9F27;
pub const TAG_UN: Tag = 0x9F37;

/// Terminal data signed by an fDDA signature, in order.
pub const FDDA_TAGS: [Tag; 4] = [0x9F37, 0x9F02, 0x5F2A, 0x9F69];

/// How to treat a hash that doesn't match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationPolicy {
    /// Fail on mismatched hashes. When unset, recovery carries on and reports the
    /// result as unauthenticated instead; this is for looking at broken or test cards,
    /// and must never be used to accept a card.
    pub strict: bool,
}

impl VerificationPolicy {
    pub const STRICT: Self = Self { strict: true };
    pub const LENIENT: Self = Self { strict: false };
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self::STRICT
    }
}

/// Whether a recovered value was actually authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    Authentic,
    /// The certificate's hash didn't match its contents.
    HashMismatch {
        recovered: Vec<u8>,
        computed: Vec<u8>,
    },
    /// A CDA signature's Transaction Data Hash Code didn't match the transaction.
    TransactionHashMismatch {
        recovered: Vec<u8>,
        computed: Vec<u8>,
    },
}

/// A value recovered from a certificate, with the outcome of its hash check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered<T> {
    pub value: T,
    pub integrity: Integrity,
}

impl<T> Recovered<T> {
    pub fn authentic(value: T) -> Self {
        Self {
            value,
            integrity: Integrity::Authentic,
        }
    }

    pub fn is_authentic(&self) -> bool {
        self.integrity == Integrity::Authentic
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Recovered<U> {
        Recovered {
            value: f(self.value),
            integrity: self.integrity,
        }
    }

    /// The value, if it was authenticated.
    pub fn into_authentic(self) -> Result<T> {
        match self.integrity {
            Integrity::Authentic => Ok(self.value),
            Integrity::HashMismatch { .. } => Err(Error::HashMismatch),
            Integrity::TransactionHashMismatch { .. } => Err(Error::TransactionHashMismatch),
        }
    }
}

/// Recovers the message in `cert`, checks its envelope and hash, and returns it without
/// the hash and trailer. `aux` is hashed after the message, in order.
pub fn decode_message(
    key: &EmvPk,
    kind: CertKind,
    cert: &[u8],
    aux: &[&[u8]],
    policy: VerificationPolicy,
) -> Result<Recovered<Zeroizing<Vec<u8>>>> {
    if cert.len() != key.modulus.len() {
        return Err(Error::CertificateLength {
            cert: cert.len(),
            key: key.modulus.len(),
        });
    }
    PkAlgo::from_id(key.pk_algo)?;

    let mut msg = crypto::rsa_public(cert, &key.exp, &key.modulus)?;
    let len = msg.len();
    if len < 3 {
        return Err(Error::MessageTooShort(len));
    }
    if msg[0] != HEADER || msg[1] != kind.msgtype() || msg[len - 1] != TRAILER {
        return Err(Error::CertificateFormat {
            header: msg[0],
            msgtype: msg[1],
            trailer: msg[len - 1],
        });
    }

    let hash_pos = kind.hash_algo_offset();
    if hash_pos >= len {
        return Err(Error::MessageTooShort(len));
    }
    let mut h = Hasher::open(msg[hash_pos])?;
    let hash_len = h.output_size();
    if len < hash_len + 2 {
        return Err(Error::MessageTooShort(len));
    }
    let hash_start = len - 1 - hash_len;

    h.update(&msg[1..hash_start]);
    for data in aux {
        h.update(data);
    }
    let computed = h.finalize();
    let recovered = &msg[hash_start..len - 1];

    let integrity = if computed[..] == recovered[..] {
        Integrity::Authentic
    } else {
        warn!(
            "Calculated wrong hash: decoded {:02X?}, calculated {:02X?}",
            recovered, computed
        );
        if policy.strict {
            return Err(Error::HashMismatch);
        }
        warn!(?kind, "Continuing with an unauthenticated message");
        Integrity::HashMismatch {
            recovered: recovered.to_vec(),
            computed,
        }
    };

    msg.truncate(hash_start);
    Ok(Recovered {
        value: msg,
        integrity,
    })
}

/// Number of digits in a compressed numeric value; a 0xF nibble ends it.
fn cn_length(cn: &[u8]) -> usize {
    for (i, c) in cn.iter().enumerate() {
        if c >> 4 == 0xF {
            return 2 * i;
        }
        if c & 0xF == 0xF {
            return 2 * i + 1;
        }
    }
    2 * cn.len()
}

fn cn_digit(cn: &[u8], pos: usize) -> u8 {
    match cn.get(pos / 2) {
        None => 0xF,
        Some(c) if pos % 2 == 0 => c >> 4,
        Some(c) => c & 0xF,
    }
}

/// Checks the certificate's PAN against the card's. An issuer certificate may carry just
/// the leading (at least 4) digits; an ICC certificate must carry all of them.
fn check_pan(layout: &KeyLayout, card: &[u8], cert: &[u8]) -> Result<()> {
    let card_len = cn_length(card);
    let cert_len = cn_length(cert);
    let bad_len = match layout.kind {
        CertKind::Issuer => cert_len < 4 || cert_len > card_len,
        _ => cert_len != card_len,
    };
    if bad_len {
        return Err(Error::PanLength {
            card: card_len,
            cert: cert_len,
        });
    }
    if (0..cert_len).any(|i| cn_digit(card, i) != cn_digit(cert, i)) {
        warn!("PAN data mismatch: card {:02X?}, certificate {:02X?}", card, cert);
        return Err(Error::PanMismatch);
    }
    Ok(())
}

/// Recovers a public key from its certificate, exponent and remainder, checking it
/// against the card's PAN. `extra` is hashed after the remainder and exponent.
#[allow(clippy::too_many_arguments)]
pub fn decode_key(
    enc_key: &EmvPk,
    layout: &KeyLayout,
    pan: &[u8],
    cert: &[u8],
    exp: &[u8],
    rem: &[u8],
    extra: &[&[u8]],
    policy: VerificationPolicy,
) -> Result<Recovered<EmvPk>> {
    let mut aux = vec![rem, exp];
    aux.extend_from_slice(extra);
    let msg = decode_message(enc_key, layout.kind, cert, &aux, policy)?;
    let m = &msg.value[..];
    if m.len() < layout.modulus() {
        return Err(Error::MessageTooShort(m.len()));
    }

    check_pan(layout, pan, &m[layout.pan()])?;

    let pk_len = m[layout.modulus_len()] as usize;
    let envelope = &m[layout.modulus()..];
    if pk_len > envelope.len() + rem.len() {
        return Err(Error::ModulusLength(pk_len));
    }
    let exp_len = m[layout.exponent_len()] as usize;
    if exp_len != exp.len() {
        return Err(Error::ExponentLength {
            cert: exp_len,
            tlv: exp.len(),
        });
    }

    let mut modulus = Vec::with_capacity(pk_len);
    if pk_len <= envelope.len() {
        modulus.extend_from_slice(&envelope[..pk_len]);
    } else {
        modulus.extend_from_slice(envelope);
        modulus.extend_from_slice(&rem[..pk_len - envelope.len()]);
    }

    let mut pk = EmvPk::new(modulus, exp.to_vec())?;
    pk.rid = enc_key.rid;
    pk.index = enc_key.index;
    pk.hash_algo = m[layout.hash_algo()];
    pk.pk_algo = m[layout.pk_algo()];
    let expiry = &m[layout.expiry()];
    pk.expire = (expiry[1] as u32) << 16 | (expiry[0] as u32) << 8 | 0x31;
    pk.serial.copy_from_slice(&m[layout.serial()]);
    pk.pan = [0xFF; 10];
    pk.pan[..layout.pan_len].copy_from_slice(&m[layout.pan()]);

    debug!(
        kind = ?layout.kind,
        serial = ?pk.serial,
        expire = format_args!("{:06x}", pk.expire),
        bits = pk.modulus.len() * 8,
        "Recovered public key"
    );
    Ok(Recovered {
        value: pk,
        integrity: msg.integrity,
    })
}

fn require<'d>(db: &'d TlvDb, tag: Tag) -> Result<&'d [u8]> {
    db.get_tlv(tag)
        .map(|tlv| tlv.value)
        .ok_or(Error::MissingTag(tag))
}

fn recover_key(
    enc_key: &EmvPk,
    db: &TlvDb,
    layout: &KeyLayout,
    extra: &[&[u8]],
    policy: VerificationPolicy,
) -> Result<Recovered<EmvPk>> {
    let pan = require(db, TAG_PAN)?;
    let cert = require(db, layout.cert_tag)?;
    let exp = require(db, layout.exp_tag)?;
    let rem = db.get_tlv(layout.rem_tag).map_or(&[][..], |tlv| tlv.value);
    decode_key(enc_key, layout, pan, cert, exp, rem, extra, policy)
        .tap_err(|err| warn!(kind = ?layout.kind, %err, "Couldn't recover public key"))
}

/// Recovers the Issuer Public Key with a CA key.
pub fn recover_issuer_cert(
    ca_key: &EmvPk,
    db: &TlvDb,
    policy: VerificationPolicy,
) -> Result<Recovered<EmvPk>> {
    let span = trace_span!("recover_issuer_cert");
    let _enter = span.enter();
    recover_key(ca_key, db, &KeyLayout::ISSUER, &[], policy)
}

/// Recovers the ICC Public Key with the issuer key. `sda` is the static data to be
/// authenticated, as read from the records the AFL marks for it.
pub fn recover_icc_cert(
    issuer_key: &EmvPk,
    db: &TlvDb,
    sda: &[u8],
    policy: VerificationPolicy,
) -> Result<Recovered<EmvPk>> {
    let span = trace_span!("recover_icc_cert");
    let _enter = span.enter();
    let sdatl = sdatl(db)?;
    recover_key(issuer_key, db, &KeyLayout::ICC, &[sda, sdatl.as_slice()], policy)
}

/// Recovers the ICC PIN Encipherment Public Key with the issuer key.
pub fn recover_icc_pe_cert(
    issuer_key: &EmvPk,
    db: &TlvDb,
    policy: VerificationPolicy,
) -> Result<Recovered<EmvPk>> {
    let span = trace_span!("recover_icc_pe_cert");
    let _enter = span.enter();
    recover_key(issuer_key, db, &KeyLayout::ICC_PE, &[], policy)
}

/// Concatenates the values of the tags listed in the Static Data Authentication Tag
/// List (0x9F4A), skipping any the card didn't send.
pub fn sdatl(db: &TlvDb) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let Some(list) = db.get_tlv(TAG_SDA_TAG_LIST) else {
        return Ok(out);
    };
    let mut input = list.value;
    while !input.is_empty() {
        let (rest, tag) = ber::parse_tag(input)?;
        if let Some(tlv) = db.get_tlv(tag) {
            out.extend_from_slice(tlv.value);
        }
        input = rest;
    }
    Ok(out)
}

/// Verifies the Signed Static Application Data (SDA) with the issuer key, and returns the
/// Data Authentication Code (0x9F45).
pub fn recover_dac(
    enc_key: &EmvPk,
    db: &TlvDb,
    sda: &[u8],
    policy: VerificationPolicy,
) -> Result<Recovered<TlvDb<'static>>> {
    let span = trace_span!("recover_dac");
    let _enter = span.enter();

    let sdatl = sdatl(db)?;
    let cert = require(db, TAG_SSAD)?;
    let msg = decode_message(enc_key, CertKind::Dac, cert, &[sda, sdatl.as_slice()], policy)?;
    if msg.value.len() < cert::DAC.end {
        return Err(Error::MessageTooShort(msg.value.len()));
    }
    let dac = &msg.value[cert::DAC];
    debug!("Data Authentication Code: {:02X?}", dac);
    Ok(Recovered {
        value: TlvDb::fixed(TAG_DAC, dac),
        integrity: msg.integrity,
    })
}

/// Checks the ICC Dynamic Data lengths and returns the ICC Dynamic Number.
fn dynamic_number(m: &[u8]) -> Result<&[u8]> {
    if m.len() <= cert::DYN_IDN_LEN {
        return Err(Error::MessageTooShort(m.len()));
    }
    let data_len = m[cert::DYN_DATA_LEN];
    if data_len < 2 || data_len as usize > m.len() - 3 {
        return Err(Error::DynamicDataLength(data_len));
    }
    let idn_len = m[cert::DYN_IDN_LEN];
    if idn_len > data_len - 1 || cert::DYN_IDN + idn_len as usize > m.len() {
        return Err(Error::IdnLength(idn_len));
    }
    Ok(&m[cert::DYN_IDN..cert::DYN_IDN + idn_len as usize])
}

/// Verifies a DDA signature (0x9F4B) over `dyn_data`, the data the terminal sent in
/// INTERNAL AUTHENTICATE, and returns the ICC Dynamic Number (0x9F4C).
pub fn recover_idn(
    icc_key: &EmvPk,
    db: &TlvDb,
    dyn_data: &[u8],
    policy: VerificationPolicy,
) -> Result<Recovered<TlvDb<'static>>> {
    let span = trace_span!("recover_idn");
    let _enter = span.enter();

    let cert = require(db, TAG_SDAD)?;
    let msg = decode_message(icc_key, CertKind::Dynamic, cert, &[dyn_data], policy)?;
    let idn = dynamic_number(&msg.value)?;
    debug!("ICC Dynamic Number: {:02X?}", idn);
    Ok(Recovered {
        value: TlvDb::fixed(TAG_IDN, idn),
        integrity: msg.integrity,
    })
}

/// Verifies an fDDA signature (0x9F4B) over the terminal data in [`FDDA_TAGS`], and
/// returns the ATC it carries as 0x9F36.
pub fn recover_atc(
    icc_key: &EmvPk,
    db: &TlvDb,
    policy: VerificationPolicy,
) -> Result<Recovered<TlvDb<'static>>> {
    let span = trace_span!("recover_atc");
    let _enter = span.enter();

    let cert = require(db, TAG_SDAD)?;
    let aux: Vec<&[u8]> = FDDA_TAGS
        .iter()
        .filter_map(|tag| db.get_tlv(*tag))
        .map(|tlv| tlv.value)
        .collect();
    let msg = decode_message(icc_key, CertKind::Dynamic, cert, &aux, policy)?;
    let atc = dynamic_number(&msg.value)?;
    debug!("ATC: {:02X?}", atc);
    Ok(Recovered {
        value: TlvDb::fixed(TAG_ATC, atc),
        integrity: msg.integrity,
    })
}

/// Hashes the data a CDA signature's Transaction Data Hash Code covers: the PDOL and
/// CDOL related data, then every primitive element of the GENERATE AC response except
/// the signature itself, encoded.
pub fn transaction_hash(
    hash_algo: u8,
    this_db: &TlvDb,
    pdol: &[u8],
    cdol1: &[u8],
    cdol2: &[u8],
) -> Result<Vec<u8>> {
    let mut h = Hasher::open(hash_algo)?;
    h.update(pdol);
    h.update(cdol1);
    h.update(cdol2);
    for (id, _) in this_db.walk(this_db.root()) {
        let tlv = this_db.tlv(id);
        if tlv.is_constructed() || tlv.tag == TAG_SDAD {
            continue;
        }
        h.update(&tlv.encode()?);
    }
    Ok(h.finalize())
}

/// Verifies a CDA signature in a GENERATE AC response (`this_db`) and returns the ICC
/// Dynamic Number (0x9F4C).
///
/// The Unpredictable Number is taken from `db`, the card data gathered so far. The
/// signature must carry the same Cryptogram Information Data as the response, which is
/// checked before the transaction data is hashed.
pub fn perform_cda(
    icc_key: &EmvPk,
    db: &TlvDb,
    this_db: &TlvDb,
    pdol: &[u8],
    cdol1: &[u8],
    cdol2: &[u8],
    policy: VerificationPolicy,
) -> Result<Recovered<TlvDb<'static>>> {
    let span = trace_span!("perform_cda");
    let _enter = span.enter();

    let un = require(db, TAG_UN)?;
    let cid = require(this_db, TAG_CID)?;
    let cert = require(this_db, TAG_SDAD)?;

    let mut msg = decode_message(icc_key, CertKind::Dynamic, cert, &[un], policy)?;
    let m = &msg.value[..];
    if m.len() <= cert::DYN_IDN_LEN {
        return Err(Error::MessageTooShort(m.len()));
    }
    let data_len = m[cert::DYN_DATA_LEN];
    if data_len < cert::CDA_MIN_DATA_LEN || data_len as usize > m.len() - 4 {
        warn!("Invalid dynamic data length {}", data_len);
        return Err(Error::DynamicDataLength(data_len));
    }
    let idn_len = m[cert::DYN_IDN_LEN];
    let cid_pos = cert::DYN_IDN + idn_len as usize;
    let tdhc_pos = cid_pos + 1 + cert::CDA_AC_LEN;
    if idn_len > data_len - 1 || tdhc_pos + cert::CDA_TDHC_LEN > m.len() {
        warn!("Invalid ICC Dynamic Number length {}", idn_len);
        return Err(Error::IdnLength(idn_len));
    }
    if cid != [m[cid_pos]] {
        warn!("CID mismatch: signed {:02X}, response {:02X?}", m[cid_pos], cid);
        return Err(Error::CidMismatch);
    }

    let computed = transaction_hash(icc_key.hash_algo, this_db, pdol, cdol1, cdol2)?;
    let recovered = &m[tdhc_pos..tdhc_pos + cert::CDA_TDHC_LEN];
    if computed[..] != recovered[..] {
        warn!(
            "Transaction data hash mismatch: decoded {:02X?}, calculated {:02X?}",
            recovered, computed
        );
        if policy.strict {
            return Err(Error::TransactionHashMismatch);
        }
        warn!("Continuing with an unauthenticated CDA signature");
        if msg.integrity == Integrity::Authentic {
            msg.integrity = Integrity::TransactionHashMismatch {
                recovered: recovered.to_vec(),
                computed,
            };
        }
    }

    let idn = &msg.value[cert::DYN_IDN..cid_pos];
    debug!("ICC Dynamic Number: {:02X?}", idn);
    Ok(Recovered {
        value: TlvDb::fixed(TAG_IDN, idn),
        integrity: msg.integrity,
    })
}
