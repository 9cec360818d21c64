//! Issuing certificates and signatures: the inverse of recovery, for card emulation and
//! for testing terminals.

use super::cert::{self, CertKind, KeyLayout};
use super::{TAG_SDAD, TAG_SSAD};
use crate::crypto::{self, HashAlgo, Hasher};
use crate::errors::{Error, Result};
use crate::pk::EmvPk;
use crate::tlvdb::TlvDb;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use zeroize::Zeroizing;

/// A signed message: the certificate, and whatever of the message didn't fit in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signed {
    pub cert: Vec<u8>,
    pub remainder: Vec<u8>,
}

/// Wraps `msg` (starting with its message type) in an ISO/IEC 9796-2 envelope and signs
/// it. `aux` is hashed after the message, the way the verifier will.
pub fn sign_message(key: &RsaPrivateKey, msg: &[u8], aux: &[&[u8]]) -> Result<Signed> {
    let mut h = Hasher::new(HashAlgo::Sha1);
    let hash_len = h.output_size();
    let size = key.size();
    if size < hash_len + 2 || msg.is_empty() {
        return Err(Error::MessageTooShort(size));
    }

    let mut tmp = Zeroizing::new(vec![0xBB; size]);
    tmp[0] = 0x6A;
    tmp[size - 1] = 0xBC;
    let part_len = size - 2 - hash_len;
    let (part, remainder) = msg.split_at(msg.len().min(part_len));
    tmp[1..1 + part.len()].copy_from_slice(part);

    h.update(&tmp[1..1 + part_len]);
    h.update(remainder);
    for data in aux {
        h.update(data);
    }
    tmp[1 + part_len..size - 1].copy_from_slice(&h.finalize());

    let cert = crypto::rsa_private(&tmp, key)?;
    Ok(Signed {
        cert: cert.to_vec(),
        remainder: remainder.to_vec(),
    })
}

/// The public half of `key`, as an RSA/SHA-1 [`EmvPk`].
pub fn public_key(key: &RsaPrivateKey) -> Result<EmvPk> {
    EmvPk::new(key.n().to_bytes_be(), key.e().to_bytes_be())
}

/// A CA key for `key`, with its checksum filled in.
pub fn make_ca(
    key: &RsaPrivateKey,
    rid: [u8; 5],
    index: u8,
    expire: u32,
    hash_algo: HashAlgo,
) -> Result<EmvPk> {
    let mut pk = public_key(key)?;
    pk.rid = rid;
    pk.index = index;
    pk.expire = expire;
    pk.hash_algo = hash_algo.into();

    let mut h = Hasher::new(hash_algo);
    h.update(&pk.rid);
    h.update(&[pk.index]);
    h.update(&pk.modulus);
    h.update(&pk.exp);
    let digest = h.finalize();
    pk.hash[..digest.len()].copy_from_slice(&digest);
    Ok(pk)
}

fn sign_key(
    key: &RsaPrivateKey,
    pk: &EmvPk,
    layout: &KeyLayout,
    static_data: &[u8],
) -> Result<TlvDb<'static>> {
    let mlen =
        u8::try_from(pk.modulus.len()).map_err(|_| Error::ModulusLength(pk.modulus.len()))?;
    let elen = u8::try_from(pk.exp.len()).map_err(|_| Error::ExponentTooLong(pk.exp.len()))?;

    let mut msg = Vec::with_capacity(layout.modulus() - 1 + pk.modulus.len());
    msg.push(layout.kind.msgtype());
    msg.extend_from_slice(&pk.pan[..layout.pan_len]);
    msg.push((pk.expire >> 8) as u8);
    msg.push((pk.expire >> 16) as u8);
    msg.extend_from_slice(&pk.serial);
    msg.extend_from_slice(&[pk.hash_algo, pk.pk_algo, mlen, elen]);
    msg.extend_from_slice(&pk.modulus);

    let signed = sign_message(key, &msg, &[pk.exp.as_slice(), static_data])?;
    let mut db = TlvDb::fixed(layout.cert_tag, &signed.cert);
    if !signed.remainder.is_empty() {
        db.add(TlvDb::fixed(layout.rem_tag, &signed.remainder));
    }
    db.add(TlvDb::fixed(layout.exp_tag, &pk.exp));
    Ok(db)
}

/// Issues an Issuer Public Key Certificate (0x90, with 0x92 and 0x9F32) for `issuer_pk`.
/// Its PAN field should hold the leading digits of the card PANs it'll be used for.
pub fn sign_issuer_cert(ca_key: &RsaPrivateKey, issuer_pk: &EmvPk) -> Result<TlvDb<'static>> {
    sign_key(ca_key, issuer_pk, &KeyLayout::ISSUER, &[])
}

/// Issues an ICC Public Key Certificate (0x9F46, with 0x9F48 and 0x9F47). `static_data`
/// is the data to be authenticated followed by the SDA tag list values.
pub fn sign_icc_cert(
    issuer_key: &RsaPrivateKey,
    icc_pk: &EmvPk,
    static_data: &[u8],
) -> Result<TlvDb<'static>> {
    sign_key(issuer_key, icc_pk, &KeyLayout::ICC, static_data)
}

/// Issues an ICC PIN Encipherment Public Key Certificate (0x9F2D, with 0x9F2F and 0x9F2E).
pub fn sign_icc_pe_cert(
    issuer_key: &RsaPrivateKey,
    icc_pe_pk: &EmvPk,
) -> Result<TlvDb<'static>> {
    sign_key(issuer_key, icc_pe_pk, &KeyLayout::ICC_PE, &[])
}

/// Signs static application data (0x93) with the Data Authentication Code `dac`.
pub fn sign_dac(
    issuer_key: &RsaPrivateKey,
    dac: &[u8; 2],
    static_data: &[u8],
) -> Result<TlvDb<'static>> {
    let mut msg = vec![CertKind::Dac.msgtype(), HashAlgo::Sha1.into()];
    msg.extend_from_slice(dac);
    let signed = sign_message(issuer_key, &msg, &[static_data])?;
    Ok(TlvDb::fixed(TAG_SSAD, &signed.cert))
}

/// Signs dynamic application data (0x9F4B) carrying `number` (the ICC Dynamic Number,
/// or for fDDA the ATC) over the terminal's data `aux`.
pub fn sign_dynamic(
    icc_key: &RsaPrivateKey,
    number: &[u8],
    aux: &[&[u8]],
) -> Result<TlvDb<'static>> {
    let len = u8::try_from(number.len()).map_err(|_| Error::ValueTooLong(number.len()))?;
    let data_len = len.checked_add(1).ok_or(Error::IdnLength(len))?;
    let mut msg = vec![CertKind::Dynamic.msgtype(), HashAlgo::Sha1.into(), data_len, len];
    msg.extend_from_slice(number);
    let signed = sign_message(icc_key, &msg, aux)?;
    Ok(TlvDb::fixed(TAG_SDAD, &signed.cert))
}

/// Signs a DDA response (0x9F4B) over the DDOL data `dyn_data`.
pub fn sign_idn(icc_key: &RsaPrivateKey, idn: &[u8], dyn_data: &[u8]) -> Result<TlvDb<'static>> {
    sign_dynamic(icc_key, idn, &[dyn_data])
}

/// Signs a CDA response (0x9F4B). `tdhc` is the [`transaction_hash`](super::transaction_hash)
/// of the GENERATE AC response without its signature, and `un` the terminal's
/// Unpredictable Number.
pub fn sign_cda(
    icc_key: &RsaPrivateKey,
    idn: &[u8],
    cid: u8,
    ac: &[u8; cert::CDA_AC_LEN],
    tdhc: &[u8; cert::CDA_TDHC_LEN],
    un: &[u8],
) -> Result<TlvDb<'static>> {
    let len = u8::try_from(idn.len()).map_err(|_| Error::ValueTooLong(idn.len()))?;
    let data_len = len
        .checked_add(cert::CDA_MIN_DATA_LEN)
        .ok_or(Error::IdnLength(len))?;
    let mut msg = vec![CertKind::Dynamic.msgtype(), HashAlgo::Sha1.into(), data_len, len];
    msg.extend_from_slice(idn);
    msg.push(cid);
    msg.extend_from_slice(ac);
    msg.extend_from_slice(tdhc);
    let signed = sign_message(icc_key, &msg, &[un])?;
    Ok(TlvDb::fixed(TAG_SDAD, &signed.cert))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_keys::test_key;
    use crate::pki::{self, VerificationPolicy};

    pub(crate) const RID: [u8; 5] = [0xA0, 0x00, 0x00, 0x00, 0x03];

    pub(crate) fn test_ca() -> EmvPk {
        make_ca(&test_key("CA"), RID, 0x01, 0x291231, HashAlgo::Sha1).unwrap()
    }

    pub(crate) fn test_issuer() -> EmvPk {
        let mut pk = public_key(&test_key("ISSUER")).unwrap();
        pk.rid = RID;
        pk.index = 0x01;
        pk.pan[..4].copy_from_slice(&[0x47, 0x61, 0x73, 0x90]);
        pk.serial = [0x12, 0x34, 0x56];
        pk.expire = 0x281231;
        pk
    }

    #[test]
    fn test_make_ca() {
        let ca = test_ca();
        assert!(ca.verify());
        assert_eq!(128, ca.modulus.len());
        assert_eq!(vec![0x03], ca.exp);
        let line = include_str!("../../tests/data/capk.txt").lines().nth(1).unwrap();
        assert_eq!(EmvPk::parse(line).unwrap(), ca);
    }

    #[test]
    fn test_sign_message_layout() {
        let key = test_key("ICC");
        let msg: Vec<u8> = (0..100).collect();
        let signed = sign_message(&key, &msg, &[]).unwrap();
        assert_eq!(96, signed.cert.len());
        // 96 - header, trailer and hash.
        assert_eq!(&msg[74..], &signed.remainder[..]);

        let m = crypto::rsa_public(&signed.cert, &[0x03], &key.n().to_bytes_be()).unwrap();
        assert_eq!(0x6A, m[0]);
        assert_eq!(&msg[..74], &m[1..75]);
        assert_eq!(0xBC, m[95]);
    }

    #[test]
    fn test_issuer_cert_layout() {
        let db = sign_issuer_cert(&test_key("CA"), &test_issuer()).unwrap();
        let tags: Vec<_> = db.walk(db.root()).map(|(id, _)| db.tag(id)).collect();
        assert_eq!(vec![0x90, 0x92, 0x9F32], tags);
        assert_eq!(128, db.get_tlv(0x90).unwrap().len());
        // 126 byte message, 106 bytes of room.
        assert_eq!(20, db.get_tlv(0x92).unwrap().len());
        assert_eq!(&[0x03], db.get_tlv(0x9F32).unwrap().value);
    }

    #[test]
    fn test_issuer_cert_roundtrip() {
        let issuer = test_issuer();
        let mut db = TlvDb::fixed(0x5A, &[0x47, 0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10]);
        db.add(sign_issuer_cert(&test_key("CA"), &issuer).unwrap());

        let recovered = pki::recover_issuer_cert(&test_ca(), &db, VerificationPolicy::STRICT)
            .unwrap()
            .into_authentic()
            .unwrap();
        assert_eq!(issuer, recovered);
    }

    #[test]
    fn test_sign_limits() {
        let mut issuer = test_issuer();
        issuer.modulus = vec![0xC1; 256];
        assert_eq!(
            Err(Error::ModulusLength(256)),
            sign_issuer_cert(&test_key("CA"), &issuer).map(|_| ())
        );
        assert_eq!(
            Err(Error::IdnLength(0xFF)),
            sign_idn(&test_key("ICC"), &[0; 0xFF], &[]).map(|_| ())
        );
        assert_eq!(
            Err(Error::ValueTooLong(256)),
            sign_idn(&test_key("ICC"), &[0; 256], &[]).map(|_| ())
        );
    }
}
