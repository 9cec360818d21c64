#[path = "support/keys.rs"]
mod keys;

use emv_auth::crypto::HashAlgo;
use emv_auth::pki::{self, sign};
use emv_auth::{
    AuthMethod, CaKeyStore, EmvPk, Error, Integrity, OfflineAuth, TlvDb, VerificationPolicy,
};
use keys::test_key;

const RID: [u8; 5] = [0xA0, 0x00, 0x00, 0x00, 0x03];
const PAN: [u8; 8] = [0x47, 0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10];
const AIP: [u8; 2] = [0x39, 0x00];
/// A READ RECORD response marked for offline data authentication.
const RECORD: [u8; 14] = [
    0x70, 0x0C, 0x5F, 0x24, 0x03, 0x29, 0x12, 0x31, 0x5F, 0x25, 0x03, 0x19, 0x01, 0x01,
];
const UN: [u8; 4] = [0x12, 0x34, 0x56, 0x78];
const IDN: [u8; 4] = [0xD1, 0xD2, 0xD3, 0xD4];

fn keys() -> CaKeyStore {
    let mut keys = CaKeyStore::default();
    keys.push(sign::make_ca(&test_key("CA"), RID, 0x01, 0x291231, HashAlgo::Sha1).unwrap());
    keys
}

fn issuer_pk(pan: &[u8]) -> EmvPk {
    let mut pk = sign::public_key(&test_key("ISSUER")).unwrap();
    pk.rid = RID;
    pk.index = 0x01;
    pk.pan[..pan.len()].copy_from_slice(pan);
    pk.serial = [0x00, 0x00, 0x42];
    pk.expire = 0x281231;
    pk
}

fn icc_pk(pan: &[u8]) -> EmvPk {
    let mut pk = sign::public_key(&test_key("ICC")).unwrap();
    pk.rid = RID;
    pk.index = 0x01;
    pk.pan[..pan.len()].copy_from_slice(pan);
    pk.serial = [0x00, 0x00, 0x01];
    pk.expire = 0x271231;
    pk
}

/// The static data the ICC certificate and SSAD sign: the records, then the AIP.
fn static_data() -> Vec<u8> {
    let mut data = RECORD.to_vec();
    data.extend_from_slice(&AIP);
    data
}

/// Card data up to and including the issuer certificate.
fn card(issuer: &EmvPk) -> TlvDb<'static> {
    let mut db = TlvDb::parse_multi(&[
        0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10, 0x8F, 0x01, 0x01, 0x5A, 0x08, 0x47,
        0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10, 0x82, 0x02, 0x39, 0x00, 0x9F, 0x4A, 0x01, 0x82,
    ])
    .unwrap();
    db.add(TlvDb::fixed(0x21, &RECORD));
    db.add(sign::sign_issuer_cert(&test_key("CA"), issuer).unwrap());
    db
}

/// Card data with an ICC key, for the dynamic methods.
fn icc_card() -> TlvDb<'static> {
    let mut db = card(&issuer_pk(&PAN[..4]));
    db.add(sign::sign_icc_cert(&test_key("ISSUER"), &icc_pk(&PAN), &static_data()).unwrap());
    db.add(TlvDb::fixed(0x9F37, &UN));
    db
}

#[test]
fn test_issuer_recovery() {
    let keys = keys();
    let issuer = issuer_pk(&PAN[..4]);
    let db = card(&issuer);
    let ca = OfflineAuth::new(&keys).ca_key(&db).unwrap();

    let recovered = pki::recover_issuer_cert(ca, &db, VerificationPolicy::STRICT).unwrap();
    assert!(recovered.is_authentic());
    assert_eq!(issuer.modulus, recovered.value.modulus);
    assert_eq!([0x00, 0x00, 0x42], recovered.value.serial);
    assert_eq!(0x281231, recovered.value.expire);
    assert_eq!(issuer, recovered.value);

    // Signing and recovering are both deterministic.
    let again = card(&issuer);
    assert_eq!(db.get_tlv(0x90), again.get_tlv(0x90));
    assert_eq!(
        recovered,
        pki::recover_issuer_cert(ca, &db, VerificationPolicy::STRICT).unwrap()
    );
}

#[test]
fn test_issuer_hash_mismatch() {
    let keys = keys();
    let mut db = card(&issuer_pk(&PAN[..4]));
    let mut rem = db.get_tlv(0x92).unwrap().value.to_vec();
    rem[0] ^= 0x01;
    db.change_or_add(0x92, &rem);
    let ca = OfflineAuth::new(&keys).ca_key(&db).unwrap();

    assert_eq!(
        Err(Error::HashMismatch),
        pki::recover_issuer_cert(ca, &db, VerificationPolicy::STRICT)
    );

    let lenient = pki::recover_issuer_cert(ca, &db, VerificationPolicy::LENIENT).unwrap();
    assert!(matches!(lenient.integrity, Integrity::HashMismatch { .. }));
    assert!(lenient.value.modulus.ends_with(&rem));
    assert_eq!(Err(Error::HashMismatch), lenient.into_authentic());
}

#[test]
fn test_issuer_pan() {
    let keys = keys();
    let auth = OfflineAuth::new(&keys);

    // Four digits is the least an issuer certificate may carry.
    let db = card(&issuer_pk(&[0x47, 0x61, 0xFF, 0xFF]));
    let ca = auth.ca_key(&db).unwrap();
    assert!(pki::recover_issuer_cert(ca, &db, VerificationPolicy::STRICT).is_ok());

    let db = card(&issuer_pk(&[0x47, 0x6F, 0xFF, 0xFF]));
    assert_eq!(
        Err(Error::PanLength { card: 16, cert: 3 }),
        pki::recover_issuer_cert(ca, &db, VerificationPolicy::STRICT)
    );

    let db = card(&issuer_pk(&[0x47, 0x61, 0x73, 0x91]));
    assert_eq!(
        Err(Error::PanMismatch),
        pki::recover_issuer_cert(ca, &db, VerificationPolicy::STRICT)
    );
}

#[test]
fn test_unknown_ca_key() {
    let keys = keys();
    let mut db = card(&issuer_pk(&PAN[..4]));
    db.change_or_add(0x8F, &[0x02]);
    assert_eq!(
        Err(Error::KeyNotFound {
            rid: RID,
            index: 0x02
        }),
        OfflineAuth::new(&keys).sda(&mut db).map(|_| ())
    );
}

#[test]
fn test_icc_recovery() {
    let keys = keys();
    let db = icc_card();
    let ca = OfflineAuth::new(&keys).ca_key(&db).unwrap();
    let issuer = pki::recover_issuer_cert(ca, &db, VerificationPolicy::STRICT)
        .unwrap()
        .value;

    let icc = pki::recover_icc_cert(&issuer, &db, &RECORD, VerificationPolicy::STRICT).unwrap();
    assert!(icc.is_authentic());
    assert_eq!(icc_pk(&PAN), icc.value);
    // The ICC modulus doesn't fit the issuer's certificate.
    assert!(db.get_tlv(0x9F48).is_some());

    // Changed records invalidate the certificate.
    assert_eq!(
        Err(Error::HashMismatch),
        pki::recover_icc_cert(&issuer, &db, &RECORD[1..], VerificationPolicy::STRICT)
    );
}

#[test]
fn test_certificate_byte_flips() {
    let keys = keys();
    let mut db = icc_card();
    let ca = OfflineAuth::new(&keys).ca_key(&db).unwrap();
    let issuer = pki::recover_issuer_cert(ca, &db, VerificationPolicy::STRICT)
        .unwrap()
        .value;

    // A flipped ciphertext byte scrambles the whole recovered message, so its envelope
    // is rejected before any hash is compared, and leniency doesn't help.
    for (tag, len) in [(0x90, 128), (0x9F46, 112)] {
        let cert = db.get_tlv(tag).unwrap().value.to_vec();
        assert_eq!(len, cert.len());
        for i in 0..len {
            let mut flipped = cert.clone();
            flipped[i] ^= 0x01;
            db.change_or_add(tag, &flipped);
            for policy in [VerificationPolicy::STRICT, VerificationPolicy::LENIENT] {
                let result = match tag {
                    0x90 => pki::recover_issuer_cert(ca, &db, policy),
                    _ => pki::recover_icc_cert(&issuer, &db, &RECORD, policy),
                };
                assert!(result.is_err(), "{tag:04X} byte {i} {policy:?}");
            }
        }
        db.change_or_add(tag, &cert);
    }
    assert!(pki::recover_icc_cert(&issuer, &db, &RECORD, VerificationPolicy::STRICT).is_ok());
}

#[test]
fn test_icc_hash_mismatch() {
    let keys = keys();
    let mut db = icc_card();
    let ca = OfflineAuth::new(&keys).ca_key(&db).unwrap();
    let issuer = pki::recover_issuer_cert(ca, &db, VerificationPolicy::STRICT)
        .unwrap()
        .value;
    let mut rem = db.get_tlv(0x9F48).unwrap().value.to_vec();
    rem[0] ^= 0x01;
    db.change_or_add(0x9F48, &rem);

    assert_eq!(
        Err(Error::HashMismatch),
        pki::recover_icc_cert(&issuer, &db, &RECORD, VerificationPolicy::STRICT)
    );

    let lenient =
        pki::recover_icc_cert(&issuer, &db, &RECORD, VerificationPolicy::LENIENT).unwrap();
    assert!(matches!(lenient.integrity, Integrity::HashMismatch { .. }));
    assert!(lenient.value.modulus.ends_with(&rem));
    assert_eq!(96, lenient.value.modulus.len());
}

#[test]
fn test_icc_pan_mismatch() {
    let keys = keys();
    let mut db = card(&issuer_pk(&PAN[..4]));
    let mut pan = PAN;
    pan[7] = 0x11;
    db.add(sign::sign_icc_cert(&test_key("ISSUER"), &icc_pk(&pan), &static_data()).unwrap());

    let ca = OfflineAuth::new(&keys).ca_key(&db).unwrap();
    let issuer = pki::recover_issuer_cert(ca, &db, VerificationPolicy::STRICT)
        .unwrap()
        .value;
    assert_eq!(
        Err(Error::PanMismatch),
        pki::recover_icc_cert(&issuer, &db, &RECORD, VerificationPolicy::STRICT)
    );
}

#[test]
fn test_sda() {
    let keys = keys();
    let mut db = card(&issuer_pk(&PAN[..4]));
    db.add(sign::sign_dac(&test_key("ISSUER"), &[0xDA, 0xC0], &static_data()).unwrap());

    let outcome = OfflineAuth::new(&keys).sda(&mut db).unwrap();
    assert_eq!(AuthMethod::Sda, outcome.method);
    assert!(outcome.is_authentic());
    assert_eq!(None, outcome.icc);
    assert_eq!(&[0xDA, 0xC0], db.get_tlv(0x9F45).unwrap().value);
}

#[test]
fn test_sda_without_records() {
    let keys = keys();
    let issuer = issuer_pk(&PAN[..4]);
    let mut db = TlvDb::parse_multi(&[
        0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10, 0x8F, 0x01, 0x01, 0x5A, 0x08, 0x47,
        0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10,
    ])
    .unwrap();
    db.add(sign::sign_issuer_cert(&test_key("CA"), &issuer).unwrap());
    db.add(sign::sign_dac(&test_key("ISSUER"), &[0xDA, 0xC0], &[]).unwrap());
    assert_eq!(
        Err(Error::MissingTag(0x21)),
        OfflineAuth::new(&keys).sda(&mut db).map(|_| ())
    );
}

#[test]
fn test_sda_lenient() {
    let keys = keys();
    let mut db = card(&issuer_pk(&PAN[..4]));
    db.add(sign::sign_dac(&test_key("ISSUER"), &[0xDA, 0xC0], &RECORD).unwrap());

    // Signed without the AIP the tag list asks for.
    assert_eq!(
        Err(Error::HashMismatch),
        OfflineAuth::new(&keys).sda(&mut db).map(|_| ())
    );
    let outcome = OfflineAuth::new(&keys)
        .with_policy(VerificationPolicy::LENIENT)
        .sda(&mut db)
        .unwrap();
    assert!(!outcome.is_authentic());
    assert!(matches!(outcome.integrity, Integrity::HashMismatch { .. }));
}

#[test]
fn test_dda_format_1() {
    let keys = keys();
    let mut db = icc_card();
    // An SSAD this short isn't checked.
    db.add(TlvDb::fixed(0x93, &[0x00]));
    let sig = sign::sign_idn(&test_key("ICC"), &IDN, &UN).unwrap();
    let sig = sig.get_tlv(0x9F4B).unwrap().value;
    let mut response = vec![0x80, sig.len() as u8];
    response.extend_from_slice(sig);

    let outcome = OfflineAuth::new(&keys).dda(&mut db, &response, &UN).unwrap();
    assert_eq!(None, db.get_tlv(0x9F45));
    assert_eq!(AuthMethod::Dda, outcome.method);
    assert!(outcome.is_authentic());
    assert_eq!(Some(icc_pk(&PAN)), outcome.icc);
    assert_eq!(None, outcome.icc_pe);
    assert_eq!(sig, db.get_tlv(0x9F4B).unwrap().value);
    assert_eq!(&IDN, db.get_tlv(0x9F4C).unwrap().value);
}

#[test]
fn test_dda_format_2() {
    let keys = keys();
    let auth = OfflineAuth::new(&keys);
    let sig = sign::sign_idn(&test_key("ICC"), &IDN, &UN).unwrap();
    let sig = sig.get_tlv(0x9F4B).unwrap().value;
    let mut response = vec![0x77, 3 + sig.len() as u8, 0x9F, 0x4B, sig.len() as u8];
    response.extend_from_slice(sig);

    let mut db = icc_card_with_ssad(&static_data());
    db.add(sign::sign_icc_pe_cert(&test_key("ISSUER"), &icc_pk(&PAN)).unwrap());
    let outcome = auth.dda(&mut db, &response, &UN).unwrap();
    assert!(outcome.is_authentic());
    assert_eq!(Some(icc_pk(&PAN)), outcome.icc_pe);
    assert_eq!(&[0xDA, 0xC0], db.get_tlv(0x9F45).unwrap().value);
    assert_eq!(&IDN, db.get_tlv(0x9F4C).unwrap().value);

    // The SSAD, when there is one, must cover the tag list too.
    assert_eq!(
        Err(Error::HashMismatch),
        auth.dda(&mut icc_card_with_ssad(&RECORD), &response, &UN)
            .map(|_| ())
    );

    // Signed over a different challenge.
    assert_eq!(
        Err(Error::HashMismatch),
        auth.dda(&mut icc_card(), &response, &[0x00; 4]).map(|_| ())
    );
}

fn icc_card_with_ssad(signed: &[u8]) -> TlvDb<'static> {
    let mut db = icc_card();
    db.add(sign::sign_dac(&test_key("ISSUER"), &[0xDA, 0xC0], signed).unwrap());
    db
}

fn fdda_card(atc: &[u8]) -> TlvDb<'static> {
    let mut db = icc_card();
    let amount = [0x00, 0x00, 0x00, 0x00, 0x10, 0x00];
    let currency = [0x09, 0x78];
    let cad = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
    db.add(TlvDb::fixed(0x9F02, &amount));
    db.add(TlvDb::fixed(0x5F2A, &currency));
    db.add(TlvDb::fixed(0x9F69, &cad));
    db.add(TlvDb::fixed(0x9F36, &[0x00, 0x2A]));
    db.add(
        sign::sign_dynamic(
            &test_key("ICC"),
            atc,
            &[UN.as_slice(), amount.as_slice(), currency.as_slice(), cad.as_slice()],
        )
        .unwrap(),
    );
    db
}

#[test]
fn test_fdda() {
    let keys = keys();
    let auth = OfflineAuth::new(&keys);

    let outcome = auth.fdda(&fdda_card(&[0x00, 0x2A])).unwrap();
    assert_eq!(AuthMethod::Fdda, outcome.method);
    assert!(outcome.is_authentic());

    assert_eq!(
        Err(Error::AtcMismatch),
        auth.fdda(&fdda_card(&[0x00, 0x2B])).map(|_| ())
    );

    let mut db = fdda_card(&[0x00, 0x2A]);
    db.change_or_add(0x9F02, &[0x00, 0x00, 0x00, 0x00, 0x20, 0x00]);
    assert_eq!(Err(Error::HashMismatch), auth.fdda(&db).map(|_| ()));
}

const PDOL: [u8; 4] = [0x00, 0x00, 0x10, 0x00];
const CDOL1: [u8; 6] = [0x09, 0x78, 0x26, 0x10, 0x18, 0x00];

/// A GENERATE AC response with a CDA signature over `cid`.
fn ac_response(cid: u8, signed_cid: u8) -> TlvDb<'static> {
    let ac = [0xAC; 8];
    let mut db = TlvDb::parse(&[
        0x77, 0x14, 0x9F, 0x27, 0x01, cid, 0x9F, 0x36, 0x02, 0x00, 0x2A, 0x9F, 0x26, 0x08, 0xAC,
        0xAC, 0xAC, 0xAC, 0xAC, 0xAC, 0xAC, 0xAC,
    ])
    .unwrap();
    let tdhc: [u8; 20] = pki::transaction_hash(0x01, &db, &PDOL, &CDOL1, &[])
        .unwrap()
        .try_into()
        .unwrap();
    db.add(sign::sign_cda(&test_key("ICC"), &IDN, signed_cid, &ac, &tdhc, &UN).unwrap());
    db
}

#[test]
fn test_cda() {
    let keys = keys();
    let auth = OfflineAuth::new(&keys);
    let mut db = icc_card();

    let outcome = auth
        .cda(&mut db, &ac_response(0x80, 0x80), &PDOL, &CDOL1, &[])
        .unwrap();
    assert_eq!(AuthMethod::Cda, outcome.method);
    assert!(outcome.is_authentic());
    assert_eq!(&IDN, db.get_tlv(0x9F4C).unwrap().value);
}

#[test]
fn test_cda_cid_mismatch() {
    let keys = keys();
    let mut db = icc_card();
    assert_eq!(
        Err(Error::CidMismatch),
        OfflineAuth::new(&keys)
            .cda(&mut db, &ac_response(0x40, 0x80), &PDOL, &CDOL1, &[])
            .map(|_| ())
    );
}

#[test]
fn test_cda_transaction_hash_mismatch() {
    let keys = keys();
    let response = ac_response(0x80, 0x80);
    let cdol1 = [0x09, 0x78, 0x26, 0x10, 0x18, 0x01];

    assert_eq!(
        Err(Error::TransactionHashMismatch),
        OfflineAuth::new(&keys)
            .cda(&mut icc_card(), &response, &PDOL, &cdol1, &[])
            .map(|_| ())
    );

    let outcome = OfflineAuth::new(&keys)
        .with_policy(VerificationPolicy::LENIENT)
        .cda(&mut icc_card(), &response, &PDOL, &cdol1, &[])
        .unwrap();
    assert!(matches!(
        outcome.integrity,
        Integrity::TransactionHashMismatch { .. }
    ));
}
