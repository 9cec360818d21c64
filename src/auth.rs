//! Offline data authentication over the data read from a card.
//!
//! These run the certificate chain (CA key, issuer key, ICC key) and then the static or
//! dynamic check for the chosen method. Talking to the card is up to the caller: the
//! card's data goes in as a [`TlvDb`], and any responses the method needs (INTERNAL
//! AUTHENTICATE, GENERATE AC) are passed in as they were received.

use crate::ber::Tag;
use crate::errors::{Error, Result};
use crate::pk::{CaKeyStore, EmvPk};
use crate::pki::{self, Integrity, Recovered, VerificationPolicy};
use crate::tlvdb::TlvDb;
use tracing::{debug, info, trace_span, warn};

pub const TAG_DF_NAME: Tag = 0x84;
pub const TAG_CA_INDEX: Tag = 0x8F;
pub const TAG_AIP: Tag = 0x82;
/// The records the AFL marks for offline data authentication, concatenated as read.
/// Not an EMV tag; readers keep the data under it alongside the card's own.
pub const TAG_ODA_DATA: Tag = 0x21;
pub const TAG_ICC_PE_CERT: Tag = 0x9F2D;

const FORMAT_1: u8 = 0x80;

/// Offline data authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthMethod {
    /// Static Data Authentication.
    Sda,
    /// Dynamic Data Authentication.
    Dda,
    /// Fast DDA, with the signature in the GPO response.
    Fdda,
    /// Combined DDA/Application Cryptogram Generation.
    Cda,
}

impl AuthMethod {
    /// The strongest method (of SDA, DDA and CDA) the Application Interchange Profile
    /// says the card supports.
    pub fn from_aip(aip: &[u8]) -> Option<Self> {
        let b1 = *aip.first()?;
        if b1 & 0x01 != 0 {
            Some(Self::Cda)
        } else if b1 & 0x20 != 0 {
            Some(Self::Dda)
        } else if b1 & 0x40 != 0 {
            Some(Self::Sda)
        } else {
            None
        }
    }
}

/// What an authentication recovered, and whether it all checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub method: AuthMethod,
    pub issuer: EmvPk,
    pub icc: Option<EmvPk>,
    pub icc_pe: Option<EmvPk>,
    /// The first hash check that failed, if verification wasn't strict.
    pub integrity: Integrity,
}

impl Outcome {
    fn new(method: AuthMethod, issuer: Recovered<EmvPk>) -> Self {
        Self {
            method,
            issuer: issuer.value,
            icc: None,
            icc_pe: None,
            integrity: issuer.integrity,
        }
    }

    /// Folds in the integrity of a later step, keeping the first failure.
    fn note<T>(&mut self, step: Recovered<T>) -> T {
        if self.integrity == Integrity::Authentic {
            self.integrity = step.integrity;
        }
        step.value
    }

    pub fn is_authentic(&self) -> bool {
        self.integrity == Integrity::Authentic
    }

    fn icc(&self) -> Result<&EmvPk> {
        self.icc.as_ref().ok_or(Error::MissingTag(pki::cert::KeyLayout::ICC.cert_tag))
    }

    fn report(self) -> Self {
        if self.is_authentic() {
            info!(method = ?self.method, "Offline data authentication succeeded");
        } else {
            warn!(
                method = ?self.method,
                integrity = ?self.integrity,
                "Offline data authentication NOT verified"
            );
        }
        self
    }
}

/// Runs offline data authentication against a set of trusted CA keys.
#[derive(Debug, Clone, Copy)]
pub struct OfflineAuth<'k> {
    pub keys: &'k CaKeyStore,
    pub policy: VerificationPolicy,
}

impl<'k> OfflineAuth<'k> {
    pub fn new(keys: &'k CaKeyStore) -> Self {
        Self {
            keys,
            policy: VerificationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: VerificationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Finds the CA key named by the card's DF Name (0x84, whose first five bytes are the
    /// RID) and CA Public Key Index (0x8F).
    pub fn ca_key(&self, db: &TlvDb) -> Result<&'k EmvPk> {
        let df = db
            .get_tlv(TAG_DF_NAME)
            .ok_or(Error::MissingTag(TAG_DF_NAME))?;
        let index = db
            .get_tlv(TAG_CA_INDEX)
            .ok_or(Error::MissingTag(TAG_CA_INDEX))?;
        if df.len() < 6 {
            return Err(Error::TagLength {
                tag: TAG_DF_NAME,
                len: df.len(),
            });
        }
        let mut rid = [0; 5];
        rid.copy_from_slice(&df.value[..5]);
        let index = match index.value {
            [index] => *index,
            _ => {
                return Err(Error::TagLength {
                    tag: TAG_CA_INDEX,
                    len: index.len(),
                })
            }
        };
        self.keys.get(&rid, index)
    }

    fn oda_data<'d>(db: &'d TlvDb) -> Result<&'d [u8]> {
        match db.get_tlv(TAG_ODA_DATA) {
            Some(tlv) if !tlv.is_empty() => Ok(tlv.value),
            _ => Err(Error::MissingTag(TAG_ODA_DATA)),
        }
    }

    /// Recovers the issuer and ICC keys, and the ICC PIN encipherment key if the card
    /// has one. A bad PIN encipherment key is logged and left out.
    fn icc_chain(&self, method: AuthMethod, db: &TlvDb, sda: &[u8]) -> Result<Outcome> {
        let ca = self.ca_key(db)?;
        let mut out = Outcome::new(method, pki::recover_issuer_cert(ca, db, self.policy)?);
        debug!(
            rid = ?out.issuer.rid,
            index = out.issuer.index,
            serial = ?out.issuer.serial,
            "Issuer public key recovered"
        );

        let icc = pki::recover_icc_cert(&out.issuer, db, sda, self.policy)?;
        let icc = out.note(icc);
        debug!(serial = ?icc.serial, "ICC public key recovered");
        out.icc = Some(icc);

        if db.get(TAG_ICC_PE_CERT, None).is_some() {
            match pki::recover_icc_pe_cert(&out.issuer, db, self.policy) {
                Ok(pe) => out.icc_pe = Some(out.note(pe)),
                Err(err) => warn!(%err, "ICC PE public key recover error"),
            }
        }
        Ok(out)
    }

    /// Verifies the Signed Static Application Data if the card sent any.
    fn check_ssad(&self, out: &mut Outcome, db: &mut TlvDb) -> Result<()> {
        if db.get_tlv(pki::TAG_SSAD).map_or(true, |tlv| tlv.len() <= 1) {
            return Ok(());
        }
        let sda = db.get_tlv(TAG_ODA_DATA).map_or(&[][..], |tlv| tlv.value);
        let dac = pki::recover_dac(&out.issuer, db, sda, self.policy)?;
        db.add(out.note(dac));
        Ok(())
    }

    /// Static Data Authentication. Appends the Data Authentication Code (0x9F45) to `db`.
    pub fn sda(&self, db: &mut TlvDb) -> Result<Outcome> {
        let span = trace_span!("sda");
        let _enter = span.enter();

        let ca = self.ca_key(db)?;
        let mut out = Outcome::new(
            AuthMethod::Sda,
            pki::recover_issuer_cert(ca, db, self.policy)?,
        );
        let sda = Self::oda_data(db)?;
        let dac = pki::recover_dac(&out.issuer, db, sda, self.policy)?;
        db.add(out.note(dac));
        Ok(out.report())
    }

    /// Dynamic Data Authentication, given the INTERNAL AUTHENTICATE `response` to the
    /// DDOL data `dyn_data`. Format 1 responses (0x80) are stored as 0x9F4B. Appends the
    /// response and the ICC Dynamic Number (0x9F4C) to `db`.
    ///
    /// The Signed Static Application Data (0x93) is only checked if the card sent it; a
    /// card without one authenticates on its ICC key alone.
    pub fn dda(&self, db: &mut TlvDb, response: &[u8], dyn_data: &[u8]) -> Result<Outcome> {
        let span = trace_span!("dda");
        let _enter = span.enter();

        let sda = db.get_tlv(TAG_ODA_DATA).map_or(&[][..], |tlv| tlv.value);
        let mut out = self.icc_chain(AuthMethod::Dda, db, sda)?;
        self.check_ssad(&mut out, db)?;

        let parsed = TlvDb::parse_multi(response)?;
        let dda_db = if response.first() == Some(&FORMAT_1) {
            TlvDb::fixed(pki::TAG_SDAD, parsed.tlv(parsed.root()).value)
        } else {
            parsed
        };
        let idn = pki::recover_idn(out.icc()?, &dda_db, dyn_data, self.policy)?;
        db.add(dda_db);
        db.add(out.note(idn));
        Ok(out.report())
    }

    /// Fast DDA: checks the Signed Dynamic Application Data (0x9F4B) already in `db`, and
    /// that the ATC it signs is the card's.
    pub fn fdda(&self, db: &TlvDb) -> Result<Outcome> {
        let span = trace_span!("fdda");
        let _enter = span.enter();

        let sda = db.get_tlv(TAG_ODA_DATA).map_or(&[][..], |tlv| tlv.value);
        let mut out = self.icc_chain(AuthMethod::Fdda, db, sda)?;
        let atc = pki::recover_atc(out.icc()?, db, self.policy)?;
        let atc = out.note(atc);
        if atc.get_tlv(pki::TAG_ATC) != db.get_tlv(pki::TAG_ATC) {
            warn!("ATC in the signature and ATC in the card data differ");
            return Err(Error::AtcMismatch);
        }
        Ok(out.report())
    }

    /// Combined DDA/Application Cryptogram Generation, over the GENERATE AC response
    /// `ac_response` and the PDOL and CDOL related data the terminal sent. Appends the
    /// ICC Dynamic Number (0x9F4C) to `db`.
    pub fn cda(
        &self,
        db: &mut TlvDb,
        ac_response: &TlvDb,
        pdol: &[u8],
        cdol1: &[u8],
        cdol2: &[u8],
    ) -> Result<Outcome> {
        let span = trace_span!("cda");
        let _enter = span.enter();

        let sda = Self::oda_data(db)?;
        let mut out = self.icc_chain(AuthMethod::Cda, db, sda)?;
        self.check_ssad(&mut out, db)?;

        let idn = pki::perform_cda(
            out.icc()?,
            db,
            ac_response,
            pdol,
            cdol1,
            cdol2,
            self.policy,
        )?;
        db.add(out.note(idn));
        Ok(out.report())
    }
}
