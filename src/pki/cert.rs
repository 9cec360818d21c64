use crate::ber::Tag;
use std::ops::Range;

/// The kinds of signed data an EMV card carries, with the layout of their recovered message.
///
/// Offsets index the full recovered message `M`, where `M[0]` is the 0x6A header and
/// `M[1]` is the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertKind {
    /// Issuer Public Key Certificate, signed by a CA key.
    Issuer,
    /// ICC Public Key Certificate, signed by the issuer key.
    Icc,
    /// ICC PIN Encipherment Public Key Certificate, signed by the issuer key.
    IccPe,
    /// Signed Static Application Data.
    Dac,
    /// Signed Dynamic Application Data (DDA, fDDA and CDA).
    Dynamic,
}

impl CertKind {
    pub const fn msgtype(self) -> u8 {
        match self {
            Self::Issuer => 0x02,
            Self::Dac => 0x03,
            Self::Icc | Self::IccPe => 0x04,
            Self::Dynamic => 0x05,
        }
    }

    /// Where the Hash Algorithm Indicator sits.
    pub const fn hash_algo_offset(self) -> usize {
        match self {
            Self::Issuer => 11,
            Self::Icc | Self::IccPe => 17,
            Self::Dac | Self::Dynamic => 2,
        }
    }

    pub const fn key_layout(self) -> Option<KeyLayout> {
        match self {
            Self::Issuer => Some(KeyLayout::ISSUER),
            Self::Icc => Some(KeyLayout::ICC),
            Self::IccPe => Some(KeyLayout::ICC_PE),
            Self::Dac | Self::Dynamic => None,
        }
    }
}

/// Field layout of a public key certificate, and the tags it's carried in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLayout {
    pub kind: CertKind,
    /// Bytes of PAN in the certificate.
    pub pan_len: usize,
    pub cert_tag: Tag,
    pub exp_tag: Tag,
    pub rem_tag: Tag,
}

impl KeyLayout {
    pub const ISSUER: Self = Self {
        kind: CertKind::Issuer,
        pan_len: 4,
        cert_tag: 0x90,
        exp_tag: 0x9F32,
        rem_tag: 0x92,
    };
    pub const ICC: Self = Self {
        kind: CertKind::Icc,
        pan_len: 10,
        cert_tag: 0x9F46,
        exp_tag: 0x9F47,
        rem_tag: 0x9F48,
    };
    pub const ICC_PE: Self = Self {
        kind: CertKind::IccPe,
        pan_len: 10,
        cert_tag: 0x9F2D,
        exp_tag: 0x9F2E,
        rem_tag: 0x9F2F,
    };

    pub const fn pan(&self) -> Range<usize> {
        2..2 + self.pan_len
    }
    /// Expiry month, then year (BCD).
    pub const fn expiry(&self) -> Range<usize> {
        2 + self.pan_len..4 + self.pan_len
    }
    pub const fn serial(&self) -> Range<usize> {
        4 + self.pan_len..7 + self.pan_len
    }
    pub const fn hash_algo(&self) -> usize {
        7 + self.pan_len
    }
    pub const fn pk_algo(&self) -> usize {
        8 + self.pan_len
    }
    pub const fn modulus_len(&self) -> usize {
        9 + self.pan_len
    }
    pub const fn exponent_len(&self) -> usize {
        10 + self.pan_len
    }
    /// Start of the (leftmost part of the) modulus, and the shortest valid message.
    pub const fn modulus(&self) -> usize {
        11 + self.pan_len
    }
}

/// Signed Static Application Data: the Data Authentication Code.
pub const DAC: Range<usize> = 3..5;

/// Signed Dynamic Application Data: length of the ICC Dynamic Data.
pub const DYN_DATA_LEN: usize = 3;
/// Signed Dynamic Application Data: length of the ICC Dynamic Number.
pub const DYN_IDN_LEN: usize = 4;
/// Signed Dynamic Application Data: start of the ICC Dynamic Number.
pub const DYN_IDN: usize = 5;

/// In a CDA signature, the Cryptogram Information Data is followed by the
/// Application Cryptogram and the Transaction Data Hash Code.
pub const CDA_AC_LEN: usize = 8;
pub const CDA_TDHC_LEN: usize = 20;
/// Smallest ICC Dynamic Data length a CDA signature can have.
pub const CDA_MIN_DATA_LEN: u8 = 30;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_algo_follows_key_fields() {
        for layout in [KeyLayout::ISSUER, KeyLayout::ICC, KeyLayout::ICC_PE] {
            assert_eq!(layout.kind.hash_algo_offset(), layout.hash_algo());
            assert_eq!(Some(layout), layout.kind.key_layout());
        }
        assert_eq!(None, CertKind::Dac.key_layout());
    }

    #[test]
    fn test_issuer_layout() {
        let l = KeyLayout::ISSUER;
        assert_eq!(2..6, l.pan());
        assert_eq!(6..8, l.expiry());
        assert_eq!(8..11, l.serial());
        assert_eq!(13, l.modulus_len());
        assert_eq!(14, l.exponent_len());
        assert_eq!(15, l.modulus());
    }
}
