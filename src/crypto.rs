//! Hash and public key primitives used by certificate recovery.

use crate::errors::{Error, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use sha1::{Digest, Sha1};
use zeroize::Zeroizing;

/// Hash Algorithm Indicator, as carried in CA keys and certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum HashAlgo {
    Sha1 = 0x01,
}

/// Public Key Algorithm Indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PkAlgo {
    Rsa = 0x01,
}

impl HashAlgo {
    pub fn from_id(id: u8) -> Result<Self> {
        Self::try_from(id).map_err(|_| Error::UnsupportedHash(id))
    }

    pub fn output_size(self) -> usize {
        match self {
            Self::Sha1 => 20,
        }
    }
}

impl PkAlgo {
    pub fn from_id(id: u8) -> Result<Self> {
        Self::try_from(id).map_err(|_| Error::UnsupportedPkAlgo(id))
    }
}

/// A streaming hash context.
#[derive(Clone)]
pub enum Hasher {
    Sha1(Sha1),
}

impl Hasher {
    pub fn new(algo: HashAlgo) -> Self {
        match algo {
            HashAlgo::Sha1 => Self::Sha1(Sha1::new()),
        }
    }

    /// Opens a context for a raw algorithm indicator.
    pub fn open(id: u8) -> Result<Self> {
        HashAlgo::from_id(id).map(Self::new)
    }

    pub fn algo(&self) -> HashAlgo {
        match self {
            Self::Sha1(_) => HashAlgo::Sha1,
        }
    }

    pub fn output_size(&self) -> usize {
        self.algo().output_size()
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
        }
    }

    /// Hashes the concatenation of `parts` in one go.
    pub fn digest(algo: HashAlgo, parts: &[&[u8]]) -> Vec<u8> {
        let mut h = Self::new(algo);
        for part in parts {
            h.update(part);
        }
        h.finalize()
    }
}

fn modpow(
    input: &[u8],
    exp: &BigUint,
    modulus: &BigUint,
    out_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    if modulus.bits() == 0 {
        return Err(Error::Crypto("zero modulus".into()));
    }
    let m = BigUint::from_bytes_be(input);
    if m >= *modulus {
        return Err(Error::Crypto("input is not smaller than the modulus".into()));
    }

    let c = Zeroizing::new(m.modpow(exp, modulus).to_bytes_be());
    let mut out = Zeroizing::new(vec![0; out_len]);
    out[out_len - c.len()..].copy_from_slice(&c);
    Ok(out)
}

/// Raw RSA public operation: `input ^ exp mod modulus`, left-padded to the modulus length.
pub fn rsa_public(input: &[u8], exp: &[u8], modulus: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let n = BigUint::from_bytes_be(modulus);
    let e = BigUint::from_bytes_be(exp);
    modpow(input, &e, &n, modulus.len())
}

/// Raw RSA private operation, the inverse of [`rsa_public`] with the matching public key.
pub fn rsa_private(input: &[u8], key: &RsaPrivateKey) -> Result<Zeroizing<Vec<u8>>> {
    modpow(input, key.d(), key.n(), key.size())
}
