pub mod auth;
pub mod ber;
pub mod crypto;
pub mod errors;
pub mod pk;
pub mod pki;
pub mod tlvdb;

#[cfg(test)]
#[path = "../tests/support/keys.rs"]
mod test_keys;

pub use auth::{AuthMethod, OfflineAuth, Outcome};
pub use errors::{Error, Result};
pub use pk::{CaKeyStore, EmvPk};
pub use pki::{Integrity, Recovered, VerificationPolicy};
pub use tlvdb::{NodeId, TlvDb};
