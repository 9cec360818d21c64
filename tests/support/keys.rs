//! The fixed RSA test keys in `tests/data/test_keys.txt`.

use rsa::{BigUint, RsaPrivateKey};

/// Loads a key by name (`CA`, `ISSUER` or `ICC`). All have public exponent 3.
pub fn test_key(name: &str) -> RsaPrivateKey {
    let component = |k: &str| {
        include_str!("../data/test_keys.txt")
            .lines()
            .filter_map(|line| line.strip_prefix(name)?.strip_prefix(' ')?.strip_prefix(k))
            .find_map(|rest| BigUint::parse_bytes(rest.trim().as_bytes(), 16))
            .unwrap()
    };
    RsaPrivateKey::from_components(
        component("n "),
        BigUint::from(3u8),
        component("d "),
        vec![component("p "), component("q ")],
    )
    .unwrap()
}
