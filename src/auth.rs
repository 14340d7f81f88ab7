//! Salted-hash authentication for the Identification packet's `keyMotd` field.

use md5::{Digest, Md5};
use rand::Rng;

const SALT_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generates a random 8-character salt, matching `uniuri.New()` in the
/// original source (alphanumeric, not used for anything cryptographically
/// sensitive beyond casual name-spoof deterrence).
pub fn generate_salt() -> String {
    random_token(8)
}

/// Generates a random 8-character player id token.
pub fn generate_player_id() -> String {
    random_token(8)
}

fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..SALT_ALPHABET.len());
            SALT_ALPHABET[idx] as char
        })
        .collect()
}

/// Computes `md5(salt ++ name)` as lowercase hex.
pub fn expected_hash(salt: &str, name: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(salt.as_bytes());
    hasher.update(name.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of the client-supplied `keyMotd` against the
/// expected `md5(salt ++ name)` hash. Returns false on any length or byte
/// mismatch; never short-circuits on the first differing byte.
pub fn compare_hash(salt: &str, name: &str, key_motd: &str) -> bool {
    let expected = expected_hash(salt, name);
    constant_time_eq(expected.as_bytes(), key_motd.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_hash() {
        let salt = "S";
        let name = "bob";
        let hash = expected_hash(salt, name);
        assert!(compare_hash(salt, name, &hash));
    }

    #[test]
    fn rejects_single_byte_difference() {
        let salt = "S";
        let name = "bob";
        let mut hash = expected_hash(salt, name);
        let last = hash.pop().unwrap();
        let flipped = if last == '0' { '1' } else { '0' };
        hash.push(flipped);
        assert!(!compare_hash(salt, name, &hash));
    }

    #[test]
    fn rejects_different_length() {
        assert!(!compare_hash("S", "bob", "deadbeef"));
    }

    #[test]
    fn is_a_pure_function() {
        let a = compare_hash("S", "bob", "x");
        let b = compare_hash("S", "bob", "x");
        assert_eq!(a, b);
    }

    #[test]
    fn tokens_have_requested_length() {
        assert_eq!(generate_salt().len(), 8);
        assert_eq!(generate_player_id().len(), 8);
    }
}
