//! Agent token material: 256-bit random tokens, SHA-256 storage hashes,
//! constant-time verification. Raw tokens are never persisted or logged.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Display prefix length (hex chars).
pub const PREFIX_LEN: usize = 8;

/// Generates a fresh token. Returns `(raw, prefix, hash)`; the raw value goes
/// to the agent once and only the prefix + hash are stored.
pub fn generate() -> (String, String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let raw = hex::encode(bytes);
    let prefix = raw[..PREFIX_LEN].to_string();
    let hash = hash(&raw);
    (raw, prefix, hash)
}

/// Hex SHA-256 of a raw token.
pub fn hash(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Verifies a presented raw token against a stored hex hash without
/// short-circuiting on the first differing byte.
pub fn verify(raw: &str, stored_hash_hex: &str) -> bool {
    let Ok(stored) = hex::decode(stored_hash_hex) else {
        return false;
    };
    let presented = Sha256::digest(raw.as_bytes());
    if stored.len() != presented.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in presented.iter().zip(stored.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}
