//! Registration token secrets

use rand::Rng;
use sha2::{Digest, Sha256};

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const GROUPS: usize = 4;
const GROUP_LEN: usize = 5;

/// Generate a registration token secret like `K7Q2M-9XW4T-PL0ZD-3HV8N`
///
/// 20 symbols over a 36-character alphabet (~103 bits), grouped so an
/// operator can read it out to an installer.
pub fn generate_registration_token() -> String {
    let mut rng = rand::thread_rng();
    let groups: Vec<String> = (0..GROUPS)
        .map(|_| {
            (0..GROUP_LEN)
                .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                .collect()
        })
        .collect();
    groups.join("-")
}

/// SHA-256 hex digest used as the stored form of a token
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// First group of a token, safe to show in listings
pub fn token_hint(token: &str) -> String {
    token.split('-').next().unwrap_or_default().to_string()
}
