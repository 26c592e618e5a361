//! Credential computation for relay authentication.
//!
//! Both halves derive 48 bytes of key material from the agent's shared
//! secret with PBKDF2-HMAC-SHA256, salted with the agent's name, and use
//! it (32 bytes of key, 16 of IV) to encrypt the challenge token with
//! AES-256.  The agent presents the hex-encoded ciphertext; the
//! controller recomputes it and compares in constant time.  Possession
//! of the ciphertext proves possession of the secret without the secret
//! ever crossing the wire.

use ctr::cipher::{KeyIvInit, StreamCipher};
use pbkdf2::pbkdf2_hmac;
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// AES-256 in counter mode.
type Aes256Ctr = ctr::Ctr64BE<aes::Aes256>;

/// PBKDF2 iteration count.
///
/// Credentials are computed once per handshake, not per request, so the
/// count can be meaningful without hurting throughput.
const KDF_ROUNDS: u32 = 4096;

/// Bytes of derived key material: a 256-bit key plus a 128-bit IV.
const KEY_MATERIAL_LEN: usize = 48;

/// Length of generated token values.
///
/// 43 characters over the 62-symbol alphabet carry a little over 256
/// bits of entropy, matching a 32-byte random token.
pub const TOKEN_LEN: usize = 43;

/// Generate a fresh random token over the base62 alphabet.
pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Derive (key, iv) from a secret and the agent name.
fn derive_key_material(secret: &str, agent_name: &str) -> ([u8; 32], [u8; 16]) {
    let mut material = [0_u8; KEY_MATERIAL_LEN];
    pbkdf2_hmac::<Sha256>(
        secret.as_bytes(),
        agent_name.as_bytes(),
        KDF_ROUNDS,
        &mut material,
    );
    let mut key = [0_u8; 32];
    key.copy_from_slice(&material[..32]);
    let mut iv = [0_u8; 16];
    iv.copy_from_slice(&material[32..]);
    (key, iv)
}

/// Compute the credential an agent presents for a given token.
pub fn compute_credential(secret: &str, agent_name: &str, token: &str) -> String {
    let (key, iv) = derive_key_material(secret, agent_name);
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    let mut buf = token.as_bytes().to_vec();
    cipher.apply_keystream(&mut buf);
    hex::encode(buf)
}

/// Check a presented credential against the expected one, in constant
/// time.
pub fn verify_credential(secret: &str, agent_name: &str, token: &str, presented: &str) -> bool {
    let expected = compute_credential(secret, agent_name, token);
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn credential_round_trip() {
        let cred = compute_credential("s3cret", "agent-1", "tok");
        assert!(verify_credential("s3cret", "agent-1", "tok", &cred));
    }

    #[test]
    fn credential_binds_all_inputs() {
        let cred = compute_credential("s3cret", "agent-1", "tok");
        assert!(!verify_credential("wrong", "agent-1", "tok", &cred));
        assert!(!verify_credential("s3cret", "agent-2", "tok", &cred));
        assert!(!verify_credential("s3cret", "agent-1", "other", &cred));
        assert!(!verify_credential("s3cret", "agent-1", "tok", "deadbeef"));
    }

    #[test]
    fn credential_is_deterministic() {
        assert_eq!(
            compute_credential("s", "a", "t"),
            compute_credential("s", "a", "t")
        );
    }

    #[test]
    fn tokens_are_long_and_alphanumeric() {
        let t = generate_token();
        assert_eq!(t.len(), TOKEN_LEN);
        assert!(t.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_token(), generate_token());
    }
}
