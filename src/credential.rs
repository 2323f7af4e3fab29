//! Credential providers turn an external secret into a 32-byte intermediate
//! key capable of unwrapping one VMK record.

use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

const CHAIN_HASH_ITERATIONS: u64 = 0x100000;

#[derive(Debug)]
pub enum CredentialError {
    MalformedRecoveryPassword,
    BadRecoveryPasswordChecksum,
    MalformedKeyfile,
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::MalformedRecoveryPassword => {
                write!(f, "recovery password is not in the expected 8x6-digit format")
            }
            CredentialError::BadRecoveryPasswordChecksum => {
                write!(f, "recovery password failed its block checksum")
            }
            CredentialError::MalformedKeyfile => write!(f, "keyfile has an unexpected size or shape"),
        }
    }
}

impl std::error::Error for CredentialError {}

/// A 32-byte key derived from a credential, used to unwrap a VMK's AES-CCM
/// payload. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct IntermediateKey(pub [u8; 32]);

/// Size of `bitlocker_chain_hash_t`: `updated_hash[32] + password_hash[32] +
/// salt[16] + hash_count[8]`, hashed as one contiguous buffer each round.
const CHAIN_HASH_STATE_LEN: usize = 32 + 32 + 16 + 8;

/// Chain-hash key stretching: `0x100000` rounds of SHA-256 over the 88-byte
/// state `{updated_hash, password_hash, salt, hash_count}`. Each round hashes
/// the whole state into `updated_hash` and advances `hash_count`;
/// `password_hash` and `salt` are set once and never touched again.
pub fn chain_hash(initial_material: &[u8], salt: &[u8; 16]) -> IntermediateKey {
    let password_hash = Sha256::digest(initial_material);

    let mut state = [0u8; CHAIN_HASH_STATE_LEN];
    state[32..64].copy_from_slice(&password_hash);
    state[64..80].copy_from_slice(salt);
    // state[0..32] (updated_hash) starts zeroed; the source leaves it so too.

    let mut hash_count: u64 = 0;
    for _ in 0..CHAIN_HASH_ITERATIONS {
        state[80..88].copy_from_slice(&hash_count.to_le_bytes());
        let digest = Sha256::digest(state);
        state[0..32].copy_from_slice(&digest);
        hash_count = hash_count.wrapping_add(1);
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&state[0..32]);
    state.zeroize();
    IntermediateKey(out)
}

/// Derive the intermediate key for a recovery-password protector.
///
/// `digits` must be exactly 48 ASCII digits (hyphens already stripped).
pub fn recovery_password_key(
    digits: &str,
    salt: &[u8; 16],
) -> Result<IntermediateKey, CredentialError> {
    let blocks = parse_recovery_password(digits)?;
    let mut material = [0u8; 16];
    for (i, block) in blocks.iter().enumerate() {
        let value = block / 11;
        material[i * 2..i * 2 + 2].copy_from_slice(&(value as u16).to_le_bytes());
    }
    Ok(chain_hash(&material, salt))
}

/// Validate and parse a 48-digit recovery password into 8 integer blocks.
/// Accepts either pure digits or hyphen-separated groups of six.
fn parse_recovery_password(input: &str) -> Result<[u32; 8], CredentialError> {
    let digits: String = input.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    if digits.len() != 48 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(CredentialError::MalformedRecoveryPassword);
    }

    let mut blocks = [0u32; 8];
    for (i, chunk) in digits.as_bytes().chunks(6).enumerate() {
        let block: u32 = std::str::from_utf8(chunk)
            .unwrap()
            .parse()
            .map_err(|_| CredentialError::MalformedRecoveryPassword)?;
        blocks[i] = block;
    }

    for block in blocks {
        if block % 11 != 0 || block >= 720_896 {
            return Err(CredentialError::BadRecoveryPasswordChecksum);
        }
    }
    for chunk in digits.as_bytes().chunks(6) {
        let d: Vec<i64> = chunk.iter().map(|b| (b - b'0') as i64).collect();
        let expected = (d[0] - d[1] + d[2] - d[3] + d[4]).rem_euclid(11);
        if d[5] != expected {
            return Err(CredentialError::BadRecoveryPasswordChecksum);
        }
    }

    Ok(blocks)
}

/// Derive the intermediate key for a user-password protector.
pub fn user_password_key(password: &[u8], salt: &[u8; 16]) -> IntermediateKey {
    let utf16: Vec<u16> = password.iter().map(|&b| b as u16).collect();
    let mut utf16_bytes = Vec::with_capacity(utf16.len() * 2);
    for unit in &utf16 {
        utf16_bytes.extend_from_slice(&unit.to_le_bytes());
    }
    let first = Sha256::digest(&utf16_bytes);
    let second = Sha256::digest(first);
    chain_hash(&second, salt)
}

/// Derive the intermediate key for a UTF-8 / UTF-16-lossless user password,
/// accepting the password as a Rust string (the common real-world case) and
/// encoding it to proper UTF-16LE rather than a widened byte string.
pub fn user_password_key_str(password: &str, salt: &[u8; 16]) -> IntermediateKey {
    let mut utf16_bytes = Vec::with_capacity(password.len() * 2);
    for unit in password.encode_utf16() {
        utf16_bytes.extend_from_slice(&unit.to_le_bytes());
    }
    let first = Sha256::digest(&utf16_bytes);
    let second = Sha256::digest(first);
    chain_hash(&second, salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_password_checksum_validates() {
        let good = "236808-089419-192665-495704-618299-073414-538373-542366";
        let result = parse_recovery_password(good);
        assert!(result.is_ok(), "{:?}", result);
    }

    #[test]
    fn recovery_password_rejects_bad_checksum() {
        let bad = "236809-089419-192665-495704-618299-073414-538373-542366";
        assert!(matches!(
            parse_recovery_password(bad),
            Err(CredentialError::BadRecoveryPasswordChecksum)
        ));
    }

    #[test]
    fn recovery_password_rejects_wrong_length() {
        assert!(matches!(
            parse_recovery_password("12345"),
            Err(CredentialError::MalformedRecoveryPassword)
        ));
    }

    #[test]
    fn chain_hash_is_deterministic() {
        let salt = [0u8; 16];
        let a = chain_hash(b"same input", &salt);
        let b = chain_hash(b"same input", &salt);
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn chain_hash_matches_known_vector() {
        // Computed from a from-scratch reference of the bitlocker_chain_hash_t
        // loop (88-byte state, 0x100000 rounds) against this exact input/salt.
        let salt: [u8; 16] = (0u8..16).collect::<Vec<u8>>().try_into().unwrap();
        let result = chain_hash(b"known test material", &salt);
        let expected =
            hex::decode("556803eab3dc9e629b4fe965ca65a9199498685be94059999ebd0ef35828a5b1")
                .unwrap();
        assert_eq!(result.0.to_vec(), expected);
    }

    #[test]
    fn chain_hash_differs_with_salt() {
        let a = chain_hash(b"same input", &[0u8; 16]);
        let b = chain_hash(b"same input", &[1u8; 16]);
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn user_password_str_and_bytes_agree_for_ascii() {
        let salt = [9u8; 16];
        let a = user_password_key(b"hunter2", &salt);
        let b = user_password_key_str("hunter2", &salt);
        assert_eq!(a.0, b.0);
    }
}
