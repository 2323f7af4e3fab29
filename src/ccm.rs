//! The AES-CCM construction used to wrap VMK and FVEK records.
//!
//! This is not a generic CCM implementation: the counter format, the carry
//! behavior on counter wraparound, and the flags byte used to build the MAC
//! IV are all specific to this format and do not match RFC 3610's usual
//! parameterization assumptions closely enough to reuse an off-the-shelf
//! CCM crate.

use std::fmt;

use aes::{Aes128, Aes256};
use cipher::{BlockEncrypt, KeyInit};
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

#[derive(Debug)]
pub enum CcmError {
    InvalidKeyLength(usize),
    AuthenticationFailed,
}

impl fmt::Display for CcmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CcmError::InvalidKeyLength(n) => write!(f, "unsupported AES key length: {} bytes", n),
            CcmError::AuthenticationFailed => write!(f, "CCM tag verification failed"),
        }
    }
}

impl std::error::Error for CcmError {}

#[derive(ZeroizeOnDrop)]
pub enum AesKey {
    Aes128(Aes128),
    Aes256(Aes256),
}

impl AesKey {
    pub fn new(key: &[u8]) -> Result<AesKey, CcmError> {
        match key.len() {
            16 => Ok(AesKey::Aes128(
                Aes128::new_from_slice(key).map_err(|_| CcmError::InvalidKeyLength(key.len()))?,
            )),
            32 => Ok(AesKey::Aes256(
                Aes256::new_from_slice(key).map_err(|_| CcmError::InvalidKeyLength(key.len()))?,
            )),
            other => Err(CcmError::InvalidKeyLength(other)),
        }
    }

    fn encrypt_block(&self, block: &mut [u8; 16]) {
        use cipher::generic_array::GenericArray;
        let ga = GenericArray::from_mut_slice(block);
        match self {
            AesKey::Aes128(cipher) => cipher.encrypt_block(ga),
            AesKey::Aes256(cipher) => cipher.encrypt_block(ga),
        }
    }
}

fn length_of_length() -> u8 {
    // 15 - nonce_len, matching BLOCK_LEN - 1 - NONCE_LEN.
    (BLOCK_LEN - 1 - NONCE_LEN) as u8
}

fn counter_block(nonce: &[u8; NONCE_LEN]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0] = length_of_length() - 1;
    iv[1..1 + NONCE_LEN].copy_from_slice(nonce);
    iv
}

fn increment_counter(iv: &mut [u8; 16]) {
    for byte in iv.iter_mut().rev() {
        if *byte == 0xff {
            *byte = 0;
            continue;
        }
        *byte += 1;
        break;
    }
}

fn mac_iv0(nonce: &[u8; NONCE_LEN], message_len: usize) -> [u8; 16] {
    let l = length_of_length();
    let flags = (l - 1) | (((TAG_LEN as u8 - 2) / 2) << 3);
    let mut iv = [0u8; 16];
    iv[0] = flags;
    iv[1..1 + NONCE_LEN].copy_from_slice(nonce);
    let len_field = &mut iv[1 + NONCE_LEN..16];
    let len_bytes = (message_len as u32).to_be_bytes();
    len_field.copy_from_slice(&len_bytes[4 - len_field.len()..]);
    iv
}

/// Decrypt and authenticate a CCM-wrapped payload; returns the plaintext on
/// success, `AuthenticationFailed` if the recomputed tag does not match.
pub fn decrypt(
    key: &AesKey,
    nonce: &[u8; NONCE_LEN],
    tag: &[u8; TAG_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CcmError> {
    let mut counter = counter_block(nonce);

    let mut s0 = counter;
    key.encrypt_block(&mut s0);
    let mut recovered_tag = [0u8; TAG_LEN];
    for i in 0..TAG_LEN {
        recovered_tag[i] = tag[i] ^ s0[i];
    }
    counter[15] = 1;

    let mut plaintext = vec![0u8; ciphertext.len()];
    for (chunk_idx, chunk) in ciphertext.chunks(BLOCK_LEN).enumerate() {
        let mut keystream = counter;
        key.encrypt_block(&mut keystream);
        let start = chunk_idx * BLOCK_LEN;
        for (i, byte) in chunk.iter().enumerate() {
            plaintext[start + i] = byte ^ keystream[i];
        }
        increment_counter(&mut counter);
    }

    let computed_tag = compute_mac(key, nonce, &plaintext);
    if computed_tag != recovered_tag {
        plaintext.zeroize();
        return Err(CcmError::AuthenticationFailed);
    }

    Ok(plaintext)
}

/// Encrypt and authenticate a plaintext payload, producing `(ciphertext, tag)`.
pub fn encrypt(
    key: &AesKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> (Vec<u8>, [u8; TAG_LEN]) {
    let tag = compute_mac(key, nonce, plaintext);

    let mut counter = counter_block(nonce);
    let mut s0 = counter;
    key.encrypt_block(&mut s0);
    let mut masked_tag = [0u8; TAG_LEN];
    for i in 0..TAG_LEN {
        masked_tag[i] = tag[i] ^ s0[i];
    }
    counter[15] = 1;

    let mut ciphertext = vec![0u8; plaintext.len()];
    for (chunk_idx, chunk) in plaintext.chunks(BLOCK_LEN).enumerate() {
        let mut keystream = counter;
        key.encrypt_block(&mut keystream);
        let start = chunk_idx * BLOCK_LEN;
        for (i, byte) in chunk.iter().enumerate() {
            ciphertext[start + i] = byte ^ keystream[i];
        }
        increment_counter(&mut counter);
    }

    (ciphertext, masked_tag)
}

fn compute_mac(key: &AesKey, nonce: &[u8; NONCE_LEN], message: &[u8]) -> [u8; TAG_LEN] {
    let mut t = mac_iv0(nonce, message.len());
    key.encrypt_block(&mut t);

    for chunk in message.chunks(BLOCK_LEN) {
        let mut block = [0u8; BLOCK_LEN];
        block[..chunk.len()].copy_from_slice(chunk);
        for i in 0..BLOCK_LEN {
            t[i] ^= block[i];
        }
        key.encrypt_block(&mut t);
    }

    t
}
