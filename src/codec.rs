//! Per-sector encryption/decryption: plain AES-CBC, AES-CBC with the
//! Elephant diffuser, and AES-XTS, selected by the dataset's algorithm code.

use std::fmt;

use aes::{Aes128, Aes256};
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use xts_mode::Xts128;

use crate::diffuser;

pub const ALG_AES128_CBC_DIFFUSER: u16 = 0x8000;
pub const ALG_AES256_CBC_DIFFUSER: u16 = 0x8001;
pub const ALG_AES128_CBC: u16 = 0x8002;
pub const ALG_AES256_CBC: u16 = 0x8003;
pub const ALG_AES128_XTS: u16 = 0x8004;
pub const ALG_AES256_XTS: u16 = 0x8005;

#[derive(Debug)]
pub enum CodecError {
    UnsupportedAlgorithm(u16),
    KeyLength { expected: usize, actual: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnsupportedAlgorithm(code) => write!(f, "unsupported algorithm code: {:#06x}", code),
            CodecError::KeyLength { expected, actual } => {
                write!(f, "expected {} bytes of key material, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for CodecError {}

fn ecb_encrypt_block<C: BlockEncrypt>(cipher: &C, block: &mut [u8; 16]) {
    use cipher::generic_array::GenericArray;
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

enum AesBlock {
    Aes128(Box<Aes128>),
    Aes256(Box<Aes256>),
}

impl AesBlock {
    fn new(key: &[u8]) -> Result<AesBlock, CodecError> {
        match key.len() {
            16 => Ok(AesBlock::Aes128(Box::new(
                Aes128::new_from_slice(key).map_err(|_| CodecError::KeyLength { expected: 16, actual: key.len() })?,
            ))),
            32 => Ok(AesBlock::Aes256(Box::new(
                Aes256::new_from_slice(key).map_err(|_| CodecError::KeyLength { expected: 32, actual: key.len() })?,
            ))),
            other => Err(CodecError::KeyLength { expected: 32, actual: other }),
        }
    }

    fn encrypt_block(&self, block: &mut [u8; 16]) {
        match self {
            AesBlock::Aes128(c) => ecb_encrypt_block(c.as_ref(), block),
            AesBlock::Aes256(c) => ecb_encrypt_block(c.as_ref(), block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8; 16]) {
        use cipher::generic_array::GenericArray;
        let ga = GenericArray::from_mut_slice(block);
        match self {
            AesBlock::Aes128(c) => c.decrypt_block(ga),
            AesBlock::Aes256(c) => c.decrypt_block(ga),
        }
    }
}

fn offset_block(byte_offset: u64, high_byte: Option<u8>) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..8].copy_from_slice(&byte_offset.to_le_bytes());
    if let Some(b) = high_byte {
        block[15] = b;
    }
    block
}

/// Plain AES-CBC with a per-sector IV derived from the sector's byte offset.
pub struct CbcCipher {
    enc: AesBlock,
    dec: AesBlock,
}

impl CbcCipher {
    pub fn new(key: &[u8]) -> Result<CbcCipher, CodecError> {
        Ok(CbcCipher { enc: AesBlock::new(key)?, dec: AesBlock::new(key)? })
    }

    pub fn decrypt_sector(&self, byte_offset: u64, buf: &mut [u8]) {
        let mut iv = offset_block(byte_offset, None);
        self.enc.encrypt_block(&mut iv);
        cbc_decrypt_in_place(&self.dec, &iv, buf);
    }

    pub fn encrypt_sector(&self, byte_offset: u64, buf: &mut [u8]) {
        let mut iv = offset_block(byte_offset, None);
        self.enc.encrypt_block(&mut iv);
        cbc_encrypt_in_place(&self.enc, &iv, buf);
    }
}

fn cbc_decrypt_in_place(cipher: &AesBlock, iv: &[u8; 16], buf: &mut [u8]) {
    let mut prev = *iv;
    for chunk in buf.chunks_exact_mut(16) {
        let ct: [u8; 16] = chunk.try_into().unwrap();
        let mut block = ct;
        cipher.decrypt_block(&mut block);
        for i in 0..16 {
            block[i] ^= prev[i];
        }
        chunk.copy_from_slice(&block);
        prev = ct;
    }
}

fn cbc_encrypt_in_place(cipher: &AesBlock, iv: &[u8; 16], buf: &mut [u8]) {
    let mut prev = *iv;
    for chunk in buf.chunks_exact_mut(16) {
        let mut block: [u8; 16] = chunk.try_into().unwrap();
        for i in 0..16 {
            block[i] ^= prev[i];
        }
        cipher.encrypt_block(&mut block);
        chunk.copy_from_slice(&block);
        prev = block;
    }
}

/// AES-CBC with the Elephant diffuser, used by Vista and Windows 7 by
/// default before the move to XTS.
pub struct CbcDiffuserCipher {
    cbc: CbcCipher,
    tweak_enc: AesBlock,
}

impl CbcDiffuserCipher {
    /// `cipher_key` and `tweak_key` are each 16 or 32 bytes, matching the
    /// FVEK record's two halves.
    pub fn new(cipher_key: &[u8], tweak_key: &[u8]) -> Result<CbcDiffuserCipher, CodecError> {
        Ok(CbcDiffuserCipher {
            cbc: CbcCipher::new(cipher_key)?,
            tweak_enc: AesBlock::new(tweak_key)?,
        })
    }

    fn sector_key(&self, byte_offset: u64) -> [u8; 32] {
        let mut sk = [0u8; 32];
        let mut first = offset_block(byte_offset, None);
        self.tweak_enc.encrypt_block(&mut first);
        sk[0..16].copy_from_slice(&first);
        let mut second = offset_block(byte_offset, Some(0x80));
        self.tweak_enc.encrypt_block(&mut second);
        sk[16..32].copy_from_slice(&second);
        sk
    }

    pub fn decrypt_sector(&self, byte_offset: u64, buf: &mut [u8]) {
        self.cbc.decrypt_sector(byte_offset, buf);
        diffuser::diffuser_b_decrypt(buf);
        diffuser::diffuser_a_decrypt(buf);
        let sk = self.sector_key(byte_offset);
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= sk[i % 32];
        }
    }

    pub fn encrypt_sector(&self, byte_offset: u64, buf: &mut [u8]) {
        let sk = self.sector_key(byte_offset);
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= sk[i % 32];
        }
        diffuser::diffuser_a_encrypt(buf);
        diffuser::diffuser_b_encrypt(buf);
        self.cbc.encrypt_sector(byte_offset, buf);
    }
}

/// AES-XTS, the only mode used by Windows 10+.
pub enum XtsCipher {
    Aes128(Xts128<Aes128>),
    Aes256(Xts128<Aes256>),
}

impl XtsCipher {
    pub fn new(key1: &[u8], key2: &[u8]) -> Result<XtsCipher, CodecError> {
        if key1.len() != key2.len() {
            return Err(CodecError::KeyLength { expected: key1.len(), actual: key2.len() });
        }
        match key1.len() {
            16 => {
                let c1 = Aes128::new_from_slice(key1).map_err(|_| CodecError::KeyLength { expected: 16, actual: key1.len() })?;
                let c2 = Aes128::new_from_slice(key2).map_err(|_| CodecError::KeyLength { expected: 16, actual: key2.len() })?;
                Ok(XtsCipher::Aes128(Xts128::new(c1, c2)))
            }
            32 => {
                let c1 = Aes256::new_from_slice(key1).map_err(|_| CodecError::KeyLength { expected: 32, actual: key1.len() })?;
                let c2 = Aes256::new_from_slice(key2).map_err(|_| CodecError::KeyLength { expected: 32, actual: key2.len() })?;
                Ok(XtsCipher::Aes256(Xts128::new(c1, c2)))
            }
            other => Err(CodecError::KeyLength { expected: 32, actual: other }),
        }
    }

    fn tweak(sector_index: u64) -> [u8; 16] {
        let mut tweak = [0u8; 16];
        tweak[0..8].copy_from_slice(&sector_index.to_le_bytes());
        tweak
    }

    pub fn decrypt_sector(&self, sector_index: u64, buf: &mut [u8]) {
        let tweak = Self::tweak(sector_index);
        let get_tweak = |_: u128| tweak;
        match self {
            XtsCipher::Aes128(c) => c.decrypt_area(buf, 16, 0, get_tweak),
            XtsCipher::Aes256(c) => c.decrypt_area(buf, 16, 0, get_tweak),
        }
    }

    pub fn encrypt_sector(&self, sector_index: u64, buf: &mut [u8]) {
        let tweak = Self::tweak(sector_index);
        let get_tweak = |_: u128| tweak;
        match self {
            XtsCipher::Aes128(c) => c.encrypt_area(buf, 16, 0, get_tweak),
            XtsCipher::Aes256(c) => c.encrypt_area(buf, 16, 0, get_tweak),
        }
    }
}

/// The FVEK-keyed sector codec selected once at open time.
pub enum SectorCipher {
    Cbc(CbcCipher),
    CbcDiffuser(CbcDiffuserCipher),
    Xts(XtsCipher),
}

impl SectorCipher {
    /// `algorithm` is the dataset's algorithm code; `fvek` is the raw
    /// 64-byte (or shorter, for non-diffuser CBC) key record payload.
    pub fn new(algorithm: u16, fvek: &[u8]) -> Result<SectorCipher, CodecError> {
        match algorithm {
            ALG_AES128_CBC_DIFFUSER => Ok(SectorCipher::CbcDiffuser(CbcDiffuserCipher::new(&fvek[0..16], &fvek[32..48])?)),
            ALG_AES256_CBC_DIFFUSER => Ok(SectorCipher::CbcDiffuser(CbcDiffuserCipher::new(&fvek[0..32], &fvek[32..64])?)),
            ALG_AES128_CBC => Ok(SectorCipher::Cbc(CbcCipher::new(&fvek[0..16])?)),
            ALG_AES256_CBC => Ok(SectorCipher::Cbc(CbcCipher::new(&fvek[0..32])?)),
            ALG_AES128_XTS => Ok(SectorCipher::Xts(XtsCipher::new(&fvek[0..16], &fvek[16..32])?)),
            ALG_AES256_XTS => Ok(SectorCipher::Xts(XtsCipher::new(&fvek[0..32], &fvek[32..64])?)),
            other => Err(CodecError::UnsupportedAlgorithm(other)),
        }
    }

    pub fn decrypt_sector(&self, sector_index: u64, sector_size: usize, buf: &mut [u8]) {
        let byte_offset = sector_index * sector_size as u64;
        match self {
            SectorCipher::Cbc(c) => c.decrypt_sector(byte_offset, buf),
            SectorCipher::CbcDiffuser(c) => c.decrypt_sector(byte_offset, buf),
            SectorCipher::Xts(c) => c.decrypt_sector(sector_index, buf),
        }
    }

    pub fn encrypt_sector(&self, sector_index: u64, sector_size: usize, buf: &mut [u8]) {
        let byte_offset = sector_index * sector_size as u64;
        match self {
            SectorCipher::Cbc(c) => c.encrypt_sector(byte_offset, buf),
            SectorCipher::CbcDiffuser(c) => c.encrypt_sector(byte_offset, buf),
            SectorCipher::Xts(c) => c.encrypt_sector(sector_index, buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_round_trips() {
        let cipher = CbcCipher::new(&[0x22u8; 16]).unwrap();
        let mut buf = vec![0x55u8; 512];
        let original = buf.clone();
        cipher.encrypt_sector(4096, &mut buf);
        assert_ne!(buf, original);
        cipher.decrypt_sector(4096, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn cbc_diffuser_round_trips() {
        let cipher = CbcDiffuserCipher::new(&[0x11u8; 16], &[0x22u8; 16]).unwrap();
        let mut buf: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
        let original = buf.clone();
        cipher.encrypt_sector(0, &mut buf);
        assert_ne!(buf, original);
        cipher.decrypt_sector(0, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn xts_round_trips() {
        let cipher = XtsCipher::new(&[0x01u8; 32], &[0x02u8; 32]).unwrap();
        let mut buf = vec![0xabu8; 512];
        let original = buf.clone();
        cipher.encrypt_sector(7, &mut buf);
        assert_ne!(buf, original);
        cipher.decrypt_sector(7, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn sector_cipher_dispatches_on_algorithm() {
        let fvek = vec![0x33u8; 64];
        let sc = SectorCipher::new(ALG_AES128_XTS, &fvek).unwrap();
        let mut buf = vec![0x10u8; 512];
        let original = buf.clone();
        sc.encrypt_sector(1, 512, &mut buf);
        sc.decrypt_sector(1, 512, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn rejects_unsupported_algorithm() {
        let fvek = vec![0u8; 64];
        assert!(matches!(SectorCipher::new(0x1234, &fvek), Err(CodecError::UnsupportedAlgorithm(0x1234))));
    }
}
