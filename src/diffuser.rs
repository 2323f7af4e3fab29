//! The Elephant diffuser: two word-granular mixing passes applied around
//! AES-CBC on Vista/Windows-7-era volumes to spread single-bit changes
//! across an entire sector.

use byteorder::{ByteOrder, LittleEndian};

const RA: [u32; 4] = [9, 0, 13, 0];
const RB: [u32; 4] = [0, 10, 0, 25];
const A_PASSES: usize = 5;
const B_PASSES: usize = 3;

fn euclid_mod(i: isize, n: usize) -> usize {
    let n = n as isize;
    (((i % n) + n) % n) as usize
}

fn load_words(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(4).map(LittleEndian::read_u32).collect()
}

fn store_words(words: &[u32], buf: &mut [u8]) {
    for (chunk, w) in buf.chunks_exact_mut(4).zip(words) {
        LittleEndian::write_u32(chunk, *w);
    }
}

/// In-place forward (encrypt-direction) pass of diffuser A.
pub fn diffuser_a_encrypt(buf: &mut [u8]) {
    let mut d = load_words(buf);
    let n = d.len();
    for _ in 0..A_PASSES {
        for i in (0..n).rev() {
            let a = d[euclid_mod(i as isize - 2, n)];
            let b = d[euclid_mod(i as isize - 5, n)].rotate_left(RA[i % 4]);
            d[i] = d[i].wrapping_sub(a ^ b);
        }
    }
    store_words(&d, buf);
}

/// In-place inverse (decrypt-direction) pass of diffuser A.
pub fn diffuser_a_decrypt(buf: &mut [u8]) {
    let mut d = load_words(buf);
    let n = d.len();
    for _ in 0..A_PASSES {
        for i in 0..n {
            let a = d[euclid_mod(i as isize - 2, n)];
            let b = d[euclid_mod(i as isize - 5, n)].rotate_left(RA[i % 4]);
            d[i] = d[i].wrapping_add(a ^ b);
        }
    }
    store_words(&d, buf);
}

/// In-place forward (encrypt-direction) pass of diffuser B.
pub fn diffuser_b_encrypt(buf: &mut [u8]) {
    let mut d = load_words(buf);
    let n = d.len();
    for _ in 0..B_PASSES {
        for i in (0..n).rev() {
            let a = d[euclid_mod(i as isize + 2, n)];
            let b = d[euclid_mod(i as isize + 5, n)].rotate_left(RB[i % 4]);
            d[i] = d[i].wrapping_sub(a ^ b);
        }
    }
    store_words(&d, buf);
}

/// In-place inverse (decrypt-direction) pass of diffuser B.
pub fn diffuser_b_decrypt(buf: &mut [u8]) {
    let mut d = load_words(buf);
    let n = d.len();
    for _ in 0..B_PASSES {
        for i in 0..n {
            let a = d[euclid_mod(i as isize + 2, n)];
            let b = d[euclid_mod(i as isize + 5, n)].rotate_left(RB[i % 4]);
            d[i] = d[i].wrapping_add(a ^ b);
        }
    }
    store_words(&d, buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diffuser_a_round_trips() {
        let mut buf: Vec<u8> = (0..512u32).map(|i| (i % 256) as u8).collect();
        let original = buf.clone();
        diffuser_a_encrypt(&mut buf);
        assert_ne!(buf, original);
        diffuser_a_decrypt(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn diffuser_b_round_trips() {
        let mut buf = vec![0xabu8; 512];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = *b ^ (i as u8);
        }
        let original = buf.clone();
        diffuser_b_encrypt(&mut buf);
        assert_ne!(buf, original);
        diffuser_b_decrypt(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn combined_diffuser_round_trips_like_decrypt_path() {
        let mut buf: Vec<u8> = (0..512u32).map(|i| ((i * 7) % 256) as u8).collect();
        let original = buf.clone();

        // decrypt path applies B^-1 then A^-1
        diffuser_b_decrypt(&mut buf);
        diffuser_a_decrypt(&mut buf);

        // encrypt path must invert exactly in reverse order
        diffuser_a_encrypt(&mut buf);
        diffuser_b_encrypt(&mut buf);

        assert_eq!(buf, original);
    }

    #[test]
    fn zero_buffer_is_a_fixed_point() {
        let mut buf = vec![0u8; 512];
        diffuser_a_decrypt(&mut buf);
        diffuser_b_decrypt(&mut buf);
        assert_eq!(buf, vec![0u8; 512]);
    }

    #[test]
    fn diffuser_a_matches_known_vector() {
        use sha2::{Digest, Sha256};
        let mut buf: Vec<u8> = (0..512u32).map(|i| (i % 256) as u8).collect();
        diffuser_a_encrypt(&mut buf);
        let digest = Sha256::digest(&buf);
        let expected =
            hex::decode("b719507d74076ba8a9450e0df55d561189de58652b5e289cdf5d51b4f6b7c021")
                .unwrap();
        assert_eq!(digest.to_vec(), expected);
    }

    #[test]
    fn diffuser_b_matches_known_vector() {
        use sha2::{Digest, Sha256};
        let mut buf: Vec<u8> = (0..512u32).map(|i| (i % 256) as u8).collect();
        diffuser_b_encrypt(&mut buf);
        let digest = Sha256::digest(&buf);
        let expected =
            hex::decode("9277a3790ae69449b25ecc5c48d7a99e6d331cb0215230dc4570291b067ddd5e")
                .unwrap();
        assert_eq!(digest.to_vec(), expected);
    }
}
