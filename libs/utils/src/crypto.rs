//! AES buffer encryption used by the management envelope.
//!
//! The key length (16/24/32 bytes) selects AES-128/192/256. CBC output is
//! PKCS#7 padded. The 16-byte IV is generated per call and prepended to the
//! ciphertext, and stripped again on decrypt.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use rand::RngCore;

pub const AES_IV_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AesMode {
    Cbc,
    Ctr,
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("unsupported AES key length {0}, expected 16, 24 or 32 bytes")]
    BadKeyLength(usize),
    #[error("ciphertext shorter than the {AES_IV_LEN}-byte IV")]
    ShortCiphertext,
    #[error("bad padding in ciphertext")]
    BadPadding,
}

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Encrypt `data`, returning `IV || ciphertext`.
pub fn encrypt(data: &[u8], key: &[u8], mode: AesMode) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; AES_IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    // The key length is validated right here, so the slice constructors
    // cannot fail below.
    if !matches!(key.len(), 16 | 24 | 32) {
        return Err(CryptoError::BadKeyLength(key.len()));
    }
    let ct = match (mode, key.len()) {
        (AesMode::Cbc, 16) => Aes128CbcEnc::new_from_slices(key, &iv)
            .expect("key length checked")
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        (AesMode::Cbc, 24) => Aes192CbcEnc::new_from_slices(key, &iv)
            .expect("key length checked")
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        (AesMode::Cbc, _) => Aes256CbcEnc::new_from_slices(key, &iv)
            .expect("key length checked")
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        (AesMode::Ctr, len) => {
            let mut buf = data.to_vec();
            match len {
                16 => Aes128Ctr::new_from_slices(key, &iv)
                    .expect("key length checked")
                    .apply_keystream(&mut buf),
                24 => Aes192Ctr::new_from_slices(key, &iv)
                    .expect("key length checked")
                    .apply_keystream(&mut buf),
                _ => Aes256Ctr::new_from_slices(key, &iv)
                    .expect("key length checked")
                    .apply_keystream(&mut buf),
            }
            buf
        }
    };

    let mut out = Vec::with_capacity(AES_IV_LEN + ct.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt `IV || ciphertext` produced by [`encrypt`].
pub fn decrypt(data: &[u8], key: &[u8], mode: AesMode) -> Result<Vec<u8>, CryptoError> {
    if data.len() < AES_IV_LEN {
        return Err(CryptoError::ShortCiphertext);
    }
    let (iv, ct) = data.split_at(AES_IV_LEN);

    if !matches!(key.len(), 16 | 24 | 32) {
        return Err(CryptoError::BadKeyLength(key.len()));
    }
    match (mode, key.len()) {
        (AesMode::Cbc, 16) => Aes128CbcDec::new_from_slices(key, iv)
            .expect("key length checked")
            .decrypt_padded_vec_mut::<Pkcs7>(ct)
            .map_err(|_| CryptoError::BadPadding),
        (AesMode::Cbc, 24) => Aes192CbcDec::new_from_slices(key, iv)
            .expect("key length checked")
            .decrypt_padded_vec_mut::<Pkcs7>(ct)
            .map_err(|_| CryptoError::BadPadding),
        (AesMode::Cbc, _) => Aes256CbcDec::new_from_slices(key, iv)
            .expect("key length checked")
            .decrypt_padded_vec_mut::<Pkcs7>(ct)
            .map_err(|_| CryptoError::BadPadding),
        (AesMode::Ctr, len) => {
            let mut buf = ct.to_vec();
            match len {
                16 => Aes128Ctr::new_from_slices(key, iv)
                    .expect("key length checked")
                    .apply_keystream(&mut buf),
                24 => Aes192Ctr::new_from_slices(key, iv)
                    .expect("key length checked")
                    .apply_keystream(&mut buf),
                _ => Aes256Ctr::new_from_slices(key, iv)
                    .expect("key length checked")
                    .apply_keystream(&mut buf),
            }
            Ok(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_variants() {
        let data = b"some bytes that are not block aligned";
        for mode in [AesMode::Cbc, AesMode::Ctr] {
            for key_len in [16usize, 24, 32] {
                let key = vec![0xA5u8; key_len];
                let enc = encrypt(data, &key, mode).unwrap();
                assert_ne!(&enc[AES_IV_LEN..], data.as_slice());
                let dec = decrypt(&enc, &key, mode).unwrap();
                assert_eq!(dec, data);
            }
        }
    }

    #[test]
    fn iv_is_randomized() {
        let key = [7u8; 16];
        let a = encrypt(b"payload", &key, AesMode::Cbc).unwrap();
        let b = encrypt(b"payload", &key, AesMode::Cbc).unwrap();
        assert_ne!(a[..AES_IV_LEN], b[..AES_IV_LEN]);
    }

    #[test]
    fn rejects_bad_key() {
        assert!(matches!(
            encrypt(b"x", &[0u8; 10], AesMode::Cbc),
            Err(CryptoError::BadKeyLength(10))
        ));
        assert!(matches!(
            decrypt(&[0u8; 8], &[0u8; 16], AesMode::Cbc),
            Err(CryptoError::ShortCiphertext)
        ));
    }
}
