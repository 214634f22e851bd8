//! AES-256-CBC + PBKDF2 encrypted framing (spec §4.3).
//!
//! Wire format: magic `5A 49 4D 45` ("ZIME"), 16-byte salt, 16-byte IV,
//! then AES-256-CBC/PKCS7 ciphertext. The key is derived with
//! PBKDF2-HMAC-SHA256, 100,000 iterations, 32-byte output. The same
//! passphrase must be used for every chunk in a run.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{CryptoError, CryptoResult};

/// Magic bytes identifying an encrypted chunk.
pub const MAGIC: [u8; 4] = *b"ZIME";
const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_LEN: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Derive a 32-byte AES-256 key from a passphrase and salt.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt `plaintext` with `passphrase`, producing a self-contained
/// framed blob: magic + salt + iv + ciphertext.
pub fn encrypt(passphrase: &str, plaintext: &[u8]) -> Vec<u8> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt);
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(MAGIC.len() + SALT_LEN + IV_LEN + ciphertext.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt a framed blob produced by [`encrypt`].
pub fn decrypt(passphrase: &str, framed: &[u8]) -> CryptoResult<Vec<u8>> {
    let header_len = MAGIC.len() + SALT_LEN + IV_LEN;
    if framed.len() < header_len {
        return Err(CryptoError::ShortHeader);
    }
    if framed[..MAGIC.len()] != MAGIC {
        return Err(CryptoError::InvalidMagic);
    }

    let salt = &framed[MAGIC.len()..MAGIC.len() + SALT_LEN];
    let iv = &framed[MAGIC.len() + SALT_LEN..header_len];
    let ciphertext = &framed[header_len..];

    let key = derive_key(passphrase, salt);
    let iv: [u8; IV_LEN] = iv.try_into().expect("iv slice is IV_LEN bytes");

    Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::BadPadding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_starts_with_zime_magic() {
        let blob = encrypt("pw", b"hello");
        assert_eq!(&blob[0..4], &MAGIC);
        assert_eq!(blob.len(), 4 + 16 + 16 + blob[36..].len());
    }

    #[test]
    fn s6_encrypt_round_trip() {
        let blob = encrypt("pw", b"hello");
        let plaintext = decrypt("pw", &blob).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn s6_wrong_passphrase_fails() {
        let blob = encrypt("pw", b"hello");
        let result = decrypt("not-pw", &blob);
        assert!(result.is_err());
    }

    #[test]
    fn short_input_is_rejected() {
        let result = decrypt("pw", b"too short");
        assert!(matches!(result, Err(CryptoError::ShortHeader)));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut blob = encrypt("pw", b"hello");
        blob[0] = 0;
        assert!(matches!(decrypt("pw", &blob), Err(CryptoError::InvalidMagic)));
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let blob = encrypt("pw", b"");
        assert_eq!(decrypt("pw", &blob).unwrap(), b"");
    }
}
