//! AES-256-GCM payload encryption for data files.
//!
//! Ciphertext layout: 12-byte random nonce followed by the GCM ciphertext
//! (which includes the authentication tag). A fresh nonce is drawn per
//! encryption.

use crate::error::{StorageError, StorageResult};
use crate::key::EncryptionKey;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

const NONCE_SIZE: usize = 12;

fn cipher(key: &EncryptionKey) -> StorageResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| StorageError::EncryptionFailed {
        message: "invalid key length".into(),
    })
}

/// Encrypts a payload, prepending the nonce.
pub(crate) fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
    let cipher = cipher(key)?;
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| StorageError::EncryptionFailed {
            message: "encryption failed".into(),
        })?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a payload produced by [`encrypt`].
pub(crate) fn decrypt(key: &EncryptionKey, data: &[u8]) -> StorageResult<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        return Err(StorageError::EncryptionFailed {
            message: "ciphertext too short".into(),
        });
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = cipher(key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| StorageError::EncryptionFailed {
            message: "decryption failed (wrong key or corrupt data)".into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KEY_SIZE;

    #[test]
    fn round_trip() {
        let key = EncryptionKey::from_bytes([7; KEY_SIZE]);
        let ciphertext = encrypt(&key, b"secret payload").unwrap();
        assert_ne!(&ciphertext[NONCE_SIZE..], b"secret payload");
        assert_eq!(decrypt(&key, &ciphertext).unwrap(), b"secret payload");
    }

    #[test]
    fn wrong_key_fails() {
        let key = EncryptionKey::from_bytes([7; KEY_SIZE]);
        let other = EncryptionKey::from_bytes([8; KEY_SIZE]);
        let ciphertext = encrypt(&key, b"secret").unwrap();
        assert!(matches!(
            decrypt(&other, &ciphertext),
            Err(StorageError::EncryptionFailed { .. })
        ));
    }

    #[test]
    fn nonces_are_unique() {
        let key = EncryptionKey::from_bytes([7; KEY_SIZE]);
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }
}
