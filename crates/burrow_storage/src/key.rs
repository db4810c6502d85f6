//! Encryption key material.

use zeroize::Zeroize;

/// Size of a raw encryption key in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// A raw 256-bit encryption key for a data file.
///
/// The key bytes are zeroized on drop. Whether a key can actually be used
/// depends on the build: without the `encryption` feature, engines reject
/// any key with [`crate::StorageError::EncryptionNotSupported`].
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Creates a key from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("EncryptionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_key_material() {
        let key = EncryptionKey::from_bytes([0xab; KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "EncryptionKey(..)");
    }
}
