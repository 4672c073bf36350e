use aes_gcm::{
    aead::{AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use aes_gcm::aead::rand_core::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};
use crate::error::{AppError, Result};

/// The size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// The size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// The size of the AES-GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A secure key wrapper that ensures the key is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecureKey([u8; KEY_SIZE]);

impl SecureKey {
    /// Expands a passphrase of any length into an AES-256 key.
    ///
    /// The passphrase is hashed with SHA-256 and never used as key material directly.
    ///
    /// # Arguments
    ///
    /// * `passphrase` - The operator-supplied secret.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(digest.as_slice());
        digest.as_mut_slice().zeroize();
        Self(key)
    }

    /// Returns a reference to the key as a byte slice.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Output of a detached AES-GCM encryption.
#[derive(Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
}

/// Generates a new random AES-GCM nonce.
///
/// # Returns
///
/// A 12-byte array representing the nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypts a plaintext using AES-256-GCM under a fresh random nonce.
///
/// # Arguments
///
/// * `key` - The AES-256 key.
/// * `plaintext` - The data to encrypt.
///
/// # Returns
///
/// The ciphertext together with its nonce and detached authentication tag.
pub fn encrypt(key: &SecureKey, plaintext: &[u8]) -> Result<Sealed> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let nonce_bytes = generate_nonce();
    let mut buffer = plaintext.to_vec();

    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), b"", &mut buffer)
        .map_err(|e| AppError::Encryption(format!("Encryption failed: {}", e)))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(Sealed {
        ciphertext: buffer,
        nonce: nonce_bytes,
        tag: tag_bytes,
    })
}

/// Decrypts and authenticates a detached AES-256-GCM ciphertext.
///
/// # Arguments
///
/// * `key` - The AES-256 key.
/// * `sealed` - The ciphertext, nonce and tag produced by [`encrypt`].
///
/// # Returns
///
/// The decrypted plaintext, zeroized on drop.
pub fn decrypt(key: &SecureKey, sealed: &Sealed) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let mut buffer = Zeroizing::new(sealed.ciphertext.clone());

    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            b"",
            buffer.as_mut_slice(),
            Tag::from_slice(&sealed.tag),
        )
        .map_err(|e| AppError::Encryption(format!("Decryption failed: {}", e)))?;

    Ok(buffer)
}
