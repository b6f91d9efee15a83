//! At-rest encryption of feature vectors (AES-256-GCM).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("store key must not be empty")]
    EmptyKey,
    #[error("failed to encrypt feature vector")]
    Encrypt,
    #[error("failed to decrypt feature vector (wrong store key?)")]
    Decrypt,
    #[error("expected nonce of {NONCE_LEN} bytes, found {0}")]
    NonceLength(usize),
}

/// Encrypts embedding payloads with a key derived from an operator passphrase.
#[derive(Clone)]
pub struct EmbeddingCipher {
    cipher: Aes256Gcm,
}

impl EmbeddingCipher {
    /// Derive the AES key as SHA-256 of the passphrase.
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CipherError> {
        if passphrase.is_empty() {
            return Err(CipherError::EmptyKey);
        }
        let key = Sha256::digest(passphrase.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CipherError::EmptyKey)?;
        Ok(Self { cipher })
    }

    /// Returns `(nonce, ciphertext)`; a fresh random nonce per call.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Encrypt)?;
        Ok((nonce.to_vec(), ciphertext))
    }

    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if nonce.len() != NONCE_LEN {
            return Err(CipherError::NonceLength(nonce.len()));
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decrypt)
    }
}
