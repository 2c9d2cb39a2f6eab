//! Envelope payload encryption.
//!
//! The relay only ever sees ciphertext. Key distribution is the host
//! application's concern: a [`PayloadCipher`] is handed a key and nothing
//! else.

use crate::error::{ReplicaError, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use concord_engine::OperationId;

/// Nonce size for AES-256-GCM (12 bytes / 96 bits).
const NONCE_SIZE: usize = 12;

/// Seals and opens envelope payloads.
///
/// The operation id is bound as associated data so a payload cannot be
/// replayed under another envelope's id.
pub trait PayloadCipher: Send + Sync {
    fn seal(&self, op_id: &OperationId, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn open(&self, op_id: &OperationId, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM with a random nonce prefixed to the ciphertext.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Build from a key of unchecked length.
    pub fn from_slice(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| ReplicaError::Crypto(format!("key must be 32 bytes, got {}", key.len())))?;
        Ok(Self { cipher })
    }

    /// A fresh random key.
    pub fn generate_key() -> [u8; 32] {
        Aes256Gcm::generate_key(&mut OsRng).into()
    }
}

impl PayloadCipher for AesGcmCipher {
    fn seal(&self, op_id: &OperationId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let aad = op_id.to_bytes();
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| ReplicaError::Crypto(format!("seal failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, op_id: &OperationId, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(ReplicaError::Crypto("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let aad = op_id.to_bytes();

        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|e| ReplicaError::Crypto(format!("open failed for {op_id}: {e}")))
    }
}
