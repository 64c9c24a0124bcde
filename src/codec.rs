//! Encodes and decodes the queue's on-disk blob.
//!
//! Layout: 12-byte random nonce ∥ AES-256-GCM ciphertext ∥ 16-byte auth tag.
//! The plaintext is the JSON-serialized queue snapshot.

use crate::error::{PipelineError, PipelineResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::Rng;

const NONCE_LEN: usize = 12;

/// Encrypts `plaintext` under `key` (must be 32 bytes), producing
/// `nonce ∥ ciphertext ∥ tag`.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> PipelineResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| PipelineError::encryption(format!("invalid key length: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| PipelineError::encryption(format!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a blob produced by [`encrypt`].
pub fn decrypt(key: &[u8], blob: &[u8]) -> PipelineResult<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(PipelineError::encryption("blob too short to contain a nonce"));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| PipelineError::encryption(format!("invalid key length: {e}")))?;
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| PipelineError::encryption(format!("decryption failed (wrong key or corrupted data): {e}")))
}
