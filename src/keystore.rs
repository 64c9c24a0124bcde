//! OS-keychain-backed symmetric key storage for queue-at-rest encryption.
//!
//! The key is generated once on first use and stored device-scoped in the
//! platform credential store; it never leaves the device and is never
//! included in telemetry payloads or logs.

use crate::error::{PipelineError, PipelineResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use keyring::Entry;
use rand::Rng;
use zeroize::Zeroizing;

const SERVICE: &str = "analytics-pipeline";
const USER: &str = "queue-encryption-key";
const KEY_LEN: usize = 32;

/// Abstraction over the credential store so the pipeline can be tested
/// without touching the real OS keychain.
pub trait KeyStore: Send + Sync {
    fn get_or_create_key(&self) -> PipelineResult<Zeroizing<Vec<u8>>>;
}

/// Default key store backed by the OS keychain via the `keyring` crate.
pub struct OsKeyStore;

impl KeyStore for OsKeyStore {
    fn get_or_create_key(&self) -> PipelineResult<Zeroizing<Vec<u8>>> {
        let entry = Entry::new(SERVICE, USER)
            .map_err(|e| PipelineError::keystore(format!("failed to open keyring entry: {e}")))?;

        match entry.get_password() {
            Ok(encoded) => {
                let bytes = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| PipelineError::keystore(format!("stored key is not valid base64: {e}")))?;
                if bytes.len() != KEY_LEN {
                    return Err(PipelineError::keystore("stored key has unexpected length"));
                }
                Ok(Zeroizing::new(bytes))
            }
            Err(keyring::Error::NoEntry) => {
                let mut key = vec![0u8; KEY_LEN];
                rand::rng().fill_bytes(&mut key);
                let encoded = BASE64.encode(&key);
                entry
                    .set_password(&encoded)
                    .map_err(|e| PipelineError::keystore(format!("failed to store new key: {e}")))?;
                Ok(Zeroizing::new(key))
            }
            Err(e) => Err(PipelineError::keystore(format!("keyring access failed: {e}"))),
        }
    }
}

/// In-memory key store for tests and environments without a usable keychain.
#[derive(Default)]
pub struct InMemoryKeyStore {
    key: parking_lot::Mutex<Option<Vec<u8>>>,
}

impl KeyStore for InMemoryKeyStore {
    fn get_or_create_key(&self) -> PipelineResult<Zeroizing<Vec<u8>>> {
        let mut guard = self.key.lock();
        if let Some(existing) = guard.as_ref() {
            return Ok(Zeroizing::new(existing.clone()));
        }
        let mut key = vec![0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        *guard = Some(key.clone());
        Ok(Zeroizing::new(key))
    }
}
