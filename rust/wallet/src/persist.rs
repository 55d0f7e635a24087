//! Snapshot persistence for the note store, history ledger and state sync.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::ClientError;

const VAULT_AAD: &[u8] = b"zylith-note-vault-v1";
const VAULT_VERSION: u32 = 1;

pub trait Persistence<T>: Send + Sync {
    /// `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<T>, ClientError>;
    fn save(&self, value: &T) -> Result<(), ClientError>;
}

impl<T, P: Persistence<T> + ?Sized> Persistence<T> for Arc<P> {
    fn load(&self) -> Result<Option<T>, ClientError> {
        (**self).load()
    }

    fn save(&self, value: &T) -> Result<(), ClientError> {
        (**self).save(value)
    }
}

#[derive(Debug)]
pub struct MemoryStore<T> {
    value: Mutex<Option<T>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    pub fn with_value(value: T) -> Self {
        Self {
            value: Mutex::new(Some(value)),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> Persistence<T> for MemoryStore<T> {
    fn load(&self) -> Result<Option<T>, ClientError> {
        let guard = self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.clone())
    }

    fn save(&self, value: &T) -> Result<(), ClientError> {
        let mut guard = self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(value.clone());
        Ok(())
    }
}

/// Plain JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: Serialize + DeserializeOwned> Persistence<T> for JsonFileStore {
    fn load(&self) -> Result<Option<T>, ClientError> {
        match read_optional(&self.path)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, value: &T) -> Result<(), ClientError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        write_atomic(&self.path, &bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct VaultFile {
    version: u32,
    nonce: String,
    ciphertext: String,
}

/// Encrypted snapshot file. The plaintext JSON never touches disk.
pub struct NoteVault {
    path: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

impl NoteVault {
    pub fn new(path: impl Into<PathBuf>, key: [u8; 32]) -> Self {
        Self {
            path: path.into(),
            key: Zeroizing::new(key),
        }
    }

    pub fn from_hex_key(path: impl Into<PathBuf>, key_hex: &str) -> Result<Self, ClientError> {
        let decoded = Zeroizing::new(
            hex::decode(key_hex.trim().trim_start_matches("0x"))
                .map_err(|_| ClientError::Crypto("vault key is not hex".to_string()))?,
        );
        let key: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::Crypto("vault key must be 32 bytes".to_string()))?;
        Ok(Self::new(path, key))
    }

    pub fn from_env(path: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let key = Zeroizing::new(
            std::env::var("ZYLITH_VAULT_KEY")
                .map_err(|_| ClientError::Crypto("ZYLITH_VAULT_KEY is not set".to_string()))?,
        );
        Self::from_hex_key(path, &key)
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, ClientError> {
        XChaCha20Poly1305::new_from_slice(self.key.as_slice())
            .map_err(|_| ClientError::Crypto("invalid vault key".to_string()))
    }
}

impl<T: Serialize + DeserializeOwned> Persistence<T> for NoteVault {
    fn load(&self) -> Result<Option<T>, ClientError> {
        let Some(bytes) = read_optional(&self.path)? else {
            return Ok(None);
        };
        let file: VaultFile = serde_json::from_slice(&bytes)?;
        if file.version != VAULT_VERSION {
            return Err(ClientError::Persistence(format!(
                "unsupported vault version {}",
                file.version
            )));
        }
        let nonce = hex::decode(&file.nonce)
            .map_err(|_| ClientError::Crypto("vault nonce is not hex".to_string()))?;
        if nonce.len() != 24 {
            return Err(ClientError::Crypto("vault nonce must be 24 bytes".to_string()));
        }
        let ciphertext = hex::decode(&file.ciphertext)
            .map_err(|_| ClientError::Crypto("vault ciphertext is not hex".to_string()))?;
        let plaintext = self
            .cipher()?
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: VAULT_AAD,
                },
            )
            .map_err(|_| ClientError::Crypto("vault decryption failed".to_string()))?;
        let plaintext = Zeroizing::new(plaintext);
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    fn save(&self, value: &T) -> Result<(), ClientError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: VAULT_AAD,
                },
            )
            .map_err(|_| ClientError::Crypto("vault encryption failed".to_string()))?;
        let file = VaultFile {
            version: VAULT_VERSION,
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        };
        write_atomic(&self.path, &serde_json::to_vec(&file)?)
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, ClientError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ClientError::Persistence(format!(
            "read {}: {err}",
            path.display()
        ))),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ClientError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .map_err(|err| ClientError::Persistence(format!("write {}: {err}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|err| ClientError::Persistence(format!("rename {}: {err}", path.display())))?;
    debug!(path = %path.display(), bytes = bytes.len(), "snapshot saved");
    Ok(())
}
