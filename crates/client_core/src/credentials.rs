use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::error::CredentialStoreError;

const CREDENTIALS_FILE_NAME: &str = "credentials.json";
const CREDENTIALS_DIR_NAME: &str = "chat-client";

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.access_token.zeroize();
        self.refresh_token.zeroize();
    }
}

/// Where the credential pair lives between process restarts. Both tokens
/// are always written and removed together.
pub trait CredentialPersistence: Send + Sync {
    fn read(&self) -> Result<Option<Credential>, CredentialStoreError>;
    fn write(&self, credential: &Credential) -> Result<(), CredentialStoreError>;
    fn remove(&self) -> Result<(), CredentialStoreError>;
}

#[derive(Default)]
pub struct MemoryPersistence {
    slot: Mutex<Option<Credential>>,
}

impl CredentialPersistence for MemoryPersistence {
    fn read(&self) -> Result<Option<Credential>, CredentialStoreError> {
        Ok(self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn write(&self, credential: &Credential) -> Result<(), CredentialStoreError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(credential.clone());
        Ok(())
    }

    fn remove(&self) -> Result<(), CredentialStoreError> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedTokens {
    token: String,
    refresh_token: String,
}

/// JSON file holding the `token` / `refresh_token` pair.
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| {
            dir.join(CREDENTIALS_DIR_NAME)
                .join(CREDENTIALS_FILE_NAME)
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CredentialStoreError {
        CredentialStoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl CredentialPersistence for FilePersistence {
    fn read(&self) -> Result<Option<Credential>, CredentialStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };
        let tokens: PersistedTokens =
            serde_json::from_str(&raw).map_err(|source| CredentialStoreError::Corrupt {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(Some(Credential::new(tokens.token, tokens.refresh_token)))
    }

    fn write(&self, credential: &Credential) -> Result<(), CredentialStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        let raw = serde_json::to_string(&PersistedTokens {
            token: credential.access_token.clone(),
            refresh_token: credential.refresh_token.clone(),
        })
        .map_err(|source| CredentialStoreError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;
        // Staged write; the pair is replaced on disk in one rename.
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, raw).map_err(|err| self.io_error(err))?;
        fs::rename(&staging, &self.path).map_err(|err| self.io_error(err))
    }

    fn remove(&self) -> Result<(), CredentialStoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }
}

/// Holds the current credential pair. Readers take a cloned snapshot and
/// every write reaches the persistence backend before it is visible.
pub struct CredentialStore {
    current: RwLock<Option<Credential>>,
    persistence: Arc<dyn CredentialPersistence>,
}

impl CredentialStore {
    pub fn new(persistence: Arc<dyn CredentialPersistence>) -> Self {
        Self {
            current: RwLock::new(None),
            persistence,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPersistence::default()))
    }

    /// Restores a persisted pair into memory, if one exists.
    pub fn load(&self) -> Result<Option<Credential>, CredentialStoreError> {
        let restored = self.persistence.read()?;
        if restored.is_some() {
            debug!("credential store: restored persisted credential");
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = restored.clone();
        Ok(restored)
    }

    pub fn get(&self) -> Option<Credential> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|credential| credential.access_token.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn set(&self, credential: Credential) -> Result<(), CredentialStoreError> {
        let persisted = self.persistence.write(&credential);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
        persisted
    }

    /// Drops both tokens. Memory is always cleared even if the backend fails.
    pub fn clear(&self) {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Err(err) = self.persistence.remove() {
            warn!(error = %err, "credential store: failed to remove persisted credential");
        }
    }
}
