//! Storage for the access/refresh token pair and the logged in user.

use crate::api::User;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("failed to access credential file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode credentials: {0}")]
    Json(#[from] serde_json::Error),
}

/// Process-wide token storage consulted by the gateway.
///
/// Writers race with last-writer-wins semantics; there is no access control.
pub trait CredentialStore: Send + Sync {
    /// Returns the current access token, if any.
    fn access_token(&self) -> Option<String>;

    /// Returns the current refresh token, if any.
    fn refresh_token(&self) -> Option<String>;

    /// Replaces the access token, keeping the refresh token.
    fn set_access(&self, access_token: &str) -> Result<(), CredentialError>;

    /// Replaces both tokens.
    fn set_all(&self, access_token: &str, refresh_token: &str) -> Result<(), CredentialError>;

    /// Forgets everything.
    fn clear(&self) -> Result<(), CredentialError>;

    /// Returns the user of the current session, if the store keeps one.
    fn user(&self) -> Option<User> {
        None
    }

    /// Records the user of the current session.
    fn set_user(&self, _user: &User) -> Result<(), CredentialError> {
        Ok(())
    }
}

/// Everything persisted for a logged in session.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<User>,
}

/// A `CredentialStore` that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    session: RwLock<StoredSession>,
}

impl MemoryCredentialStore {
    pub fn new() -> MemoryCredentialStore {
        MemoryCredentialStore::default()
    }

    /// Creates a store that already holds a token pair.
    pub fn with_tokens(access_token: &str, refresh_token: &str) -> MemoryCredentialStore {
        MemoryCredentialStore {
            session: RwLock::new(StoredSession {
                access_token: Some(access_token.to_owned()),
                refresh_token: Some(refresh_token.to_owned()),
                user: None,
            }),
        }
    }

    fn read(&self) -> StoredSession {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut StoredSession)) {
        let mut session = self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut session);
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn access_token(&self) -> Option<String> {
        self.read().access_token
    }

    fn refresh_token(&self) -> Option<String> {
        self.read().refresh_token
    }

    fn set_access(&self, access_token: &str) -> Result<(), CredentialError> {
        self.update(|session| session.access_token = Some(access_token.to_owned()));
        Ok(())
    }

    fn set_all(&self, access_token: &str, refresh_token: &str) -> Result<(), CredentialError> {
        self.update(|session| {
            session.access_token = Some(access_token.to_owned());
            session.refresh_token = Some(refresh_token.to_owned());
        });
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        self.update(|session| *session = StoredSession::default());
        Ok(())
    }

    fn user(&self) -> Option<User> {
        self.read().user
    }

    fn set_user(&self, user: &User) -> Result<(), CredentialError> {
        self.update(|session| session.user = Some(user.clone()));
        Ok(())
    }
}

/// A `CredentialStore` persisted as JSON on disk so sessions survive between CLI invocations.
///
/// The file is read once on open; every write rewrites it in full.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    session: RwLock<StoredSession>,
}

impl FileCredentialStore {
    /// Opens the store at `path`. A missing file is an empty session. An unreadable or corrupt
    /// file is discarded with a warning.
    pub fn open(path: impl Into<PathBuf>) -> FileCredentialStore {
        let path = path.into();

        let session = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|err| {
                log::warn!("ignoring corrupt session file {}: {err}", path.display());
                StoredSession::default()
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => StoredSession::default(),
            Err(err) => {
                log::warn!("failed to read session file {}: {err}", path.display());
                StoredSession::default()
            }
        };

        FileCredentialStore {
            path,
            session: RwLock::new(session),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> StoredSession {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut StoredSession)) -> Result<(), CredentialError> {
        let mut session = self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut session);
        self.persist(&session)
    }

    fn persist(&self, session: &StoredSession) -> Result<(), CredentialError> {
        let io_err = |source: io::Error| CredentialError::Io {
            path: self.path.clone(),
            source,
        };

        if *session == StoredSession::default() {
            return match fs::remove_file(&self.path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(io_err(err)),
                _ => Ok(()),
            };
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let data = serde_json::to_vec_pretty(session)?;
        fs::write(&self.path, data).map_err(io_err)
    }
}

impl CredentialStore for FileCredentialStore {
    fn access_token(&self) -> Option<String> {
        self.read().access_token
    }

    fn refresh_token(&self) -> Option<String> {
        self.read().refresh_token
    }

    fn set_access(&self, access_token: &str) -> Result<(), CredentialError> {
        self.update(|session| session.access_token = Some(access_token.to_owned()))
    }

    fn set_all(&self, access_token: &str, refresh_token: &str) -> Result<(), CredentialError> {
        self.update(|session| {
            session.access_token = Some(access_token.to_owned());
            session.refresh_token = Some(refresh_token.to_owned());
        })
    }

    fn clear(&self) -> Result<(), CredentialError> {
        self.update(|session| *session = StoredSession::default())
    }

    fn user(&self) -> Option<User> {
        self.read().user
    }

    fn set_user(&self, user: &User) -> Result<(), CredentialError> {
        self.update(|session| session.user = Some(user.clone()))
    }
}
