use std::sync::Mutex;

use keyring::Entry;
use thiserror::Error;

const SERVICE_NAME: &str = "com.fitrep.sync";
const TOKEN_KEY: &str = "github_token";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("keyring error: {0}")]
    KeyringError(#[from] keyring::Error),
    #[error("token not found")]
    TokenNotFound,
    #[error("token store lock poisoned")]
    Poisoned,
}

/// Repository token kept in the platform keyring.
pub struct TokenStorage {
    backend: Backend,
}

enum Backend {
    Keyring(Entry),
    Memory(Mutex<Option<String>>),
}

impl TokenStorage {
    pub fn new() -> Result<Self, StorageError> {
        let entry = Entry::new(SERVICE_NAME, TOKEN_KEY)?;
        Ok(Self {
            backend: Backend::Keyring(entry),
        })
    }

    /// Process-local store for environments without a secret service.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(None)),
        }
    }

    pub fn save_token(&self, token: &str) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Keyring(entry) => {
                entry.set_password(token)?;
                Ok(())
            }
            Backend::Memory(slot) => {
                *slot.lock().map_err(|_| StorageError::Poisoned)? = Some(token.to_string());
                Ok(())
            }
        }
    }

    pub fn get_token(&self) -> Result<String, StorageError> {
        match &self.backend {
            Backend::Keyring(entry) => match entry.get_password() {
                Ok(token) => Ok(token),
                Err(keyring::Error::NoEntry) => Err(StorageError::TokenNotFound),
                Err(err) => Err(StorageError::KeyringError(err)),
            },
            Backend::Memory(slot) => slot
                .lock()
                .map_err(|_| StorageError::Poisoned)?
                .clone()
                .ok_or(StorageError::TokenNotFound),
        }
    }

    /// Removes the token. Deleting a missing token is not an error.
    pub fn delete_token(&self) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Keyring(entry) => match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(err) => Err(StorageError::KeyringError(err)),
            },
            Backend::Memory(slot) => {
                *slot.lock().map_err(|_| StorageError::Poisoned)? = None;
                Ok(())
            }
        }
    }

    pub fn has_token(&self) -> bool {
        self.get_token().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_round_trips_and_deletes() {
        let storage = TokenStorage::in_memory();
        assert!(matches!(storage.get_token(), Err(StorageError::TokenNotFound)));

        storage.save_token("ghp_example").unwrap();
        assert!(storage.has_token());
        assert_eq!(storage.get_token().unwrap(), "ghp_example");

        storage.delete_token().unwrap();
        storage.delete_token().unwrap();
        assert!(!storage.has_token());
    }
}
