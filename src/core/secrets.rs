//! Keyed secret storage.
//!
//! The core only ever needs get/set/delete/has over strings; the platform
//! keychain implementation lives behind a trait so tests and headless
//! environments can substitute an in-memory map.

use std::collections::HashMap;
use std::sync::Mutex;

use keyring::Entry;
use thiserror::Error;

/// Service name under which entries are stored in the OS keychain.
const KEYRING_SERVICE: &str = "confab";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("keyring access failed: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>, SecretError>;
    fn set(&self, name: &str, value: &str) -> Result<(), SecretError>;
    fn delete(&self, name: &str) -> Result<(), SecretError>;

    fn has(&self, name: &str) -> Result<bool, SecretError> {
        Ok(self.get(name)?.is_some())
    }
}

/// OS keychain implementation.
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    fn entry(&self, name: &str) -> Result<Entry, SecretError> {
        Ok(Entry::new(&self.service, name)?)
    }
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, name: &str) -> Result<Option<String>, SecretError> {
        match self.entry(name)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, name: &str, value: &str) -> Result<(), SecretError> {
        Ok(self.entry(name)?.set_password(value)?)
    }

    fn delete(&self, name: &str) -> Result<(), SecretError> {
        match self.entry(name)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory implementation for tests.
#[derive(Default)]
pub struct MemorySecretStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn with(entries: &[(&str, &str)]) -> Self {
        let store = Self::default();
        if let Ok(mut values) = store.values.lock() {
            for (name, value) in entries {
                values.insert((*name).to_string(), (*value).to_string());
            }
        }
        store
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Result<Option<String>, SecretError> {
        self.values
            .lock()
            .map(|values| values.get(name).cloned())
            .map_err(|_| SecretError::Unavailable("secret map poisoned".into()))
    }

    fn set(&self, name: &str, value: &str) -> Result<(), SecretError> {
        self.values
            .lock()
            .map(|mut values| {
                values.insert(name.to_string(), value.to_string());
            })
            .map_err(|_| SecretError::Unavailable("secret map poisoned".into()))
    }

    fn delete(&self, name: &str) -> Result<(), SecretError> {
        self.values
            .lock()
            .map(|mut values| {
                values.remove(name);
            })
            .map_err(|_| SecretError::Unavailable("secret map poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let store = MemorySecretStore::default();
        assert!(!store.has("OpenRouter").unwrap());
        store.set("OpenRouter", "sk-test").unwrap();
        assert_eq!(store.get("OpenRouter").unwrap().as_deref(), Some("sk-test"));
        assert!(store.has("OpenRouter").unwrap());
        store.delete("OpenRouter").unwrap();
        assert!(store.get("OpenRouter").unwrap().is_none());
    }

    #[test]
    fn delete_of_missing_secret_is_ok() {
        let store = MemorySecretStore::default();
        assert!(store.delete("never-set").is_ok());
    }
}
