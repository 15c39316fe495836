//! Privileged domain operations served next to the preference commands.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use prefstore_core::{PrefsError, Result};
use tracing::{debug, info};

/// Storage for opaque secrets such as passwords and keys.
pub trait SecretStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Vec<u8>>;
    fn set(&self, id: &str, data: &[u8]) -> Result<()>;
    fn remove(&self, id: &str) -> Result<()>;
}

/// Refreshes an external resource after its configuration changed.
pub trait ResourceRefresher: Send + Sync {
    fn refresh(&self, resource: &str) -> Result<()>;
}

fn check_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(PrefsError::BadArgument(format!("empty {kind} id")));
    }
    Ok(())
}

/// Secrets kept in process memory.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn secrets(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.secrets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.secrets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, id: &str) -> Result<Vec<u8>> {
        check_id("secret", id)?;
        self.secrets()
            .get(id)
            .cloned()
            .ok_or_else(|| PrefsError::NotFound(format!("secret {id}")))
    }

    fn set(&self, id: &str, data: &[u8]) -> Result<()> {
        check_id("secret", id)?;
        self.secrets().insert(id.to_string(), data.to_vec());
        debug!("stored secret {} ({} bytes)", id, data.len());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        check_id("secret", id)?;
        match self.secrets().remove(id) {
            Some(_) => Ok(()),
            None => Err(PrefsError::NotFound(format!("secret {id}"))),
        }
    }
}

/// Refresher that only logs and remembers what it was asked to refresh.
#[derive(Debug, Default)]
pub struct LoggingRefresher {
    refreshed: Mutex<Vec<String>>,
}

impl LoggingRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resources refreshed so far, oldest first.
    pub fn refreshed(&self) -> Vec<String> {
        self.refreshed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ResourceRefresher for LoggingRefresher {
    fn refresh(&self, resource: &str) -> Result<()> {
        check_id("resource", resource)?;
        info!("refresh requested for {}", resource);
        self.refreshed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resource.to_string());
        Ok(())
    }
}
