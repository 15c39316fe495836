//! Shared broadcast key/value store.
//!
//! Sessions coordinate through a store shared by every process using the
//! same documents. The store offers plain and temporary entries plus
//! change notification. A temporary entry belongs to the connection that
//! created it and disappears when that connection is dropped, which is what
//! makes it usable as a crash-safe lock token.
//!
//! [`MemoryBroadcastHub`] is an in-process implementation. It serves every
//! session of one process, which in a privilege-separated deployment is the
//! helper.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde_json::Value as JsonValue;

use crate::error::{PrefsError, Result};
use crate::path::KeyPattern;

/// Prefix shared by every key this crate posts.
pub const KEY_PREFIX: &str = "Prefs";

/// The per-document keys used for coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// Temporary entry whose presence is the lock token.
    Lock,
    /// Posted after a commit has replaced the backing file.
    Commit,
    /// Posted when live consumers should activate the committed state.
    Apply,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Lock => "lock",
            NotificationKind::Commit => "commit",
            NotificationKind::Apply => "apply",
        }
    }

    /// The broadcast key of this kind for the document at `path`.
    pub fn key_for(&self, path: &Path) -> String {
        format!("{}:{}:{}", KEY_PREFIX, self.as_str(), path.display())
    }

    /// Classify a key produced by [`NotificationKind::key_for`].
    pub fn from_key(key: &str) -> Option<NotificationKind> {
        let mut parts = key.splitn(3, ':');
        if parts.next() != Some(KEY_PREFIX) {
            return None;
        }
        match parts.next()? {
            "lock" => Some(NotificationKind::Lock),
            "commit" => Some(NotificationKind::Commit),
            "apply" => Some(NotificationKind::Apply),
            _ => None,
        }
    }
}

/// One connection to the shared store.
///
/// Every method takes `&self` so a connection can be shared between the
/// thread blocked in [`BroadcastStore::block_until_notified`] and the one
/// that wants to [`BroadcastStore::interrupt`] it.
pub trait BroadcastStore: Send + Sync {
    /// Read an entry.
    fn get(&self, key: &str) -> Option<JsonValue>;

    /// Create or replace a persistent entry and notify watchers.
    fn set(&self, key: &str, value: JsonValue) -> Result<()>;

    /// Create a temporary entry owned by this connection if no entry exists.
    /// Returns false when the key is already present.
    fn set_temporary(&self, key: &str, value: JsonValue) -> Result<bool>;

    /// Remove an entry. Returns false when there was nothing to remove.
    fn remove(&self, key: &str) -> Result<bool>;

    /// Notify watchers of `key` without changing it.
    fn notify(&self, key: &str) -> Result<()>;

    /// Add keys and patterns to this connection's watch set.
    fn watch(&self, keys: &[String], patterns: &[KeyPattern]) -> Result<()>;

    /// Remove keys from this connection's watch set.
    fn unwatch(&self, keys: &[String]) -> Result<()>;

    /// Block until at least one watched key has a pending notification.
    ///
    /// There is no timeout. Returns [`PrefsError::Interrupted`] if
    /// [`BroadcastStore::interrupt`] is called while waiting.
    fn block_until_notified(&self) -> Result<()>;

    /// Take all pending notifications.
    fn drain_notifications(&self) -> Vec<String>;

    /// Wake a thread blocked in `block_until_notified` with an error.
    fn interrupt(&self);
}

/// Source of connections to the shared store.
pub trait BroadcastService: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn BroadcastStore>>;
}

type ConnectionId = u64;

struct Entry {
    value: JsonValue,
    /// Connection owning a temporary entry
    owner: Option<ConnectionId>,
}

#[derive(Default)]
struct Watcher {
    keys: HashSet<String>,
    patterns: Vec<KeyPattern>,
    pending: Vec<String>,
    interrupted: bool,
}

impl Watcher {
    fn wants(&self, key: &str) -> bool {
        self.keys.contains(key) || self.patterns.iter().any(|p| p.matches(key))
    }
}

#[derive(Default)]
struct HubState {
    entries: HashMap<String, Entry>,
    watchers: HashMap<ConnectionId, Watcher>,
    next_id: ConnectionId,
}

impl HubState {
    fn post(&mut self, key: &str) {
        for watcher in self.watchers.values_mut() {
            if watcher.wants(key) && !watcher.pending.iter().any(|k| k == key) {
                watcher.pending.push(key.to_string());
            }
        }
    }
}

#[derive(Default)]
struct HubInner {
    state: Mutex<HubState>,
    changed: Condvar,
}

impl HubInner {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broadcast store.
#[derive(Clone, Default)]
pub struct MemoryBroadcastHub {
    inner: Arc<HubInner>,
}

impl MemoryBroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection.
    pub fn connection(&self) -> MemoryConnection {
        let mut state = self.inner.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.watchers.insert(id, Watcher::default());

        MemoryConnection {
            hub: self.inner.clone(),
            id,
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }
}

impl std::fmt::Debug for MemoryBroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("MemoryBroadcastHub")
            .field("entries", &state.entries.len())
            .field("connections", &state.watchers.len())
            .finish()
    }
}

impl BroadcastService for MemoryBroadcastHub {
    fn connect(&self) -> Result<Arc<dyn BroadcastStore>> {
        Ok(Arc::new(self.connection()))
    }
}

/// A connection to a [`MemoryBroadcastHub`].
pub struct MemoryConnection {
    hub: Arc<HubInner>,
    id: ConnectionId,
}

impl MemoryConnection {
    fn watcher<'a>(&self, state: &'a mut HubState) -> Result<&'a mut Watcher> {
        state
            .watchers
            .get_mut(&self.id)
            .ok_or_else(|| PrefsError::NotFound(format!("broadcast connection {}", self.id)))
    }
}

impl BroadcastStore for MemoryConnection {
    fn get(&self, key: &str) -> Option<JsonValue> {
        self.hub.lock().entries.get(key).map(|e| e.value.clone())
    }

    fn set(&self, key: &str, value: JsonValue) -> Result<()> {
        let mut state = self.hub.lock();
        state
            .entries
            .insert(key.to_string(), Entry { value, owner: None });
        state.post(key);
        self.hub.changed.notify_all();
        Ok(())
    }

    fn set_temporary(&self, key: &str, value: JsonValue) -> Result<bool> {
        let mut state = self.hub.lock();
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                owner: Some(self.id),
            },
        );
        state.post(key);
        self.hub.changed.notify_all();
        Ok(true)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut state = self.hub.lock();
        let removed = state.entries.remove(key).is_some();
        if removed {
            state.post(key);
            self.hub.changed.notify_all();
        }
        Ok(removed)
    }

    fn notify(&self, key: &str) -> Result<()> {
        let mut state = self.hub.lock();
        state.post(key);
        self.hub.changed.notify_all();
        Ok(())
    }

    fn watch(&self, keys: &[String], patterns: &[KeyPattern]) -> Result<()> {
        let mut state = self.hub.lock();
        let watcher = self.watcher(&mut state)?;
        watcher.keys.extend(keys.iter().cloned());
        watcher.patterns.extend(patterns.iter().cloned());
        Ok(())
    }

    fn unwatch(&self, keys: &[String]) -> Result<()> {
        let mut state = self.hub.lock();
        let watcher = self.watcher(&mut state)?;
        for key in keys {
            watcher.keys.remove(key);
            watcher.pending.retain(|k| k != key);
        }
        Ok(())
    }

    fn block_until_notified(&self) -> Result<()> {
        let mut state = self.hub.lock();
        loop {
            let watcher = self.watcher(&mut state)?;
            if watcher.interrupted {
                watcher.interrupted = false;
                return Err(PrefsError::Interrupted);
            }
            if !watcher.pending.is_empty() {
                return Ok(());
            }
            state = self
                .hub
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn drain_notifications(&self) -> Vec<String> {
        let mut state = self.hub.lock();
        match state.watchers.get_mut(&self.id) {
            Some(watcher) => std::mem::take(&mut watcher.pending),
            None => Vec::new(),
        }
    }

    fn interrupt(&self) {
        let mut state = self.hub.lock();
        if let Some(watcher) = state.watchers.get_mut(&self.id) {
            watcher.interrupted = true;
        }
        self.hub.changed.notify_all();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.hub.lock();
        state.watchers.remove(&self.id);

        let owned: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.owner == Some(self.id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &owned {
            state.entries.remove(key);
            state.post(key);
        }
        drop(state);
        self.hub.changed.notify_all();
    }
}
