//! Sessions over a single configuration document.
//!
//! A [`Session`] owns one cached [`ConfigTree`] and the [`Signature`] of the
//! file it was read from. The file is loaded lazily on first use. Mutations
//! only touch the cache until [`Session::commit`] writes it back.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::broadcast::{BroadcastService, BroadcastStore, MemoryBroadcastHub, NotificationKind};
use crate::codec::decode_document;
use crate::commit;
use crate::config::{normalize_path, PrefsSettings};
use crate::error::{PrefsError, Result};
use crate::lock::{self, LockState};
use crate::model::Value;
use crate::signature::Signature;
use crate::tree::ConfigTree;

/// Process-wide state shared by every session.
#[derive(Clone)]
pub struct PrefsContext {
    broadcast: Arc<dyn BroadcastService>,
    settings: PrefsSettings,
}

impl PrefsContext {
    pub fn new(broadcast: Arc<dyn BroadcastService>, settings: PrefsSettings) -> Self {
        Self {
            broadcast,
            settings,
        }
    }

    /// Context backed by a fresh in-process broadcast hub.
    pub fn in_memory(settings: PrefsSettings) -> Self {
        Self::new(Arc::new(MemoryBroadcastHub::new()), settings)
    }

    pub fn settings(&self) -> &PrefsSettings {
        &self.settings
    }

    pub fn broadcast(&self) -> &Arc<dyn BroadcastService> {
        &self.broadcast
    }
}

impl std::fmt::Debug for PrefsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefsContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Mutable part of a session, guarded by the session mutex.
pub(crate) struct SessionState {
    pub(crate) tree: ConfigTree,
    pub(crate) signature: Signature,
    pub(crate) accessed: bool,
    pub(crate) changed: bool,
    pub(crate) lock: LockState,
}

/// A handle on one configuration document.
pub struct Session {
    name: String,
    path: PathBuf,
    file_mode: u32,
    store: Arc<dyn BroadcastStore>,
    service: Arc<dyn BroadcastService>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Open the document `prefs_id` (or the default document). Nothing is
    /// read until the first access.
    pub fn open(ctx: &PrefsContext, name: &str, prefs_id: Option<&str>) -> Result<Session> {
        Self::open_path(ctx, name, ctx.settings.path_for(prefs_id))
    }

    /// Open the document stored at `path`. The path is normalized first so
    /// every spelling of one file shares its lock and notifications.
    pub fn open_path(ctx: &PrefsContext, name: &str, path: impl Into<PathBuf>) -> Result<Session> {
        let path = normalize_path(&path.into())?;
        let store = ctx.broadcast.connect()?;
        debug!("session {} opened on {}", name, path.display());

        Ok(Session {
            name: name.to_string(),
            path,
            file_mode: ctx.settings.file_mode,
            store,
            service: ctx.broadcast.clone(),
            state: Mutex::new(SessionState {
                tree: ConfigTree::new(),
                signature: Signature::ZERO,
                accessed: false,
                changed: false,
                lock: LockState::Unlocked,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_mode(&self) -> u32 {
        self.file_mode
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn store(&self) -> &dyn BroadcastStore {
        self.store.as_ref()
    }

    /// Load the backing file into `state` unless already loaded.
    fn ensure_loaded(&self, state: &mut SessionState) -> Result<()> {
        if state.accessed {
            return Ok(());
        }

        let (tree, signature) = match File::open(&self.path) {
            Ok(mut file) => {
                // stat the handle we read from, not the path
                let meta = file.metadata().map_err(|e| PrefsError::io(&self.path, e))?;
                let mut bytes = Vec::with_capacity(meta.len() as usize);
                file.read_to_end(&mut bytes)
                    .map_err(|e| PrefsError::io(&self.path, e))?;
                (decode_document(&bytes)?, Signature::from_metadata(&meta))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                (ConfigTree::new(), Signature::ZERO)
            }
            Err(err) => return Err(PrefsError::io(&self.path, err)),
        };

        debug!(
            "session {} loaded {} ({})",
            self.name,
            self.path.display(),
            signature
        );
        state.tree = tree;
        state.signature = signature;
        state.accessed = true;
        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(&ConfigTree) -> Result<R>) -> Result<R> {
        let mut state = self.state();
        self.ensure_loaded(&mut state)?;
        f(&state.tree)
    }

    fn write<R>(&self, f: impl FnOnce(&mut ConfigTree) -> Result<R>) -> Result<R> {
        let mut state = self.state();
        self.ensure_loaded(&mut state)?;
        let result = f(&mut state.tree)?;
        state.changed = true;
        Ok(result)
    }

    pub fn get(&self, path: &str) -> Result<Value> {
        self.read(|tree| tree.get(path))
    }

    pub fn set(&self, path: &str, value: Value) -> Result<()> {
        self.write(|tree| tree.set(path, value))
    }

    pub fn remove(&self, path: &str) -> Result<Value> {
        self.write(|tree| tree.remove(path))
    }

    pub fn get_link(&self, path: &str) -> Result<Option<String>> {
        self.read(|tree| tree.get_link(path))
    }

    pub fn set_link(&self, path: &str, target: &str) -> Result<()> {
        self.write(|tree| tree.set_link(path, target))
    }

    pub fn unique_child(&self, prefix: &str) -> Result<String> {
        self.write(|tree| tree.unique_child(prefix))
    }

    pub fn keys(&self, path: &str) -> Result<Vec<String>> {
        self.read(|tree| tree.keys(path))
    }

    pub fn root_keys(&self) -> Result<Vec<String>> {
        self.read(|tree| Ok(tree.root_keys()))
    }

    /// Copy of the whole cached tree.
    pub fn tree(&self) -> Result<ConfigTree> {
        self.read(|tree| Ok(tree.snapshot()))
    }

    /// Replace the whole cached tree, marking the session changed.
    pub fn replace_tree(&self, tree: ConfigTree) -> Result<()> {
        self.write(|current| {
            *current = tree;
            Ok(())
        })
    }

    /// Signature of the file as last read, loading it if needed.
    pub fn signature(&self) -> Result<Signature> {
        let mut state = self.state();
        self.ensure_loaded(&mut state)?;
        Ok(state.signature)
    }

    pub fn lock(&self, wait: bool) -> Result<()> {
        lock::acquire(self, wait, None)
    }

    /// Lock, requiring the file on disk to match `expected` if given.
    pub fn lock_expecting(&self, wait: bool, expected: Option<&Signature>) -> Result<()> {
        lock::acquire(self, wait, expected)
    }

    pub fn unlock(&self) -> Result<()> {
        lock::release(self)
    }

    pub fn commit(&self) -> Result<Signature> {
        commit::commit(self)
    }

    pub fn apply(&self) -> Result<()> {
        commit::apply(self)
    }

    /// Drop the cached tree and any uncommitted changes. The next access
    /// reads the file again.
    pub fn synchronize(&self) -> Result<()> {
        let mut state = self.state();
        if state.changed {
            debug!("session {} discarding uncommitted changes", self.name);
        }
        state.tree = ConfigTree::new();
        state.signature = Signature::ZERO;
        state.accessed = false;
        state.changed = false;
        Ok(())
    }

    /// Whether the file on disk no longer matches what this session read.
    /// An unaccessed session is never stale.
    pub fn is_stale(&self) -> Result<bool> {
        let state = self.state();
        if !state.accessed {
            return Ok(false);
        }
        Ok(!Signature::of(&self.path)?.matches(&state.signature))
    }

    pub fn is_locked(&self) -> bool {
        self.state().lock == LockState::Locked
    }

    pub fn is_changed(&self) -> bool {
        self.state().changed
    }

    pub fn is_accessed(&self) -> bool {
        self.state().accessed
    }

    /// Wake a thread blocked in `lock(true)` on this session with
    /// [`PrefsError::Interrupted`].
    pub fn interrupt_wait(&self) {
        self.store.interrupt();
    }

    /// Watch this document for commits and applies.
    pub fn watcher(&self) -> Result<ChangeWatcher> {
        ChangeWatcher::new(self.service.as_ref(), &self.path)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = lock::release(self) {
            warn!("session {} failed to release lock: {}", self.name, err);
        }
    }
}

/// Operations common to local sessions and sessions routed through the
/// helper.
pub trait Preferences: Send + Sync {
    fn name(&self) -> &str;
    fn tree(&self) -> Result<ConfigTree>;
    fn get(&self, path: &str) -> Result<Value>;
    fn set(&self, path: &str, value: Value) -> Result<()>;
    fn remove(&self, path: &str) -> Result<Value>;
    fn set_link(&self, path: &str, target: &str) -> Result<()>;
    fn unique_child(&self, prefix: &str) -> Result<String>;
    fn lock(&self, wait: bool) -> Result<()>;
    fn unlock(&self) -> Result<()>;
    fn commit(&self) -> Result<Signature>;
    fn apply(&self) -> Result<()>;
    fn synchronize(&self) -> Result<()>;
    fn signature(&self) -> Result<Signature>;
}

impl Preferences for Session {
    fn name(&self) -> &str {
        Session::name(self)
    }

    fn tree(&self) -> Result<ConfigTree> {
        Session::tree(self)
    }

    fn get(&self, path: &str) -> Result<Value> {
        Session::get(self, path)
    }

    fn set(&self, path: &str, value: Value) -> Result<()> {
        Session::set(self, path, value)
    }

    fn remove(&self, path: &str) -> Result<Value> {
        Session::remove(self, path)
    }

    fn set_link(&self, path: &str, target: &str) -> Result<()> {
        Session::set_link(self, path, target)
    }

    fn unique_child(&self, prefix: &str) -> Result<String> {
        Session::unique_child(self, prefix)
    }

    fn lock(&self, wait: bool) -> Result<()> {
        Session::lock(self, wait)
    }

    fn unlock(&self) -> Result<()> {
        Session::unlock(self)
    }

    fn commit(&self) -> Result<Signature> {
        Session::commit(self)
    }

    fn apply(&self) -> Result<()> {
        Session::apply(self)
    }

    fn synchronize(&self) -> Result<()> {
        Session::synchronize(self)
    }

    fn signature(&self) -> Result<Signature> {
        Session::signature(self)
    }
}

/// Event seen by a [`ChangeWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefsNotification {
    Commit,
    Apply,
}

/// Receives commit and apply notifications for one document over its own
/// broadcast connection.
pub struct ChangeWatcher {
    store: Arc<dyn BroadcastStore>,
}

impl ChangeWatcher {
    pub fn new(service: &dyn BroadcastService, path: &Path) -> Result<Self> {
        let path = normalize_path(path)?;
        let store = service.connect()?;
        let keys = [
            NotificationKind::Commit.key_for(&path),
            NotificationKind::Apply.key_for(&path),
        ];
        store.watch(&keys, &[])?;
        Ok(Self { store })
    }

    /// Pending events, oldest first. Does not block.
    pub fn poll(&self) -> Vec<PrefsNotification> {
        self.store
            .drain_notifications()
            .iter()
            .filter_map(|key| match NotificationKind::from_key(key)? {
                NotificationKind::Commit => Some(PrefsNotification::Commit),
                NotificationKind::Apply => Some(PrefsNotification::Apply),
                NotificationKind::Lock => None,
            })
            .collect()
    }

    /// Block until at least one event arrives.
    pub fn wait(&self) -> Result<Vec<PrefsNotification>> {
        loop {
            self.store.block_until_notified()?;
            let events = self.poll();
            if !events.is_empty() {
                return Ok(events);
            }
        }
    }

    /// Wake a thread blocked in [`ChangeWatcher::wait`].
    pub fn interrupt(&self) {
        self.store.interrupt();
    }
}
