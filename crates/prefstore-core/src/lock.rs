//! Cross-process document lock.
//!
//! The lock token is a temporary entry at `Prefs:lock:<path>` in the shared
//! broadcast store. Whoever creates it holds the lock; it vanishes when the
//! owning connection goes away, so a crashed holder never wedges the
//! document.
//!
//! After the token is won, the session's cached signature is compared with
//! the file on disk. This only happens when the session has already read
//! the document: a session that has not touched the file has nothing to be
//! stale against. Note that this lets a session that never read the
//! document lock and commit without any staleness check.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastStore, NotificationKind};
use crate::error::{PrefsError, Result};
use crate::session::Session;
use crate::signature::Signature;

/// Lock state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    /// Waiting for, or validating, the token
    Acquiring,
    Locked,
}

/// Metadata stored in the lock entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockHolder {
    pub pid: u32,
    pub session: String,
    /// RFC 3339 acquisition time
    pub since: String,
}

impl LockHolder {
    fn current(session: &str) -> Self {
        Self {
            pid: std::process::id(),
            session: session.to_string(),
            since: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

/// Who holds the lock on `session`'s document, if anyone.
pub fn holder(session: &Session) -> Option<LockHolder> {
    let key = NotificationKind::Lock.key_for(session.path());
    session
        .store()
        .get(&key)
        .and_then(|value| serde_json::from_value(value).ok())
}

/// Acquire the document lock for `session`.
///
/// With `wait`, blocks until the current holder releases; there is no
/// timeout. When `expected` is given the on-disk signature must match it,
/// otherwise the session's own cached signature is checked if the session
/// has been accessed.
pub fn acquire(session: &Session, wait: bool, expected: Option<&Signature>) -> Result<()> {
    {
        let mut state = session.state();
        if state.lock != LockState::Unlocked {
            return Err(PrefsError::AlreadyLocked);
        }
        state.lock = LockState::Acquiring;
    }

    let key = NotificationKind::Lock.key_for(session.path());
    let record = serde_json::to_value(LockHolder::current(session.name()))?;

    if let Err(err) = acquire_token(session.store(), &key, record, wait) {
        session.state().lock = LockState::Unlocked;
        if matches!(err, PrefsError::Busy) {
            if let Some(holder) = holder(session) {
                debug!(
                    "{} busy, held by pid {} ({})",
                    session.path().display(),
                    holder.pid,
                    holder.session
                );
            }
        }
        return Err(err);
    }

    let mut state = session.state();
    let cached = match expected {
        Some(expected) => Some(*expected),
        None if state.accessed => Some(state.signature),
        None => None,
    };

    if let Some(cached) = cached {
        let current = match Signature::of(session.path()) {
            Ok(current) => current,
            Err(err) => {
                release_token(session.store(), &key);
                state.lock = LockState::Unlocked;
                return Err(err);
            }
        };

        if !current.matches(&cached) {
            release_token(session.store(), &key);
            state.lock = LockState::Unlocked;
            info!(
                "{} is stale for session {} (cached {}, on disk {})",
                session.path().display(),
                session.name(),
                cached,
                current
            );
            return Err(PrefsError::Stale);
        }
    }

    state.lock = LockState::Locked;
    debug!("{} locked by session {}", session.path().display(), session.name());
    Ok(())
}

/// Release the lock if `session` holds it. Releasing an unlocked session
/// is a no-op.
pub fn release(session: &Session) -> Result<()> {
    let mut state = session.state();
    if state.lock != LockState::Locked {
        return Ok(());
    }

    let key = NotificationKind::Lock.key_for(session.path());
    session.store().remove(&key)?;
    state.lock = LockState::Unlocked;
    debug!("{} unlocked by session {}", session.path().display(), session.name());
    Ok(())
}

fn acquire_token(
    store: &dyn BroadcastStore,
    key: &str,
    record: serde_json::Value,
    wait: bool,
) -> Result<()> {
    if !wait {
        return if store.set_temporary(key, record)? {
            Ok(())
        } else {
            Err(PrefsError::Busy)
        };
    }

    // Watch before the first attempt so a release between the attempt and
    // the wait is not lost.
    let keys = [key.to_string()];
    store.watch(&keys, &[])?;
    let result = wait_for_token(store, key, record);
    if let Err(err) = store.unwatch(&keys) {
        warn!("failed to drop lock watch on {}: {}", key, err);
    }
    result
}

fn wait_for_token(store: &dyn BroadcastStore, key: &str, record: serde_json::Value) -> Result<()> {
    loop {
        if store.set_temporary(key, record.clone())? {
            return Ok(());
        }
        debug!("waiting for {}", key);
        store.block_until_notified()?;
        store.drain_notifications();
    }
}

fn release_token(store: &dyn BroadcastStore, key: &str) {
    if let Err(err) = store.remove(key) {
        warn!("failed to release {}: {}", key, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefsSettings;
    use crate::model::Value;
    use crate::session::{PrefsContext, Session};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> PrefsContext {
        PrefsContext::in_memory(PrefsSettings::with_prefs_dir(dir.path()))
    }

    #[test]
    fn test_lock_mutual_exclusion() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let a = Session::open(&ctx, "a", None).unwrap();
        let b = Session::open(&ctx, "b", None).unwrap();

        let results = [a.lock(false), b.lock(false)];
        let won = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(PrefsError::Busy)))
            .count();
        assert_eq!((won, busy), (1, 1));
    }

    #[test]
    fn test_concurrent_acquire_exactly_one_wins() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let sessions: Vec<Arc<Session>> = (0..8)
            .map(|i| Arc::new(Session::open(&ctx, &format!("s{i}"), None).unwrap()))
            .collect();

        let handles: Vec<_> = sessions
            .iter()
            .cloned()
            .map(|s| thread::spawn(move || s.lock(false)))
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(PrefsError::Busy))));
    }

    #[test]
    fn test_spellings_of_one_file_share_the_lock() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let a = Session::open(&ctx, "a", Some("doc.json")).unwrap();
        let b = Session::open(&ctx, "b", Some("./doc.json")).unwrap();
        let c = Session::open(&ctx, "c", Some("sub/../doc.json")).unwrap();

        assert_eq!(a.path(), b.path());
        assert_eq!(a.path(), c.path());

        a.lock(false).unwrap();
        assert!(matches!(b.lock(false), Err(PrefsError::Busy)));
        assert!(matches!(c.lock(false), Err(PrefsError::Busy)));

        a.unlock().unwrap();
        b.lock(false).unwrap();
    }

    #[test]
    fn test_already_locked() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let a = Session::open(&ctx, "a", None).unwrap();

        a.lock(false).unwrap();
        assert!(matches!(a.lock(false), Err(PrefsError::AlreadyLocked)));
        assert!(matches!(a.lock(true), Err(PrefsError::AlreadyLocked)));
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let a = Session::open(&ctx, "a", None).unwrap();

        a.lock(false).unwrap();
        a.unlock().unwrap();
        a.unlock().unwrap();
        assert!(!a.is_locked());
    }

    #[test]
    fn test_release_on_drop() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let a = Session::open(&ctx, "a", None).unwrap();
        let b = Session::open(&ctx, "b", None).unwrap();

        a.lock(false).unwrap();
        assert!(matches!(b.lock(false), Err(PrefsError::Busy)));

        drop(a);
        b.lock(false).unwrap();
    }

    #[test]
    fn test_wait_blocks_until_release() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let a = Session::open(&ctx, "a", None).unwrap();
        let b = Arc::new(Session::open(&ctx, "b", None).unwrap());
        a.lock(false).unwrap();

        let waiter = {
            let b = b.clone();
            thread::spawn(move || b.lock(true))
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!b.is_locked());
        a.unlock().unwrap();

        waiter.join().unwrap().unwrap();
        assert!(b.is_locked());
    }

    #[test]
    fn test_wait_is_interrupted_by_teardown() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let a = Session::open(&ctx, "a", None).unwrap();
        let b = Arc::new(Session::open(&ctx, "b", None).unwrap());
        a.lock(false).unwrap();

        let waiter = {
            let b = b.clone();
            thread::spawn(move || b.lock(true))
        };

        thread::sleep(Duration::from_millis(30));
        b.interrupt_wait();

        assert!(matches!(
            waiter.join().unwrap(),
            Err(PrefsError::Interrupted)
        ));
        assert!(!b.is_locked());
    }

    #[test]
    fn test_holder_metadata() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let a = Session::open(&ctx, "network-setup", None).unwrap();
        let b = Session::open(&ctx, "other", None).unwrap();
        a.lock(false).unwrap();

        let holder = holder(&b).unwrap();
        assert_eq!(holder.session, "network-setup");
        assert_eq!(holder.pid, std::process::id());
    }

    #[test]
    fn test_stale_after_foreign_commit() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let a = Session::open(&ctx, "a", None).unwrap();
        a.get("/missing").unwrap_err();
        assert!(a.is_accessed());

        let b = Session::open(&ctx, "b", None).unwrap();
        b.set("/Owner", Value::from("b")).unwrap();
        b.lock(false).unwrap();
        b.commit().unwrap();
        b.unlock().unwrap();

        assert!(matches!(a.lock(false), Err(PrefsError::Stale)));
        assert!(!a.is_locked());
        // the token was handed back
        b.lock(false).unwrap();
    }

    #[test]
    fn test_unaccessed_session_is_never_stale() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let a = Session::open(&ctx, "a", None).unwrap();

        let b = Session::open(&ctx, "b", None).unwrap();
        b.set("/Owner", Value::from("b")).unwrap();
        b.commit().unwrap();

        // a never read the document, so there is nothing to be stale against
        assert!(!a.is_accessed());
        a.lock(false).unwrap();
    }

    #[test]
    fn test_expected_signature_mismatch() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let a = Session::open(&ctx, "a", None).unwrap();
        a.set("/k", Value::from(1)).unwrap();
        a.commit().unwrap();

        let b = Session::open(&ctx, "b", None).unwrap();
        assert!(matches!(
            b.lock_expecting(false, Some(&Signature::ZERO)),
            Err(PrefsError::Stale)
        ));

        let current = Signature::of(b.path()).unwrap();
        b.lock_expecting(false, Some(&current)).unwrap();
    }
}
