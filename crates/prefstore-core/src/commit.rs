//! Commit and apply.
//!
//! A commit writes the encoded tree to `<target>-new` next to the target,
//! syncs it, and renames it over the target. The rename is the atomicity
//! boundary: before it the old file is untouched, after it the new file is
//! complete. Watchers of the commit key are notified only after the rename.
//!
//! Apply is a separate notification telling live consumers to act on the
//! committed document. It neither implies nor requires a commit.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::broadcast::NotificationKind;
use crate::codec::encode_document;
use crate::error::{PrefsError, Result};
use crate::lock;
use crate::session::Session;
use crate::signature::Signature;
use crate::tree::ConfigTree;

/// Suffix of the temporary file written before the rename.
pub const TEMP_SUFFIX: &str = "-new";

/// Persist `session`'s tree if it changed.
///
/// A session that does not hold the lock takes it (waiting if needed) for
/// the duration of the commit.
pub fn commit(session: &Session) -> Result<Signature> {
    {
        let state = session.state();
        if !state.changed {
            return if state.accessed {
                Ok(state.signature)
            } else {
                Signature::of(session.path())
            };
        }
    }

    let took_lock = !session.is_locked();
    if took_lock {
        lock::acquire(session, true, None)?;
    }

    let result = commit_locked(session);

    if took_lock {
        if let Err(err) = lock::release(session) {
            warn!("failed to release lock after commit: {}", err);
        }
    }
    result
}

fn commit_locked(session: &Session) -> Result<Signature> {
    let path = session.path();
    let mut state = session.state();
    if !state.changed {
        return Ok(state.signature);
    }

    let bytes = encode_document(&state.tree)?;
    write_atomically(path, &bytes, session.file_mode())?;
    let signature = Signature::of(path)?;

    state.signature = signature;
    state.changed = false;
    state.accessed = false;
    state.tree = ConfigTree::new();
    drop(state);

    session
        .store()
        .notify(&NotificationKind::Commit.key_for(path))?;
    info!(
        "committed {} ({} bytes) for session {}",
        path.display(),
        bytes.len(),
        session.name()
    );
    Ok(signature)
}

/// Tell live consumers to activate the committed document.
pub fn apply(session: &Session) -> Result<()> {
    session
        .store()
        .notify(&NotificationKind::Apply.key_for(session.path()))?;
    info!("applied {} for session {}", session.path().display(), session.name());
    Ok(())
}

/// Path of the temporary file used when committing to `target`.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Replace `target` with `bytes` via temp file and rename.
///
/// New files get `default_mode`; an existing file's permission bits are
/// preserved. On any error before the rename the temp file is removed and
/// `target` is left as it was.
pub fn write_atomically(target: &Path, bytes: &[u8], default_mode: u32) -> Result<()> {
    let dir = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| PrefsError::io(dir, e))?;

    let mode = existing_mode(target).unwrap_or(default_mode);
    let temp = temp_path_for(target);

    let result = write_temp(&temp, bytes, mode).and_then(|()| {
        before_rename(&temp)?;
        fs::rename(&temp, target).map_err(|e| PrefsError::io(target, e))
    });

    if result.is_err() {
        if let Err(err) = fs::remove_file(&temp) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove {}: {}", temp.display(), err);
            }
        }
        return result;
    }

    #[cfg(unix)]
    {
        if let Err(err) = fs::File::open(dir).and_then(|handle| handle.sync_all()) {
            warn!("failed to sync directory {}: {}", dir.display(), err);
        }
    }

    debug!("replaced {} (mode {:o})", target.display(), mode);
    Ok(())
}

fn write_temp(temp: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(temp).map_err(|e| PrefsError::io(temp, e))?;

    // open() is subject to the umask
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| PrefsError::io(temp, e))?;
    }

    file.write_all(bytes).map_err(|e| PrefsError::io(temp, e))?;
    file.sync_all().map_err(|e| PrefsError::io(temp, e))?;
    Ok(())
}

#[cfg(unix)]
fn existing_mode(target: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(target)
        .ok()
        .map(|meta| meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn existing_mode(_target: &Path) -> Option<u32> {
    None
}

#[cfg(test)]
thread_local! {
    static FAIL_BEFORE_RENAME: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

fn before_rename(temp: &Path) -> Result<()> {
    #[cfg(test)]
    {
        if FAIL_BEFORE_RENAME.with(|fail| fail.replace(false)) {
            return Err(PrefsError::io(
                temp,
                io::Error::other("injected failure before rename"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefsSettings;
    use crate::model::Value;
    use crate::session::{PrefsContext, PrefsNotification, Session};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> PrefsContext {
        PrefsContext::in_memory(PrefsSettings::with_prefs_dir(dir.path()))
    }

    #[test]
    fn test_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let writer = Session::open(&ctx, "writer", Some("network.json")).unwrap();
        writer.set("/Sets/0/Name", Value::from("Automatic")).unwrap();
        writer.set("/Sets/0/Order", Value::List(vec![Value::from(1), Value::from(2)])).unwrap();
        writer.set("/CurrentSet", Value::link("/Sets/0")).unwrap();
        let expected = writer.tree().unwrap();
        writer.lock(false).unwrap();
        writer.commit().unwrap();
        writer.unlock().unwrap();

        let reader = Session::open(&ctx, "reader", Some("network.json")).unwrap();
        assert_eq!(reader.tree().unwrap(), expected);
        assert_eq!(reader.get("/CurrentSet/Name").unwrap(), Value::from("Automatic"));
    }

    #[test]
    fn test_first_commit_creates_file() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let session = Session::open(&ctx, "s", Some("nested/dir/prefs.json")).unwrap();

        assert!(session.tree().unwrap().is_empty());
        assert!(session.signature().unwrap().is_zero());

        session.set("/k", Value::from(true)).unwrap();
        let signature = session.commit().unwrap();

        assert!(session.path().exists());
        assert!(!signature.is_zero());
        assert_eq!(signature, Signature::of(session.path()).unwrap());
    }

    #[test]
    fn test_commit_without_changes_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let session = Session::open(&ctx, "s", None).unwrap();

        let signature = session.commit().unwrap();
        assert!(signature.is_zero());
        assert!(!session.path().exists());
    }

    #[test]
    fn test_commit_resets_flags() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let session = Session::open(&ctx, "s", None).unwrap();

        session.set("/k", Value::from(1)).unwrap();
        assert!(session.is_changed());
        session.commit().unwrap();

        assert!(!session.is_changed());
        assert!(!session.is_accessed());
        // the committed state is read back on next touch
        assert_eq!(session.get("/k").unwrap(), Value::from(1));
    }

    #[test]
    fn test_failure_before_rename_leaves_target_untouched() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let session = Session::open(&ctx, "s", None).unwrap();

        session.set("/k", Value::from("original")).unwrap();
        session.commit().unwrap();
        let before = fs::read(session.path()).unwrap();

        session.set("/k", Value::from("replacement")).unwrap();
        FAIL_BEFORE_RENAME.with(|fail| fail.set(true));
        let err = session.commit().unwrap_err();

        assert!(matches!(err, PrefsError::Io { .. }));
        assert_eq!(fs::read(session.path()).unwrap(), before);
        assert!(!temp_path_for(session.path()).exists());
        assert!(session.is_changed());
        assert!(!session.is_locked());

        // a retry goes through
        session.commit().unwrap();
        assert_eq!(session.get("/k").unwrap(), Value::from("replacement"));
    }

    #[test]
    fn test_non_finite_real_rejected_before_write() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let session = Session::open(&ctx, "s", None).unwrap();

        session.set("/ok", Value::from(1)).unwrap();
        session.commit().unwrap();
        let before = fs::read(session.path()).unwrap();

        session.set("/bad", Value::from(f64::NAN)).unwrap();
        let err = session.commit().unwrap_err();

        assert!(matches!(err, PrefsError::Serialize(_)));
        assert_eq!(fs::read(session.path()).unwrap(), before);
        assert!(!temp_path_for(session.path()).exists());
        assert!(!session.is_locked());

        let reader = Session::open(&ctx, "reader", None).unwrap();
        assert_eq!(reader.get("/ok").unwrap(), Value::from(1));
    }

    #[test]
    fn test_unwritable_temp_path_leaves_target_untouched() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("prefs.json");
        fs::write(&target, b"{}\n").unwrap();
        fs::create_dir(temp_path_for(&target)).unwrap();

        let err = write_atomically(&target, b"{\"a\": 1}", 0o644).unwrap_err();
        assert!(matches!(err, PrefsError::Io { .. }));
        assert_eq!(fs::read(&target).unwrap(), b"{}\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("prefs.json");
        write_atomically(&target, b"{}", 0o600).unwrap();
        assert_eq!(fs::metadata(&target).unwrap().permissions().mode() & 0o777, 0o600);

        fs::set_permissions(&target, fs::Permissions::from_mode(0o640)).unwrap();
        write_atomically(&target, b"{}", 0o600).unwrap();
        assert_eq!(fs::metadata(&target).unwrap().permissions().mode() & 0o777, 0o640);
    }

    #[test]
    fn test_commit_and_apply_notify_watchers() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let session = Session::open(&ctx, "s", None).unwrap();
        let watcher = session.watcher().unwrap();

        session.set("/k", Value::from(1)).unwrap();
        session.commit().unwrap();
        assert_eq!(watcher.poll(), vec![PrefsNotification::Commit]);

        session.apply().unwrap();
        assert_eq!(watcher.poll(), vec![PrefsNotification::Apply]);
    }

    #[test]
    fn test_noop_commit_does_not_notify() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let session = Session::open(&ctx, "s", None).unwrap();
        let watcher = session.watcher().unwrap();

        session.commit().unwrap();
        assert!(watcher.poll().is_empty());
    }
}
