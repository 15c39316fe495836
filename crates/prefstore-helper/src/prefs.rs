//! Choosing between a local session and one routed through the helper.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

use prefstore_core::{Preferences, PrefsContext, Result, Session};
use tracing::debug;

use crate::client::{HelperClient, RemoteSession};

/// Open `prefs_id` through the helper when one is listening on the
/// configured socket, so its lock is shared with every other process.
/// Without a helper the document is opened directly if this process can
/// write its directory; such sessions coordinate only with sessions on
/// `ctx`'s broadcast service. Documents outside `prefs_dir` are always
/// opened directly.
pub fn open_preferences(
    ctx: &PrefsContext,
    name: &str,
    prefs_id: Option<&str>,
) -> Result<Box<dyn Preferences>> {
    open_preferences_with_token(ctx, name, prefs_id, None)
}

/// Like [`open_preferences`], authenticating helper connections with
/// `token`.
pub fn open_preferences_with_token(
    ctx: &PrefsContext,
    name: &str,
    prefs_id: Option<&str>,
    token: Option<&str>,
) -> Result<Box<dyn Preferences>> {
    let path = ctx.settings().path_for(prefs_id);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let socket = &ctx.settings().helper_socket;

    if ctx.settings().confined_path_for(prefs_id).is_err() {
        debug!("{} is outside the helper's documents, opening directly", path.display());
        return Ok(Box::new(Session::open_path(ctx, name, path)?));
    }

    let unavailable = match HelperClient::connect(socket) {
        Ok(client) => {
            debug!("routing {} through {}", name, socket.display());
            return Ok(Box::new(RemoteSession::with_client(
                client, name, prefs_id, token,
            )?));
        }
        Err(err) => err,
    };

    if dir_is_writable(dir) {
        debug!("no helper ({}), opening {} directly", unavailable, path.display());
        return Ok(Box::new(Session::open_path(ctx, name, path)?));
    }

    debug!(
        "{} is not writable and no helper is listening on {}",
        dir.display(),
        socket.display()
    );
    Err(unavailable)
}

/// Probe by creating (and removing) a file in `dir`. A missing directory
/// counts as writable if it can be created.
pub fn dir_is_writable(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }

    let probe = dir.join(format!(".prefstore-probe-{}", uuid::Uuid::new_v4().simple()));
    match OpenOptions::new().write(true).create_new(true).open(&probe) {
        Ok(_) => {
            if let Err(err) = fs::remove_file(&probe) {
                debug!("failed to remove probe {}: {}", probe.display(), err);
            }
            true
        }
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => false,
        Err(err) => {
            debug!("write probe in {} failed: {}", dir.display(), err);
            false
        }
    }
}
