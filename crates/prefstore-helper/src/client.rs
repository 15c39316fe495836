//! Blocking client for the helper channel.
//!
//! [`RemoteSession`] keeps the tree in the client, like a local session,
//! and only talks to the helper to read the document, lock, commit and
//! apply. The signature it read with is sent along with `LOCK`, so the
//! helper detects a stale copy the same way a local session would.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use prefstore_core::{ConfigTree, Preferences, PrefsError, Result, Signature, Value};
use prefstore_protocol::codec::{encode_payload, read_frame, write_frame};
use prefstore_protocol::{
    AccessReply, AuthRequest, Command, CommitReply, CommitRequest, Frame, LockRequest, OpenRequest,
    RefreshRequest, SecretReply, SecretRequest, SecretSetRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// One connection to the helper.
#[derive(Debug)]
pub struct HelperClient {
    stream: UnixStream,
}

impl HelperClient {
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .map_err(|e| PrefsError::io(socket_path, e))?;
        debug!("connected to helper at {}", socket_path.display());
        Ok(Self { stream })
    }

    /// Send a request and wait for its response. A failed status comes
    /// back as the matching error.
    pub fn call(&mut self, command: Command, payload: Option<Vec<u8>>) -> Result<Option<Vec<u8>>> {
        write_frame(&mut self.stream, &Frame::request(command, payload))?;
        read_frame(&mut self.stream)?.into_result()
    }

    fn call_with<T: Serialize>(&mut self, command: Command, request: &T) -> Result<Option<Vec<u8>>> {
        let payload = encode_payload(request)?;
        self.call(command, Some(payload))
    }

    fn decode<R: DeserializeOwned>(payload: Option<Vec<u8>>) -> Result<R> {
        let payload = payload.ok_or_else(|| PrefsError::Protocol("missing reply payload".into()))?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Install a token for the authorization checks on this connection.
    pub fn authenticate(&mut self, token: &str) -> Result<()> {
        self.call_with(
            Command::Auth,
            &AuthRequest {
                token: token.to_string(),
            },
        )?;
        Ok(())
    }

    pub fn open(&mut self, name: &str, prefs_id: Option<&str>) -> Result<()> {
        self.call_with(
            Command::Open,
            &OpenRequest::new(name, prefs_id.map(String::from)),
        )?;
        Ok(())
    }

    pub fn access(&mut self) -> Result<AccessReply> {
        let payload = self.call(Command::Access, None)?;
        Self::decode(payload)
    }

    pub fn lock(&mut self, wait: bool, expected_signature: Option<Signature>) -> Result<()> {
        self.call_with(
            Command::Lock,
            &LockRequest {
                wait,
                expected_signature,
            },
        )?;
        Ok(())
    }

    pub fn commit(&mut self, tree: Option<&ConfigTree>) -> Result<Signature> {
        let request = CommitRequest {
            tree: tree.map(|tree| tree.root().clone()),
        };
        let payload = self.call_with(Command::Commit, &request)?;
        Ok(Self::decode::<CommitReply>(payload)?.signature)
    }

    pub fn apply(&mut self) -> Result<()> {
        self.call(Command::Apply, None).map(drop)
    }

    pub fn unlock(&mut self) -> Result<()> {
        self.call(Command::Unlock, None).map(drop)
    }

    pub fn synchronize(&mut self) -> Result<()> {
        self.call(Command::Synchronize, None).map(drop)
    }

    /// Drop the helper-side session but keep the connection.
    pub fn close(&mut self) -> Result<()> {
        self.call(Command::Close, None).map(drop)
    }

    pub fn secret_get(&mut self, id: &str) -> Result<Vec<u8>> {
        let payload = self.call_with(Command::SecretGet, &SecretRequest { id: id.to_string() })?;
        Ok(Self::decode::<SecretReply>(payload)?.data)
    }

    pub fn secret_set(&mut self, id: &str, data: &[u8]) -> Result<()> {
        self.call_with(
            Command::SecretSet,
            &SecretSetRequest {
                id: id.to_string(),
                data: data.to_vec(),
            },
        )?;
        Ok(())
    }

    pub fn secret_remove(&mut self, id: &str) -> Result<()> {
        self.call_with(Command::SecretRemove, &SecretRequest { id: id.to_string() })?;
        Ok(())
    }

    pub fn refresh(&mut self, resource: &str) -> Result<()> {
        self.call_with(
            Command::Refresh,
            &RefreshRequest {
                resource: resource.to_string(),
            },
        )?;
        Ok(())
    }

    /// End the connection. The helper does not reply to `EXIT`.
    pub fn exit(mut self) -> Result<()> {
        write_frame(&mut self.stream, &Frame::request(Command::Exit, None))?;
        Ok(())
    }
}

struct RemoteState {
    client: HelperClient,
    tree: ConfigTree,
    signature: Signature,
    accessed: bool,
    changed: bool,
    locked: bool,
}

impl RemoteState {
    fn ensure_loaded(&mut self) -> Result<()> {
        if self.accessed {
            return Ok(());
        }
        let reply = self.client.access()?;
        self.tree = ConfigTree::from_mapping(reply.tree);
        self.signature = reply.signature;
        self.accessed = true;
        Ok(())
    }

    fn lock(&mut self, wait: bool) -> Result<()> {
        if self.locked {
            return Err(PrefsError::AlreadyLocked);
        }
        let expected = self.accessed.then_some(self.signature);
        self.client.lock(wait, expected)?;
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }
        self.client.unlock()?;
        self.locked = false;
        Ok(())
    }

    fn commit(&mut self) -> Result<Signature> {
        if !self.changed {
            return if self.accessed {
                Ok(self.signature)
            } else {
                self.client.commit(None)
            };
        }

        let took_lock = !self.locked;
        if took_lock {
            self.lock(true)?;
        }

        let result = self.client.commit(Some(&self.tree));
        if let Ok(signature) = result {
            self.signature = signature;
            self.changed = false;
            self.accessed = false;
            self.tree = ConfigTree::new();
        }

        if took_lock {
            if let Err(err) = self.unlock() {
                warn!("failed to release helper lock after commit: {}", err);
            }
        }
        result
    }
}

/// A session whose privileged operations run in the helper.
pub struct RemoteSession {
    name: String,
    state: Mutex<RemoteState>,
}

impl RemoteSession {
    /// Connect to the helper and open `prefs_id` there. With a token, the
    /// connection is authenticated first.
    pub fn open(
        socket_path: &Path,
        name: &str,
        prefs_id: Option<&str>,
        token: Option<&str>,
    ) -> Result<Self> {
        let client = HelperClient::connect(socket_path)?;
        Self::with_client(client, name, prefs_id, token)
    }

    /// Open `prefs_id` over an already connected client.
    pub fn with_client(
        mut client: HelperClient,
        name: &str,
        prefs_id: Option<&str>,
        token: Option<&str>,
    ) -> Result<Self> {
        if let Some(token) = token {
            client.authenticate(token)?;
        }
        client.open(name, prefs_id)?;

        Ok(Self {
            name: name.to_string(),
            state: Mutex::new(RemoteState {
                client,
                tree: ConfigTree::new(),
                signature: Signature::ZERO,
                accessed: false,
                changed: false,
                locked: false,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<R>(&self, f: impl FnOnce(&ConfigTree) -> Result<R>) -> Result<R> {
        let mut state = self.state();
        state.ensure_loaded()?;
        f(&state.tree)
    }

    fn write<R>(&self, f: impl FnOnce(&mut ConfigTree) -> Result<R>) -> Result<R> {
        let mut state = self.state();
        state.ensure_loaded()?;
        let result = f(&mut state.tree)?;
        state.changed = true;
        Ok(result)
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    pub fn is_changed(&self) -> bool {
        self.state().changed
    }

    pub fn keys(&self, path: &str) -> Result<Vec<String>> {
        self.read(|tree| tree.keys(path))
    }

    pub fn get_link(&self, path: &str) -> Result<Option<String>> {
        self.read(|tree| tree.get_link(path))
    }
}

impl Preferences for RemoteSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn tree(&self) -> Result<ConfigTree> {
        self.read(|tree| Ok(tree.snapshot()))
    }

    fn get(&self, path: &str) -> Result<Value> {
        self.read(|tree| tree.get(path))
    }

    fn set(&self, path: &str, value: Value) -> Result<()> {
        self.write(|tree| tree.set(path, value))
    }

    fn remove(&self, path: &str) -> Result<Value> {
        self.write(|tree| tree.remove(path))
    }

    fn set_link(&self, path: &str, target: &str) -> Result<()> {
        self.write(|tree| tree.set_link(path, target))
    }

    fn unique_child(&self, prefix: &str) -> Result<String> {
        self.write(|tree| tree.unique_child(prefix))
    }

    fn lock(&self, wait: bool) -> Result<()> {
        self.state().lock(wait)
    }

    fn unlock(&self) -> Result<()> {
        self.state().unlock()
    }

    fn commit(&self) -> Result<Signature> {
        self.state().commit()
    }

    fn apply(&self) -> Result<()> {
        self.state().client.apply()
    }

    fn synchronize(&self) -> Result<()> {
        let mut state = self.state();
        state.client.synchronize()?;
        state.tree = ConfigTree::new();
        state.signature = Signature::ZERO;
        state.accessed = false;
        state.changed = false;
        Ok(())
    }

    fn signature(&self) -> Result<Signature> {
        let mut state = self.state();
        state.ensure_loaded()?;
        Ok(state.signature)
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
