//! Command dispatch.
//!
//! Each connection owns at most one session, kept in the process-wide
//! [`SessionTable`] under the connection id. Every command is checked
//! against its required right before it touches any state, so a denied
//! command leaves the session exactly as it was.
//!
//! Dispatch is blocking (a `LOCK` with `wait` parks the calling thread) and
//! is meant to run off the async executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use prefstore_core::{ConfigTree, PrefsContext, PrefsError, Result, Session};
use prefstore_protocol::codec::encode_payload;
use prefstore_protocol::{
    AccessReply, AuthRequest, CodecError, Command, CommitReply, CommitRequest, Frame, LockRequest,
    OpenRequest, RefreshRequest, SecretReply, SecretRequest, SecretSetRequest, Status,
    PROTOCOL_VERSION,
};
use tracing::{debug, info, warn};

use crate::auth::{Authorizer, Credentials, Right};
use crate::secrets::{ResourceRefresher, SecretStore};

pub type ConnectionId = u64;

/// Sessions of every live connection.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<ConnectionId, Arc<Session>>>,
}

impl SessionTable {
    fn sessions(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.sessions().get(&id).cloned()
    }

    fn insert(&self, id: ConnectionId, session: Session) -> Result<Arc<Session>> {
        let mut sessions = self.sessions();
        if sessions.contains_key(&id) {
            return Err(PrefsError::BadArgument(
                "a session is already open on this connection".to_string(),
            ));
        }
        let session = Arc::new(session);
        sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Forget the session of `id`. Its lock is released once the last
    /// handle is gone.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.sessions().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a helper process shares between connections.
pub struct HelperContext {
    pub prefs: PrefsContext,
    pub authorizer: Arc<dyn Authorizer>,
    pub secrets: Arc<dyn SecretStore>,
    pub refresher: Arc<dyn ResourceRefresher>,
    pub sessions: SessionTable,
}

impl HelperContext {
    pub fn new(
        prefs: PrefsContext,
        authorizer: Arc<dyn Authorizer>,
        secrets: Arc<dyn SecretStore>,
        refresher: Arc<dyn ResourceRefresher>,
    ) -> Self {
        Self {
            prefs,
            authorizer,
            secrets,
            refresher,
            sessions: SessionTable::default(),
        }
    }
}

/// Per-connection state.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub credentials: Credentials,
}

impl ConnectionState {
    pub fn new(id: ConnectionId, credentials: Credentials) -> Self {
        Self { id, credentials }
    }
}

/// What the connection loop does after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(Frame),
    /// Send the frame, then close the connection.
    ReplyAndClose(Frame),
    /// Close without replying.
    Exit,
}

/// The right `command` requires, if any.
pub fn required_right(command: Command) -> Option<Right> {
    match command {
        Command::Open
        | Command::Unlock
        | Command::Close
        | Command::Synchronize
        | Command::Auth
        | Command::Exit => None,
        Command::Access | Command::Lock | Command::Commit | Command::Apply => Some(Right::Prefs),
        Command::SecretGet | Command::SecretSet | Command::SecretRemove => Some(Right::Secrets),
        Command::Refresh => Some(Right::Refresh),
    }
}

/// Handle one request frame.
pub fn dispatch(ctx: &HelperContext, conn: &mut ConnectionState, frame: &Frame) -> Outcome {
    let command = match frame.command() {
        Ok(command) => command,
        Err(err) => return protocol_error(conn, err),
    };

    if let Some(right) = required_right(command) {
        if !ctx.authorizer.check(&conn.credentials, right) {
            info!(
                "connection {}: {} denied, missing {:?}",
                conn.id, command, right
            );
            return Outcome::Reply(Frame::error(&PrefsError::AccessDenied));
        }
    }

    debug!("connection {}: {}", conn.id, command);
    match execute(ctx, conn, command, frame) {
        Ok(Some(outcome)) => outcome,
        Ok(None) => Outcome::Reply(Frame::response(Status::Ok, None)),
        Err(Failure::Codec(err)) => protocol_error(conn, err),
        Err(Failure::Prefs(PrefsError::Protocol(message))) => {
            warn!("connection {}: {}", conn.id, message);
            Outcome::ReplyAndClose(Frame::error(&PrefsError::Protocol(message)))
        }
        Err(Failure::Prefs(err)) => {
            debug!("connection {}: {} failed: {}", conn.id, command, err);
            Outcome::Reply(Frame::error(&err))
        }
    }
}

fn protocol_error(conn: &ConnectionState, err: CodecError) -> Outcome {
    warn!("connection {}: protocol error: {}", conn.id, err);
    Outcome::ReplyAndClose(Frame::error(&PrefsError::Protocol(err.to_string())))
}

enum Failure {
    Codec(CodecError),
    Prefs(PrefsError),
}

impl From<CodecError> for Failure {
    fn from(err: CodecError) -> Self {
        Failure::Codec(err)
    }
}

impl From<PrefsError> for Failure {
    fn from(err: PrefsError) -> Self {
        Failure::Prefs(err)
    }
}

fn reply<T: serde::Serialize>(value: &T) -> std::result::Result<Option<Outcome>, Failure> {
    let payload = encode_payload(value)?;
    Ok(Some(Outcome::Reply(Frame::response(Status::Ok, Some(payload)))))
}

fn session(ctx: &HelperContext, conn: &ConnectionState) -> Result<Arc<Session>> {
    ctx.sessions
        .get(conn.id)
        .ok_or_else(|| PrefsError::NotFound("no session open on this connection".to_string()))
}

fn execute(
    ctx: &HelperContext,
    conn: &mut ConnectionState,
    command: Command,
    frame: &Frame,
) -> std::result::Result<Option<Outcome>, Failure> {
    match command {
        Command::Open => {
            let request: OpenRequest = frame.decode()?;
            if request.version != PROTOCOL_VERSION {
                return Err(PrefsError::Protocol(format!(
                    "unsupported protocol version {}",
                    request.version
                ))
                .into());
            }
            let path = ctx
                .prefs
                .settings()
                .confined_path_for(request.prefs_id.as_deref())?;
            let session = Session::open_path(&ctx.prefs, &request.name, path)?;
            let session = ctx.sessions.insert(conn.id, session)?;
            info!(
                "connection {}: opened {} as {}",
                conn.id,
                session.path().display(),
                request.name
            );
            Ok(None)
        }
        Command::Access => {
            let session = session(ctx, conn)?;
            let signature = session.signature()?;
            let tree = session.tree()?;
            reply(&AccessReply {
                signature,
                tree: tree.root().clone(),
            })
        }
        Command::Lock => {
            let request: LockRequest = frame.decode()?;
            let session = session(ctx, conn)?;
            session.lock_expecting(request.wait, request.expected_signature.as_ref())?;
            Ok(None)
        }
        Command::Commit => {
            let request: CommitRequest = match frame.payload {
                Some(_) => frame.decode()?,
                None => CommitRequest::default(),
            };
            let session = session(ctx, conn)?;
            if let Some(tree) = request.tree {
                session.replace_tree(ConfigTree::from_mapping(tree))?;
            }
            let signature = session.commit()?;
            reply(&CommitReply { signature })
        }
        Command::Apply => {
            session(ctx, conn)?.apply()?;
            Ok(None)
        }
        Command::Unlock => {
            session(ctx, conn)?.unlock()?;
            Ok(None)
        }
        Command::Close => {
            if ctx.sessions.remove(conn.id).is_some() {
                debug!("connection {}: session closed", conn.id);
            }
            Ok(None)
        }
        Command::Synchronize => {
            session(ctx, conn)?.synchronize()?;
            Ok(None)
        }
        Command::SecretGet => {
            let request: SecretRequest = frame.decode()?;
            let data = ctx.secrets.get(&request.id)?;
            reply(&SecretReply { data })
        }
        Command::SecretSet => {
            let request: SecretSetRequest = frame.decode()?;
            ctx.secrets.set(&request.id, &request.data)?;
            Ok(None)
        }
        Command::SecretRemove => {
            let request: SecretRequest = frame.decode()?;
            ctx.secrets.remove(&request.id)?;
            Ok(None)
        }
        Command::Refresh => {
            let request: RefreshRequest = frame.decode()?;
            ctx.refresher.refresh(&request.resource)?;
            Ok(None)
        }
        Command::Auth => {
            let request: AuthRequest = frame.decode()?;
            conn.credentials.token = Some(request.token);
            Ok(None)
        }
        Command::Exit => Ok(Some(Outcome::Exit)),
    }
}
