//! Helper server.
//!
//! This module provides the Unix socket server that handles:
//! - Client connections, each in its own task
//! - Request/response framing
//! - Running blocking session operations off the executor
//! - Releasing a connection's session when it goes away

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use prefstore_protocol::codec::{parse_header, HEADER_LEN};
use prefstore_protocol::{Frame, FrameError};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::auth::Credentials;
use crate::dispatch::{dispatch, ConnectionId, ConnectionState, HelperContext, Outcome};

/// Errors that stop the server or a connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("dispatch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The helper server.
pub struct HelperServer {
    ctx: Arc<HelperContext>,
    next_id: AtomicU64,
}

impl HelperServer {
    pub fn new(ctx: HelperContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn context(&self) -> &Arc<HelperContext> {
        &self.ctx
    }

    /// Bind `socket_path`, replacing a stale socket file, and serve forever.
    pub async fn run(self, socket_path: &Path) -> Result<(), ServerError> {
        let listener = bind(socket_path)?;
        info!("prefstore helper listening on {}", socket_path.display());
        self.serve(listener).await
    }

    /// Accept connections on `listener` until it fails.
    pub async fn serve(self, listener: UnixListener) -> Result<(), ServerError> {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let ctx = self.ctx.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, id, ctx.clone()).await {
                            error!("connection {} error: {}", id, e);
                        }
                        // dropping the session releases its lock
                        if ctx.sessions.remove(id).is_some() {
                            debug!("connection {}: session released", id);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Bind a Unix listener, removing a leftover socket file first.
pub fn bind(socket_path: &Path) -> Result<UnixListener, ServerError> {
    match std::fs::remove_file(socket_path) {
        Ok(()) => debug!("removed stale socket {}", socket_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(dir) = socket_path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(UnixListener::bind(socket_path)?)
}

/// Handle a single client connection.
async fn handle_connection(
    stream: UnixStream,
    id: ConnectionId,
    ctx: Arc<HelperContext>,
) -> Result<(), ServerError> {
    let uid = stream.peer_cred().ok().map(|cred| cred.uid());
    info!("New connection {} (uid {:?})", id, uid);

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut conn = ConnectionState::new(id, Credentials::from_uid(uid));

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(FrameError::Closed) => {
                info!("Client {} disconnected", id);
                break;
            }
            Err(FrameError::TooLarge(len)) => {
                warn!("connection {}: oversized frame ({} bytes)", id, len);
                break;
            }
            Err(e) => return Err(e.into()),
        };

        let (state, outcome) = run_command(&ctx, conn, frame, &mut reader).await?;
        conn = state;

        match outcome {
            Outcome::Reply(reply) => {
                writer.write_all(&reply.encode()?).await?;
            }
            Outcome::ReplyAndClose(reply) => {
                writer.write_all(&reply.encode()?).await?;
                warn!("closing connection {} after protocol error", id);
                break;
            }
            Outcome::Exit => {
                debug!("connection {} exited", id);
                break;
            }
        }
    }

    Ok(())
}

/// Dispatch `frame` on the blocking pool. If the client hangs up while the
/// command is still running, a blocked lock wait is interrupted.
async fn run_command(
    ctx: &Arc<HelperContext>,
    mut conn: ConnectionState,
    frame: Frame,
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<(ConnectionState, Outcome), ServerError> {
    let id = conn.id;
    let task_ctx = ctx.clone();
    let call = tokio::task::spawn_blocking(move || {
        let outcome = dispatch(&task_ctx, &mut conn, &frame);
        (conn, outcome)
    });
    tokio::pin!(call);

    let mut watching = true;
    loop {
        tokio::select! {
            result = &mut call => return Ok(result?),
            hangup = async { reader.fill_buf().await.map(|buf| buf.is_empty()) }, if watching => {
                watching = false;
                // data that is already buffered stays for the next read
                if hangup.unwrap_or(true) {
                    if let Some(session) = ctx.sessions.get(id) {
                        debug!("connection {} hung up mid-command, interrupting", id);
                        session.interrupt_wait();
                    }
                }
            }
        }
    }
}

async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Closed
        } else {
            FrameError::Io(e)
        });
    }

    let (code, len) = parse_header(&header)?;
    let payload = match len {
        None => None,
        Some(len) => {
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload).await?;
            Some(payload)
        }
    };
    Ok(Frame { code, payload })
}

