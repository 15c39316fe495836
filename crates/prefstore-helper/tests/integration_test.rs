//! Integration tests for the prefstore helper.
//!
//! These tests start an actual helper on a Unix socket and drive it with the
//! blocking client from the blocking pool.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use prefstore_core::{Preferences, PrefsContext, PrefsError, PrefsSettings, Session, Value};
use prefstore_helper::server::bind;
use prefstore_helper::{
    open_preferences, AllowAll, Authorizer, HelperClient, HelperContext, HelperServer,
    LoggingRefresher, MemorySecretStore, RemoteSession, Right, TokenAuthorizer,
};
use prefstore_protocol::codec::{encode_payload, read_frame, write_frame};
use prefstore_protocol::{Command, Frame, FrameError, LockRequest, OpenRequest, Status};

struct TestHelper {
    dir: TempDir,
    socket: PathBuf,
    ctx: Arc<HelperContext>,
    refresher: Arc<LoggingRefresher>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestHelper {
    fn prefs(&self) -> &PrefsContext {
        &self.ctx.prefs
    }

    fn document(&self) -> PathBuf {
        self.prefs().settings().path_for(None)
    }
}

impl Drop for TestHelper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start a helper on a socket inside a fresh temp dir.
async fn start_helper(authorizer: Arc<dyn Authorizer>) -> TestHelper {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("helper.sock");
    let settings = PrefsSettings {
        helper_socket: socket.clone(),
        ..PrefsSettings::with_prefs_dir(dir.path().join("prefs"))
    };

    let refresher = Arc::new(LoggingRefresher::new());
    let ctx = HelperContext::new(
        PrefsContext::in_memory(settings),
        authorizer,
        Arc::new(MemorySecretStore::new()),
        refresher.clone(),
    );
    let server = HelperServer::new(ctx);
    let ctx = server.context().clone();

    let listener = bind(&socket).unwrap();
    let handle = tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestHelper {
        dir,
        socket,
        ctx,
        refresher,
        handle,
    }
}

/// Run a blocking closure with a timeout.
async fn blocking<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    timeout(Duration::from_secs(5), tokio::task::spawn_blocking(f))
        .await
        .expect("timed out")
        .expect("blocking task panicked")
}

/// Wait until the helper has forgotten every session.
async fn wait_for_no_sessions(helper: &TestHelper) {
    timeout(Duration::from_secs(5), async {
        while !helper.ctx.sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions were not released");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_commit_visible_locally() {
    let helper = start_helper(Arc::new(AllowAll)).await;
    let socket = helper.socket.clone();

    let signature = blocking(move || {
        let remote = RemoteSession::open(&socket, "remote", None, None).unwrap();
        remote.set("/Sets/0/Name", Value::from("Home")).unwrap();
        remote.set_link("/CurrentSet", "/Sets/0").unwrap();
        remote.lock(true).unwrap();
        let signature = remote.commit().unwrap();
        remote.apply().unwrap();
        remote.unlock().unwrap();
        signature
    })
    .await;

    let local = Session::open(helper.prefs(), "local", None).unwrap();
    assert_eq!(local.signature().unwrap(), signature);
    assert_eq!(local.get("/CurrentSet/Name").unwrap(), Value::from("Home"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_without_lock_takes_it() {
    let helper = start_helper(Arc::new(AllowAll)).await;
    let socket = helper.socket.clone();

    blocking(move || {
        let remote = RemoteSession::open(&socket, "remote", None, None).unwrap();
        remote.set("/k", Value::from(1)).unwrap();
        remote.commit().unwrap();
        assert!(!remote.is_locked());
        assert_eq!(remote.get("/k").unwrap(), Value::from(1));
    })
    .await;

    assert!(helper.document().exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_denied_commit_leaves_state_unchanged() {
    let helper = start_helper(Arc::new(TokenAuthorizer::new())).await;
    let socket = helper.socket.clone();

    blocking(move || {
        let remote = RemoteSession::open(&socket, "untrusted", None, None).unwrap();
        assert!(matches!(remote.lock(false), Err(PrefsError::AccessDenied)));
        assert!(matches!(remote.get("/k"), Err(PrefsError::AccessDenied)));
        assert!(!remote.is_locked());
    })
    .await;

    assert!(!helper.document().exists());
    let local = Session::open(helper.prefs(), "local", None).unwrap();
    local.lock(false).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_token_grants_rights() {
    let authorizer = TokenAuthorizer::new()
        .grant("netconf", &[Right::Prefs, Right::Refresh])
        .grant("keychain", &[Right::Secrets]);
    let helper = start_helper(Arc::new(authorizer)).await;
    let socket = helper.socket.clone();

    blocking(move || {
        let mut client = HelperClient::connect(&socket).unwrap();
        assert!(matches!(
            client.secret_set("wifi", b"pw"),
            Err(PrefsError::AccessDenied)
        ));

        client.authenticate("netconf").unwrap();
        client.refresh("en0").unwrap();
        assert!(matches!(
            client.secret_get("wifi"),
            Err(PrefsError::AccessDenied)
        ));

        client.authenticate("keychain").unwrap();
        client.secret_set("wifi", b"pw").unwrap();
        assert_eq!(client.secret_get("wifi").unwrap(), b"pw");
        client.secret_remove("wifi").unwrap();
        assert!(matches!(
            client.secret_get("wifi"),
            Err(PrefsError::NotFound(_))
        ));
        client.exit().unwrap();
    })
    .await;

    assert_eq!(helper.refresher.refreshed(), vec!["en0"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lock_released_when_client_disconnects() {
    let helper = start_helper(Arc::new(AllowAll)).await;
    let socket = helper.socket.clone();

    blocking(move || {
        let first = RemoteSession::open(&socket, "first", None, None).unwrap();
        let second = RemoteSession::open(&socket, "second", None, None).unwrap();

        first.lock(false).unwrap();
        assert!(matches!(second.lock(false), Err(PrefsError::Busy)));
    })
    .await;

    wait_for_no_sessions(&helper).await;
    let local = Session::open(helper.prefs(), "local", None).unwrap();
    local.lock(false).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_open_preferences_shares_the_helper_lock() {
    let helper = start_helper(Arc::new(AllowAll)).await;
    // a separate broadcast hub stands in for another process
    let client_ctx = PrefsContext::in_memory(helper.prefs().settings().clone());

    let prefs = blocking(move || {
        let prefs = open_preferences(&client_ctx, "app", None).unwrap();
        prefs.lock(false).unwrap();
        prefs
    })
    .await;

    let local = Session::open(helper.prefs(), "local", None).unwrap();
    assert!(matches!(local.lock(false), Err(PrefsError::Busy)));

    blocking(move || drop(prefs)).await;
    wait_for_no_sessions(&helper).await;
    local.lock(false).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocked_lock_interrupted_on_disconnect() {
    let helper = start_helper(Arc::new(AllowAll)).await;
    let holder = Session::open(helper.prefs(), "holder", None).unwrap();
    holder.lock(false).unwrap();

    let socket = helper.socket.clone();
    blocking(move || {
        let mut stream = UnixStream::connect(&socket).unwrap();
        let open = OpenRequest::new("waiter", None);
        write_frame(
            &mut stream,
            &Frame::request(Command::Open, Some(encode_payload(&open).unwrap())),
        )
        .unwrap();
        assert_eq!(read_frame(&mut stream).unwrap().code, Status::Ok.code());

        let lock = LockRequest {
            wait: true,
            expected_signature: None,
        };
        write_frame(
            &mut stream,
            &Frame::request(Command::Lock, Some(encode_payload(&lock).unwrap())),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        // hang up while the helper is waiting for the lock
    })
    .await;

    wait_for_no_sessions(&helper).await;
    assert!(holder.is_locked());
    holder.unlock().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_waiting_lock_granted_after_release() {
    let helper = start_helper(Arc::new(AllowAll)).await;
    let holder = Arc::new(Session::open(helper.prefs(), "holder", None).unwrap());
    holder.lock(false).unwrap();

    let socket = helper.socket.clone();
    let waiter = tokio::task::spawn_blocking(move || {
        let remote = RemoteSession::open(&socket, "waiter", None, None).unwrap();
        remote.lock(true).map(|()| remote.is_locked())
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    holder.unlock().unwrap();

    let locked = timeout(Duration::from_secs(5), waiter)
        .await
        .expect("timed out")
        .unwrap()
        .unwrap();
    assert!(locked);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_remote_copy() {
    let helper = start_helper(Arc::new(AllowAll)).await;
    let socket = helper.socket.clone();

    let remote = blocking(move || {
        let remote = RemoteSession::open(&socket, "remote", None, None).unwrap();
        assert!(remote.tree().unwrap().is_empty());
        remote
    })
    .await;

    let local = Session::open(helper.prefs(), "local", None).unwrap();
    local.set("/Owner", Value::from("local")).unwrap();
    local.commit().unwrap();

    blocking(move || {
        assert!(matches!(remote.lock(false), Err(PrefsError::Stale)));
        remote.synchronize().unwrap();
        remote.lock(false).unwrap();
        assert_eq!(remote.get("/Owner").unwrap(), Value::from("local"));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_command_closes_only_that_connection() {
    let helper = start_helper(Arc::new(AllowAll)).await;
    let socket = helper.socket.clone();

    blocking(move || {
        let good = RemoteSession::open(&socket, "good", None, None).unwrap();

        let mut bad = UnixStream::connect(&socket).unwrap();
        write_frame(
            &mut bad,
            &Frame {
                code: 4242,
                payload: None,
            },
        )
        .unwrap();
        let reply = read_frame(&mut bad).unwrap();
        assert_eq!(reply.code, Status::Protocol.code());
        assert!(matches!(read_frame(&mut bad), Err(FrameError::Closed)));

        good.set("/still", Value::from(true)).unwrap();
        good.commit().unwrap();
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_clients() {
    let helper = start_helper(Arc::new(AllowAll)).await;

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let socket = helper.socket.clone();
            tokio::task::spawn_blocking(move || {
                let doc = format!("doc{i}.json");
                let remote =
                    RemoteSession::open(&socket, &format!("c{i}"), Some(doc.as_str()), None).unwrap();
                remote.set("/Index", Value::from(i as i64)).unwrap();
                remote.commit().unwrap();
            })
        })
        .collect();

    for task in tasks {
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    for i in 0..8 {
        let doc = format!("doc{i}.json");
        let local = Session::open(helper.prefs(), "check", Some(doc.as_str())).unwrap();
        assert_eq!(local.get("/Index").unwrap(), Value::from(i as i64));
    }
}
