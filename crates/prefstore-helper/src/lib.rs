//! # prefstore-helper
//!
//! Privileged helper for prefstore, with pluggable runtime.
//!
//! The helper owns sessions on behalf of clients that cannot write the
//! preference documents themselves. It checks every command against an
//! [`Authorizer`] before running it.
//!
//! Enable features based on target platform:
//! - `tokio-runtime` (default) - the Unix socket server

pub mod auth;
pub mod dispatch;
pub mod secrets;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod prefs;
#[cfg(all(unix, feature = "tokio-runtime"))]
pub mod server;

pub use auth::{AllowAll, Authorizer, Credentials, DenyAll, Right, TokenAuthorizer};
#[cfg(unix)]
pub use client::{HelperClient, RemoteSession};
pub use dispatch::{HelperContext, SessionTable};
#[cfg(unix)]
pub use prefs::{open_preferences, open_preferences_with_token};
pub use secrets::{LoggingRefresher, MemorySecretStore, ResourceRefresher, SecretStore};
#[cfg(all(unix, feature = "tokio-runtime"))]
pub use server::{HelperServer, ServerError};
