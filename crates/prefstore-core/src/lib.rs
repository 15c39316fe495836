//! # prefstore-core
//!
//! Core configuration store: the path-addressed tree, file signatures,
//! sessions, the lock protocol and the commit engine.
//!
//! This crate provides:
//! - The `Value` model and the link-resolving `ConfigTree`
//! - Path parsing and broadcast key patterns
//! - File `Signature`s for optimistic concurrency
//! - `Session` with lock/commit/apply on top of a `BroadcastStore`
//! - An in-process broadcast hub for single-process deployments and tests
//!
//! This crate is intentionally runtime-agnostic and contains no async code.
//! Blocking calls (`Session::lock` with `wait`) are expected to run on a
//! thread the caller can afford to park.

pub mod broadcast;
pub mod codec;
pub mod commit;
pub mod config;
pub mod error;
pub mod lock;
pub mod model;
pub mod path;
pub mod session;
pub mod signature;
pub mod tree;

pub use broadcast::{BroadcastService, BroadcastStore, MemoryBroadcastHub, NotificationKind};
pub use config::PrefsSettings;
pub use error::{PrefsError, Result};
pub use model::{Mapping, Scalar, Value};
pub use path::{KeyPattern, TreePath};
pub use session::{ChangeWatcher, Preferences, PrefsContext, PrefsNotification, Session};
pub use signature::Signature;
pub use tree::ConfigTree;
