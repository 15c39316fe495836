//! Authorization for helper commands.

use std::collections::{HashMap, HashSet};

/// Rights a command may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Right {
    /// Lock, commit, apply and read documents.
    Prefs,
    /// Read and write the secret store.
    Secrets,
    /// Ask the helper to refresh a resource.
    Refresh,
}

/// What the helper knows about a connected client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Peer user id, when the transport reports one.
    pub uid: Option<u32>,
    /// Token installed with `AUTH`.
    pub token: Option<String>,
}

impl Credentials {
    pub fn from_uid(uid: Option<u32>) -> Self {
        Self { uid, token: None }
    }
}

/// Decides whether a client may exercise a right.
pub trait Authorizer: Send + Sync {
    fn check(&self, credentials: &Credentials, right: Right) -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn check(&self, _credentials: &Credentials, _right: Right) -> bool {
        true
    }
}

/// Grants nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn check(&self, _credentials: &Credentials, _right: Right) -> bool {
        false
    }
}

/// Grants rights per token, and every right to trusted peer uids.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthorizer {
    tokens: HashMap<String, HashSet<Right>>,
    trusted_uids: HashSet<u32>,
}

impl TokenAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `rights` to clients presenting `token`.
    pub fn grant(mut self, token: impl Into<String>, rights: &[Right]) -> Self {
        self.tokens
            .entry(token.into())
            .or_default()
            .extend(rights.iter().copied());
        self
    }

    /// Trust every client running as `uid`.
    pub fn trust_uid(mut self, uid: u32) -> Self {
        self.trusted_uids.insert(uid);
        self
    }
}

impl Authorizer for TokenAuthorizer {
    fn check(&self, credentials: &Credentials, right: Right) -> bool {
        if let Some(uid) = credentials.uid {
            if self.trusted_uids.contains(&uid) {
                return true;
            }
        }

        credentials
            .token
            .as_ref()
            .and_then(|token| self.tokens.get(token))
            .is_some_and(|rights| rights.contains(&right))
    }
}
