//! Access control policies consulted before any backend call.

use std::fmt;

use crate::fs::Principal;

/// Kind of operation being checked
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    /// stat, directory listing, read-only open, size/free
    Read,
    /// Any operation that may modify the filesystem
    Write,
}

/// Pluggable predicate deciding whether a session may perform an access.
pub trait AccessPolicy: Send + Sync + fmt::Debug {
    /// `principal` is `None` for guest sessions.
    fn allows(&self, principal: Option<&Principal>, access: Access) -> bool;
}

/// Refuses everything
#[derive(Copy, Clone, Debug, Default)]
pub struct DenyAll;

impl AccessPolicy for DenyAll {
    fn allows(&self, _: Option<&Principal>, _: Access) -> bool {
        false
    }
}

/// Allows reads, refuses writes
#[derive(Copy, Clone, Debug, Default)]
pub struct ReadOnly;

impl AccessPolicy for ReadOnly {
    fn allows(&self, _: Option<&Principal>, access: Access) -> bool {
        access == Access::Read
    }
}

/// Allows everything
#[derive(Copy, Clone, Debug, Default)]
pub struct ReadWrite;

impl AccessPolicy for ReadWrite {
    fn allows(&self, _: Option<&Principal>, _: Access) -> bool {
        true
    }
}

/// Allows everything to authenticated sessions, nothing to guests
#[derive(Copy, Clone, Debug, Default)]
pub struct AuthenticatedOnly;

impl AccessPolicy for AuthenticatedOnly {
    fn allows(&self, principal: Option<&Principal>, _: Access) -> bool {
        principal.is_some()
    }
}

/// Named policy, as selected on a command line
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    DenyAll,
    ReadOnly,
    ReadWrite,
    AuthenticatedOnly,
}

impl PolicyKind {
    pub fn build(self) -> Box<dyn AccessPolicy> {
        match self {
            PolicyKind::DenyAll => Box::new(DenyAll),
            PolicyKind::ReadOnly => Box::new(ReadOnly),
            PolicyKind::ReadWrite => Box::new(ReadWrite),
            PolicyKind::AuthenticatedOnly => Box::new(AuthenticatedOnly),
        }
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deny" | "deny-all" => Ok(PolicyKind::DenyAll),
            "ro" | "read-only" => Ok(PolicyKind::ReadOnly),
            "rw" | "read-write" => Ok(PolicyKind::ReadWrite),
            "auth" | "authenticated-only" => Ok(PolicyKind::AuthenticatedOnly),
            other => Err(format!("unknown access policy: {}", other)),
        }
    }
}
