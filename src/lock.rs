//! Lock record and scope model (spec.md §3, §4.B).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use xmltree::Element;

use crate::errors::LockError;
use crate::webpath::LockPath;

/// Share mode of a lock (spec.md GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockShareMode {
    Exclusive,
    Shared,
}

impl LockShareMode {
    /// Parse the RFC 4918 keyword case-insensitively.
    pub fn parse(s: &str) -> Result<LockShareMode, LockError> {
        match s.to_ascii_lowercase().as_str() {
            "exclusive" => Ok(LockShareMode::Exclusive),
            "shared" => Ok(LockShareMode::Shared),
            other => Err(LockError::ProtocolError(format!("unknown lock scope {:?}", other))),
        }
    }

    pub fn is_exclusive(self) -> bool {
        matches!(self, LockShareMode::Exclusive)
    }
}

/// Access type of a lock. Only `write` exists per spec.md §1 Non-goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAccessType {
    Write,
}

impl LockAccessType {
    pub fn parse(s: &str) -> Result<LockAccessType, LockError> {
        match s.to_ascii_lowercase().as_str() {
            "write" => Ok(LockAccessType::Write),
            other => Err(LockError::ProtocolError(format!("unknown lock type {:?}", other))),
        }
    }
}

/// An immutable, currently-active lock (spec.md §3).
#[derive(Debug, Clone)]
pub struct ActiveLock {
    pub path: LockPath,
    pub href: String,
    pub recursive: bool,
    pub owner: Option<Element>,
    pub access_type: LockAccessType,
    pub share_mode: LockShareMode,
    pub timeout: Duration,
    pub issued_at: DateTime<Utc>,
    pub last_refreshed_at: DateTime<Utc>,
    pub state_token: String,
}

impl ActiveLock {
    /// Construct a lock, enforcing the invariants of spec.md §3.
    ///
    /// `issued_at` and `last_refreshed_at` start out equal; a refresh (see
    /// `refreshed`) is the only way to move `last_refreshed_at` forward.
    pub fn new(
        path: LockPath,
        href: String,
        recursive: bool,
        owner: Option<Element>,
        access_type: LockAccessType,
        share_mode: LockShareMode,
        timeout: Duration,
        state_token: String,
        issued_at: DateTime<Utc>,
    ) -> Result<ActiveLock, LockError> {
        if timeout.is_zero() {
            return Err(LockError::ProtocolError("timeout must be > 0".to_string()));
        }
        Ok(ActiveLock {
            path,
            href,
            recursive,
            owner,
            access_type,
            share_mode,
            timeout,
            issued_at,
            last_refreshed_at: issued_at,
            state_token,
        })
    }

    /// The moment this lock expires, absent a refresh.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_refreshed_at + chrono_duration_from_std(self.timeout)
    }

    /// Produce a refreshed copy: same identity fields, new timeout and
    /// `last_refreshed_at`. `ActiveLock` is otherwise never mutated in place
    /// (spec.md §3).
    pub fn refreshed(&self, timeout: Duration, now: DateTime<Utc>) -> ActiveLock {
        ActiveLock {
            last_refreshed_at: now,
            timeout,
            ..self.clone()
        }
    }
}

fn chrono_duration_from_std(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::seconds(i64::MAX / 1000))
}

/// Locks found around a query path, bucketed by the comparator (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct LockStatus {
    pub reference_locks: Vec<ActiveLock>,
    pub parent_locks: Vec<ActiveLock>,
    pub child_locks: Vec<ActiveLock>,
}

impl LockStatus {
    pub fn is_empty(&self) -> bool {
        self.reference_locks.is_empty() && self.parent_locks.is_empty() && self.child_locks.is_empty()
    }

    /// All locks found, in `parent ∥ reference ∥ child` order (spec.md §4.F
    /// `GetAffectedLocks`).
    pub fn flatten(&self) -> Vec<ActiveLock> {
        let mut v = Vec::with_capacity(
            self.parent_locks.len() + self.reference_locks.len() + self.child_locks.len(),
        );
        v.extend(self.parent_locks.iter().cloned());
        v.extend(self.reference_locks.iter().cloned());
        v.extend(self.child_locks.iter().cloned());
        v
    }
}

/// Transient per-path bundle used while evaluating `If` headers and refresh
/// (spec.md §3 `PathInfo`).
#[derive(Debug, Clone, Default)]
pub struct PathInfo {
    pub locks: Vec<ActiveLock>,
    pub tokens: HashMap<String, ActiveLock>,
    pub entity_tag: Option<String>,
}

impl PathInfo {
    pub fn from_locks(locks: Vec<ActiveLock>) -> PathInfo {
        let tokens = locks.iter().map(|l| (l.state_token.clone(), l.clone())).collect();
        PathInfo { locks, tokens, entity_tag: None }
    }

    pub fn token_set(&self) -> Vec<&str> {
        self.tokens.keys().map(String::as_str).collect()
    }
}
