//! Error kinds surfaced by the lock core (spec.md §7).

use std::error::Error;
use std::fmt;

use crate::lock::LockStatus;

/// Everything the lock core can report back to a caller.
///
/// `Conflict` and friends are not exceptional in the Rust sense — callers
/// match on them to build the appropriate WebDAV response — but modeling
/// them as an error lets `?` compose cleanly through the manager's
/// transaction-shaped internals.
#[derive(Debug, Clone)]
pub enum LockError {
    /// A candidate lock conflicts with the current lock set.
    Conflict(LockStatus),
    /// The referenced lock does not exist.
    NoLock,
    /// `release` was asked to drop a lock using a path outside its scope.
    InvalidLockRange,
    /// Malformed `If` header or unknown share/access keyword.
    ProtocolError(String),
    /// The backend transaction failed; the caller may retry.
    BackendFailure(String),
    /// Cooperative cancellation observed at a suspension point.
    Cancelled,
    /// `refresh` found no list in the `If` header it could satisfy;
    /// carries the hrefs of the resources that failed, to be reported
    /// under the `lock-token-matches-request-uri` precondition code.
    RefreshFailed(Vec<String>),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockError::Conflict(status) => write!(
                f,
                "lock conflict: {} reference, {} parent, {} child lock(s)",
                status.reference_locks.len(),
                status.parent_locks.len(),
                status.child_locks.len()
            ),
            LockError::NoLock => write!(f, "no such lock"),
            LockError::InvalidLockRange => write!(f, "lock token does not match request path"),
            LockError::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            LockError::BackendFailure(msg) => write!(f, "backend failure: {}", msg),
            LockError::Cancelled => write!(f, "operation cancelled"),
            LockError::RefreshFailed(hrefs) => {
                write!(f, "lock-token-matches-request-uri: refresh failed for {}", hrefs.join(", "))
            },
        }
    }
}

impl Error for LockError {}

/// Result alias used throughout the crate.
pub type LockResult<T> = std::result::Result<T, LockError>;
