//! Minimal collaborator surface the lock core needs from a filesystem
//! backend (spec.md §1 Non-goals, §13).
//!
//! The lock core does not ship a filesystem implementation; this trait is
//! the whole of what `If` header entity-tag evaluation needs from one.

use crate::backend::BackendFuture;
use crate::webpath::LockPath;

/// Read-only view of resource existence and identity a caller's filesystem
/// layer must provide so `IfHeader::evaluate` can resolve entity-tag
/// conditions.
pub trait ResourceStore: Send + Sync {
    fn exists<'a>(&'a self, path: &'a LockPath) -> BackendFuture<'a, bool>;

    /// The resource's current strong entity-tag, if it has one and exists.
    fn entity_tag<'a>(&'a self, path: &'a LockPath) -> BackendFuture<'a, Option<String>>;
}
