//! Abstract storage transaction interface (spec.md §4.C, §9).
//!
//! Mirrors the boxed-future shape of the real lock-system trait: methods
//! return `Pin<Box<dyn Future<...> + Send>>` rather than depending on
//! `async-trait`, so the trait stays object-safe and the crate stays free of
//! a proc-macro dependency.

use std::future::Future;
use std::pin::Pin;

use crate::errors::LockResult;
use crate::lock::ActiveLock;

/// Boxed future returned by every `LockTransaction`/`LockBackend` method.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens transactions against a storage backend. A backend owns the
/// authoritative lock table; `LockManager` never keeps its own copy.
pub trait LockBackend: Send + Sync {
    /// Begin a transaction. `write` requests a transaction that may call
    /// the mutating methods; read-only callers should pass `false` so a
    /// backend can take a cheaper lock internally.
    fn begin<'a>(&'a self, write: bool) -> BackendFuture<'a, LockResult<Box<dyn LockTransaction + 'a>>>;
}

/// A single unit-of-work against the lock table.
///
/// Mutations (`add`, `update`, `remove`) are only durable once `commit`
/// resolves; dropping a transaction without calling `commit` discards them.
/// This mirrors ordinary RDBMS transaction semantics and lets
/// `LockManager` perform read-conflict-check-write as one atomic step. The
/// manager does all comparator-based scope filtering itself; a backend
/// only needs to hand back its full lock set.
pub trait LockTransaction: Send {
    /// Every currently active lock known to the backend.
    fn get_active_locks<'a>(&'a mut self) -> BackendFuture<'a, LockResult<Vec<ActiveLock>>>;

    /// Look up a single lock by its opaque state token, if still present.
    fn get<'a>(&'a mut self, state_token: &'a str) -> BackendFuture<'a, LockResult<Option<ActiveLock>>>;

    /// Insert a newly-issued lock. Returns `true` if inserted, `false` if
    /// the token was already present (and left untouched).
    fn add<'a>(&'a mut self, lock: ActiveLock) -> BackendFuture<'a, LockResult<bool>>;

    /// Upsert a lock's record (used by refresh). Returns `true` if an
    /// existing `state_token` was replaced, `false` if inserted anew.
    fn update<'a>(&'a mut self, lock: ActiveLock) -> BackendFuture<'a, LockResult<bool>>;

    /// Remove a lock by token. Returns `true` if it was present.
    fn remove<'a>(&'a mut self, state_token: &'a str) -> BackendFuture<'a, LockResult<bool>>;

    /// Commit the transaction, making prior mutations durable. A
    /// transaction dropped without a call to `commit` discards its
    /// mutations; backends implement this via their own guard/rollback
    /// type, not via this trait.
    fn commit<'a>(&'a mut self) -> BackendFuture<'a, LockResult<()>>;
}
