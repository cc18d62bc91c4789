//! In-memory lock storage backends.
//!
//! `MemoryBackend` is grounded on the teacher's in-memory lock table: a
//! single mutex-guarded map keyed by state token, with share-mode conflict
//! bookkeeping left to the manager. `NullBackend` is grounded on the
//! teacher's no-op lock system used in tests and read-only deployments: it
//! accepts lock requests but never actually grants or enforces them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::backend::{BackendFuture, LockBackend, LockTransaction};
use crate::errors::LockResult;
use crate::lock::ActiveLock;
use crate::webpath::LockPath;

/// A simple, fully in-process lock table. Suitable for a single-process
/// server or for tests; not shared across processes.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    table: Arc<Mutex<HashMap<String, ActiveLock>>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }
}

enum Mutation {
    Upsert(ActiveLock),
    Remove(String),
}

/// A transaction against `MemoryBackend`. Holds the table's mutex for its
/// entire lifetime, so `begin` effectively serializes writers; mutations
/// are buffered in `pending` and only applied to the shared table on
/// `commit`, so a dropped, uncommitted transaction leaves the table
/// untouched.
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<HashMap<String, ActiveLock>>,
    pending: Vec<Mutation>,
}

impl MemoryTransaction {
    fn view(&self, state_token: &str) -> Option<ActiveLock> {
        for mutation in self.pending.iter().rev() {
            match mutation {
                Mutation::Upsert(lock) if lock.state_token == state_token => return Some(lock.clone()),
                Mutation::Remove(token) if token == state_token => return None,
                _ => {},
            }
        }
        self.guard.get(state_token).cloned()
    }

    fn all_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.guard.keys().cloned().collect();
        for mutation in &self.pending {
            match mutation {
                Mutation::Upsert(lock) if !tokens.contains(&lock.state_token) => tokens.push(lock.state_token.clone()),
                Mutation::Remove(token) => tokens.retain(|t| t != token),
                _ => {},
            }
        }
        tokens
    }
}

impl LockBackend for MemoryBackend {
    fn begin<'a>(&'a self, _write: bool) -> BackendFuture<'a, LockResult<Box<dyn LockTransaction + 'a>>> {
        Box::pin(async move {
            let guard = self.table.clone().lock_owned().await;
            let txn: Box<dyn LockTransaction> = Box::new(MemoryTransaction { guard, pending: Vec::new() });
            Ok(txn)
        })
    }
}

impl LockTransaction for MemoryTransaction {
    fn get_active_locks<'a>(&'a mut self) -> BackendFuture<'a, LockResult<Vec<ActiveLock>>> {
        Box::pin(async move { Ok(self.all_tokens().into_iter().filter_map(|t| self.view(&t)).collect()) })
    }

    fn get<'a>(&'a mut self, state_token: &'a str) -> BackendFuture<'a, LockResult<Option<ActiveLock>>> {
        Box::pin(async move { Ok(self.view(state_token)) })
    }

    fn add<'a>(&'a mut self, lock: ActiveLock) -> BackendFuture<'a, LockResult<bool>> {
        Box::pin(async move {
            let existed = self.view(&lock.state_token).is_some();
            if !existed {
                self.pending.push(Mutation::Upsert(lock));
            }
            Ok(!existed)
        })
    }

    fn update<'a>(&'a mut self, lock: ActiveLock) -> BackendFuture<'a, LockResult<bool>> {
        Box::pin(async move {
            let existed = self.view(&lock.state_token).is_some();
            self.pending.push(Mutation::Upsert(lock));
            Ok(existed)
        })
    }

    fn remove<'a>(&'a mut self, state_token: &'a str) -> BackendFuture<'a, LockResult<bool>> {
        Box::pin(async move {
            let existed = self.view(state_token).is_some();
            self.pending.push(Mutation::Remove(state_token.to_string()));
            Ok(existed)
        })
    }

    fn commit<'a>(&'a mut self) -> BackendFuture<'a, LockResult<()>> {
        Box::pin(async move {
            for mutation in self.pending.drain(..) {
                match mutation {
                    Mutation::Upsert(lock) => {
                        self.guard.insert(lock.state_token.clone(), lock);
                    },
                    Mutation::Remove(token) => {
                        self.guard.remove(&token);
                    },
                }
            }
            Ok(())
        })
    }
}

/// A backend that discards every mutation and reports no locks ever held.
/// Useful for read-only mounts or tests that want lock requests to succeed
/// trivially without any conflict bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

struct NullTransaction;

impl LockBackend for NullBackend {
    fn begin<'a>(&'a self, _write: bool) -> BackendFuture<'a, LockResult<Box<dyn LockTransaction + 'a>>> {
        Box::pin(async move {
            let txn: Box<dyn LockTransaction> = Box::new(NullTransaction);
            Ok(txn)
        })
    }
}

impl LockTransaction for NullTransaction {
    fn get_active_locks<'a>(&'a mut self) -> BackendFuture<'a, LockResult<Vec<ActiveLock>>> {
        Box::pin(async move { Ok(Vec::new()) })
    }

    fn get<'a>(&'a mut self, _state_token: &'a str) -> BackendFuture<'a, LockResult<Option<ActiveLock>>> {
        Box::pin(async move { Ok(None) })
    }

    fn add<'a>(&'a mut self, _lock: ActiveLock) -> BackendFuture<'a, LockResult<bool>> {
        Box::pin(async move { Ok(true) })
    }

    fn update<'a>(&'a mut self, _lock: ActiveLock) -> BackendFuture<'a, LockResult<bool>> {
        Box::pin(async move { Ok(false) })
    }

    fn remove<'a>(&'a mut self, _state_token: &'a str) -> BackendFuture<'a, LockResult<bool>> {
        Box::pin(async move { Ok(false) })
    }

    fn commit<'a>(&'a mut self) -> BackendFuture<'a, LockResult<()>> {
        Box::pin(async move { Ok(()) })
    }
}
