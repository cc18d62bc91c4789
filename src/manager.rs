//! The lock manager: orchestrates path comparison, conflict analysis, `If`
//! evaluation plumbing, backend transactions, the cleanup actor, and the
//! event channel into the operations of spec.md §4.F.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio_util::sync::CancellationToken;
use xmltree::Element;

use crate::backend::{BackendFuture, LockBackend};
use crate::cleanup::{CleanupActor, ExpiryHandler};
use crate::clock::{Clock, RoundingPolicy, SystemClock};
use crate::conditional::{IfCondition, IfHeader};
use crate::conflict::{self, LockRequest};
use crate::errors::{LockError, LockResult};
use crate::events::{EventChannel, LockEvent};
use crate::filesystem::ResourceStore;
use crate::lock::{ActiveLock, LockAccessType, LockShareMode, LockStatus, PathInfo};
use crate::memory::MemoryBackend;
use crate::webpath::{self, LockPath, PathRelation};

fn new_state_token() -> String {
    format!("opaquelocktoken:{}", uuid::Uuid::new_v4())
}

/// Checked at every suspension point of a public operation. Cancellation
/// observed before a transaction commits is equivalent to rollback; once
/// `check_cancelled` has returned `Ok` past the commit point, a caller has
/// committed to the side effect and only post-commit notification can still
/// be suppressed.
fn check_cancelled(cancel: &CancellationToken) -> LockResult<()> {
    if cancel.is_cancelled() {
        return Err(LockError::Cancelled);
    }
    Ok(())
}

/// Outcome of [`LockManager::lock_implicit`] (spec.md §4.F, §9 "tagged sum
/// types").
#[derive(Debug, Clone)]
pub enum ImplicitLock {
    /// A brand-new lock was acquired.
    Fresh(ActiveLock),
    /// The request is already covered by one or more of the client's
    /// existing lock tokens; no new lock was created.
    ViaExisting(Vec<ActiveLock>),
}

/// Builds a `LockManager` with a chosen backend, clock, and rounding
/// policy, mirroring the `DavHandler::builder()` pattern.
pub struct LockManagerBuilder {
    backend: Option<Arc<dyn LockBackend>>,
    clock: Arc<dyn Clock>,
    rounding: RoundingPolicy,
    event_capacity: usize,
}

impl LockManagerBuilder {
    pub fn new() -> LockManagerBuilder {
        LockManagerBuilder {
            backend: None,
            clock: Arc::new(SystemClock),
            rounding: RoundingPolicy::default(),
            event_capacity: 64,
        }
    }

    pub fn backend(mut self, backend: Arc<dyn LockBackend>) -> LockManagerBuilder {
        self.backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> LockManagerBuilder {
        self.clock = clock;
        self
    }

    pub fn rounding(mut self, rounding: RoundingPolicy) -> LockManagerBuilder {
        self.rounding = rounding;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> LockManagerBuilder {
        self.event_capacity = capacity;
        self
    }

    /// Build the manager and spawn its cleanup actor. Defaults to a
    /// `MemoryBackend` when none was supplied.
    ///
    /// Before the actor's queue is considered armed, the backend is
    /// enumerated for locks already present (a persistent backend reopened
    /// after a restart) and each is re-tracked, so a lock that outlived the
    /// previous process can still expire.
    pub fn build(self) -> Arc<LockManager> {
        let backend = self.backend.unwrap_or_else(|| Arc::new(MemoryBackend::new()));
        let manager = Arc::new(LockManager {
            backend,
            clock: self.clock,
            rounding: self.rounding,
            events: EventChannel::new(self.event_capacity),
            cleanup: OnceLock::new(),
        });
        let actor = CleanupActor::spawn(manager.clock.clone(), manager.clone());
        let _ = manager.cleanup.set(actor);

        let reconciling = manager.clone();
        tokio::spawn(async move {
            let mut txn = match reconciling.backend.begin(false).await {
                Ok(txn) => txn,
                Err(err) => {
                    warn!("lock reconciliation could not open a transaction: {}", err);
                    return;
                },
            };
            match txn.get_active_locks().await {
                Ok(locks) => {
                    if let Some(actor) = reconciling.cleanup.get() {
                        for lock in locks {
                            actor.track(lock.state_token.clone(), lock.expires_at());
                        }
                    }
                },
                Err(err) => warn!("lock reconciliation could not enumerate active locks: {}", err),
            }
        });

        manager
    }
}

impl Default for LockManagerBuilder {
    fn default() -> LockManagerBuilder {
        LockManagerBuilder::new()
    }
}

/// The locking core's entry point (spec.md §4.F). Cheap to clone via `Arc`;
/// intended to be shared across request handlers.
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    clock: Arc<dyn Clock>,
    rounding: RoundingPolicy,
    events: EventChannel,
    cleanup: OnceLock<CleanupActor>,
}

impl LockManager {
    pub fn builder() -> LockManagerBuilder {
        LockManagerBuilder::new()
    }

    /// Subscribe to lock lifecycle events.
    pub fn events(&self) -> EventChannel {
        self.events.clone()
    }

    /// Acquire a new lock on an existing resource (spec.md §4.F `Lock`).
    #[allow(clippy::too_many_arguments)]
    pub async fn lock(
        &self,
        path: &LockPath,
        recursive: bool,
        owner: Option<Element>,
        access_type: LockAccessType,
        share_mode: LockShareMode,
        timeout: Duration,
        href: String,
        cancel: &CancellationToken,
    ) -> LockResult<ActiveLock> {
        check_cancelled(cancel)?;
        let rounded_timeout = self.rounding.round_timeout(timeout);
        let mut txn = self.backend.begin(true).await?;
        check_cancelled(cancel)?;
        let candidates = txn.get_active_locks().await?;
        let request = LockRequest { path, recursive, share_mode };
        trace!("conflict check: path={} recursive={} share_mode={:?}", path.as_str(), recursive, share_mode);
        let overlap = conflict::find_overlapping(&request, &candidates);
        let conflicts = conflict::conflicting(&request, &overlap);
        if !conflicts.is_empty() {
            return Err(LockError::Conflict(overlap));
        }
        check_cancelled(cancel)?;
        let now = self.rounding.round_instant(self.clock.now());
        let lock =
            ActiveLock::new(path.clone(), href, recursive, owner, access_type, share_mode, rounded_timeout, new_state_token(), now)?;
        txn.add(lock.clone()).await?;
        check_cancelled(cancel)?;
        txn.commit().await?;
        drop(txn);

        // Committed: cancellation from here on only suppresses notification.
        if cancel.is_cancelled() {
            return Ok(lock);
        }
        if let Some(actor) = self.cleanup.get() {
            actor.track(lock.state_token.clone(), lock.expires_at());
        }
        debug!("lock acquired: token={} path={}", lock.state_token, lock.path.as_str());
        self.events.publish(LockEvent::Added(lock.clone()));
        Ok(lock)
    }

    /// Acquire a lock honoring an `If` header's existing-lock tokens
    /// (spec.md §4.F "Implicit acquire").
    ///
    /// With no `If` header (or an empty one), this is equivalent to
    /// `lock`. Otherwise, every list in the header whose tag relates to
    /// the requested scope is evaluated against the locks already
    /// affecting that scope; a list that matches and names a token is
    /// reported back as the existing lock(s) satisfying the request
    /// instead of creating a new one.
    #[allow(clippy::too_many_arguments)]
    pub async fn lock_implicit(
        &self,
        if_header: Option<&IfHeader>,
        path: &LockPath,
        recursive: bool,
        owner: Option<Element>,
        access_type: LockAccessType,
        share_mode: LockShareMode,
        timeout: Duration,
        href: String,
        resources: &dyn ResourceStore,
        cancel: &CancellationToken,
    ) -> LockResult<ImplicitLock> {
        check_cancelled(cancel)?;
        let if_header = match if_header {
            Some(h) if !h.lists.is_empty() => h,
            _ => {
                let lock = self.lock(path, recursive, owner, access_type, share_mode, timeout, href, cancel).await?;
                return Ok(ImplicitLock::Fresh(lock));
            },
        };

        let affecting = self.get_affected_locks(path, true, true).await?;

        let mut via_existing: Vec<ActiveLock> = Vec::new();
        let mut any_matched_without_token = false;
        let mut rejected = LockStatus::default();
        let mut any_list_considered = false;

        for list in &if_header.lists {
            check_cancelled(cancel)?;
            let list_path = list.resource_tag.as_ref().unwrap_or(path);
            if webpath::compare(path, recursive, list_path, true) == PathRelation::NoMatch && list_path != path {
                continue;
            }
            any_list_considered = true;
            trace!("If-list evaluation: resource={}", list_path.as_str());

            let relevant: Vec<ActiveLock> = affecting
                .iter()
                .filter(|l| webpath::compare(list_path, false, &l.path, l.recursive) != PathRelation::NoMatch)
                .cloned()
                .collect();

            let entity_tag = if list.requires_entity_tag() { resources.entity_tag(list_path).await } else { None };
            let tokens: HashMap<String, ActiveLock> = relevant.iter().map(|l| (l.state_token.clone(), l.clone())).collect();
            let info = PathInfo { locks: relevant.clone(), tokens, entity_tag };

            if list.matches(&info) {
                if list.requires_state_token() {
                    for condition in &list.conditions {
                        if let IfCondition::StateToken { token, negated: false } = condition {
                            if let Some(l) = info.tokens.get(token) {
                                via_existing.push(l.clone());
                            }
                        }
                    }
                } else {
                    any_matched_without_token = true;
                }
            } else if !relevant.is_empty() {
                rejected.reference_locks.extend(relevant);
            }
        }

        if !via_existing.is_empty() {
            return Ok(ImplicitLock::ViaExisting(via_existing));
        }
        if any_matched_without_token || !any_list_considered {
            let lock = self.lock(path, recursive, owner, access_type, share_mode, timeout, href, cancel).await?;
            return Ok(ImplicitLock::Fresh(lock));
        }
        if !rejected.is_empty() {
            return Err(LockError::Conflict(rejected));
        }
        let lock = self.lock(path, recursive, owner, access_type, share_mode, timeout, href, cancel).await?;
        Ok(ImplicitLock::Fresh(lock))
    }

    /// Refresh every lock named by an `If` header's token conditions
    /// (spec.md §4.F `Refresh`).
    pub async fn refresh(
        &self,
        if_header: &IfHeader,
        new_timeout: Duration,
        default_path: &LockPath,
        resources: &dyn ResourceStore,
        cancel: &CancellationToken,
    ) -> LockResult<Vec<ActiveLock>> {
        check_cancelled(cancel)?;
        let rounded_timeout = self.rounding.round_timeout(new_timeout);
        let mut txn = self.backend.begin(true).await?;
        check_cancelled(cancel)?;
        let all_locks = txn.get_active_locks().await?;
        let now = self.rounding.round_instant(self.clock.now());

        let mut refreshed: Vec<ActiveLock> = Vec::new();
        let mut failing_hrefs: Vec<String> = Vec::new();

        for list in &if_header.lists {
            check_cancelled(cancel)?;
            if !list.requires_state_token() {
                continue;
            }
            let path = list.resource_tag.as_ref().unwrap_or(default_path);
            let href = path.as_str().to_string();
            trace!("If-list evaluation: resource={}", href);

            let covering: Vec<ActiveLock> = all_locks
                .iter()
                .filter(|l| matches!(webpath::compare(path, false, &l.path, l.recursive), PathRelation::Reference | PathRelation::RightIsParent))
                .cloned()
                .collect();

            if covering.is_empty() {
                failing_hrefs.push(href);
                continue;
            }

            let entity_tag = if list.requires_entity_tag() {
                let tag = resources.entity_tag(path).await;
                if tag.is_none() {
                    warn!("refresh target missing on resource store, tolerating: {}", href);
                }
                tag
            } else {
                None
            };
            let tokens: HashMap<String, ActiveLock> = covering.iter().map(|l| (l.state_token.clone(), l.clone())).collect();
            let info = PathInfo { locks: covering.clone(), tokens, entity_tag };

            trace!("conflict check: refresh candidate {} with {} covering lock(s)", href, covering.len());
            if !list.matches(&info) {
                failing_hrefs.push(href);
                continue;
            }

            let matched = list.conditions.iter().find_map(|c| match c {
                IfCondition::StateToken { token, negated: false } => info.tokens.get(token),
                _ => None,
            });
            match matched {
                Some(existing) => refreshed.push(existing.refreshed(rounded_timeout, now)),
                None => failing_hrefs.push(href),
            }
        }

        if refreshed.is_empty() {
            return Err(LockError::RefreshFailed(failing_hrefs));
        }

        for lock in &refreshed {
            txn.update(lock.clone()).await?;
        }
        check_cancelled(cancel)?;
        txn.commit().await?;
        drop(txn);

        // Committed: cancellation from here on only suppresses notification.
        if cancel.is_cancelled() {
            return Ok(refreshed);
        }
        for lock in &refreshed {
            if let Some(actor) = self.cleanup.get() {
                actor.track(lock.state_token.clone(), lock.expires_at());
            }
            debug!("lock refreshed: token={}", lock.state_token);
            self.events.publish(LockEvent::Refreshed(lock.clone()));
        }
        Ok(refreshed)
    }

    /// Release a lock by token, requiring that `path` reference-match its
    /// scope (spec.md §4.F `Release`; open question: the comparison uses
    /// the lock's own recursive flag on the left and a non-recursive
    /// comparison on the right, and only `Reference` is accepted — a
    /// deep-locked ancestor can be released by naming the ancestor itself,
    /// but not by naming a descendant).
    pub async fn release(&self, state_token: &str, path: &LockPath, cancel: &CancellationToken) -> LockResult<()> {
        self.release_internal(state_token, Some(path), cancel).await
    }

    async fn release_internal(&self, state_token: &str, path: Option<&LockPath>, cancel: &CancellationToken) -> LockResult<()> {
        check_cancelled(cancel)?;
        let mut txn = self.backend.begin(true).await?;
        check_cancelled(cancel)?;
        let existing = match txn.get(state_token).await? {
            Some(l) => l,
            None => return Err(LockError::NoLock),
        };
        if let Some(p) = path {
            trace!("conflict check: release scope for token={}", state_token);
            let relation = webpath::compare(&existing.path, existing.recursive, p, false);
            if relation != PathRelation::Reference {
                return Err(LockError::InvalidLockRange);
            }
        }
        txn.remove(state_token).await?;
        check_cancelled(cancel)?;
        txn.commit().await?;
        drop(txn);

        // Committed: cancellation from here on only suppresses notification.
        if cancel.is_cancelled() {
            return Ok(());
        }
        if let Some(actor) = self.cleanup.get() {
            actor.untrack(state_token.to_string());
        }
        debug!("lock released: token={}", state_token);
        self.events.publish(LockEvent::Released(existing));
        Ok(())
    }

    /// All committed active locks (spec.md §4.F `GetLocks`).
    pub async fn get_locks(&self) -> LockResult<Vec<ActiveLock>> {
        let mut txn = self.backend.begin(false).await?;
        txn.get_active_locks().await
    }

    /// `Find` over the current lock set (spec.md §4.F
    /// `GetAffectedLocks`, §6 outbound interface), flattened in
    /// `parent ∥ reference ∥ child` order.
    pub async fn get_affected_locks(&self, path: &LockPath, find_children: bool, find_parents: bool) -> LockResult<Vec<ActiveLock>> {
        let mut txn = self.backend.begin(false).await?;
        let candidates = txn.get_active_locks().await?;
        let status = conflict::find(path, find_children, find_parents, &candidates);
        Ok(status.flatten())
    }
}

impl ExpiryHandler for LockManager {
    fn expire<'a>(&'a self, state_token: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            // Automatic expiry has no external caller to cancel it.
            let cancel = CancellationToken::new();
            match self.release_internal(state_token, None, &cancel).await {
                Ok(()) | Err(LockError::NoLock) => {},
                Err(err) => warn!("expiry cleanup failed for {}: {}", state_token, err),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoResources;

    impl ResourceStore for NoResources {
        fn exists<'a>(&'a self, _path: &'a LockPath) -> BackendFuture<'a, bool> {
            Box::pin(async move { false })
        }

        fn entity_tag<'a>(&'a self, _path: &'a LockPath) -> BackendFuture<'a, Option<String>> {
            Box::pin(async move { None })
        }
    }

    fn path(p: &str) -> LockPath {
        LockPath::parse(p).unwrap()
    }

    #[tokio::test]
    async fn lock_then_conflicting_lock_fails() {
        let manager = LockManager::builder().build();
        let cancel = CancellationToken::new();
        let p = path("/a/");
        manager
            .lock(&p, true, None, LockAccessType::Write, LockShareMode::Exclusive, Duration::from_secs(60), "/a/".to_string(), &cancel)
            .await
            .unwrap();
        let err = manager
            .lock(&p, true, None, LockAccessType::Write, LockShareMode::Exclusive, Duration::from_secs(60), "/a/".to_string(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Conflict(_)));
    }

    #[tokio::test]
    async fn shared_locks_from_different_owners_coexist() {
        let manager = LockManager::builder().build();
        let cancel = CancellationToken::new();
        let p = path("/a/");
        manager
            .lock(&p, true, None, LockAccessType::Write, LockShareMode::Shared, Duration::from_secs(60), "/a/".to_string(), &cancel)
            .await
            .unwrap();
        manager
            .lock(&p, true, None, LockAccessType::Write, LockShareMode::Shared, Duration::from_secs(60), "/a/".to_string(), &cancel)
            .await
            .unwrap();
        assert_eq!(manager.get_locks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn child_lock_reports_as_parent_conflict() {
        let manager = LockManager::builder().build();
        let cancel = CancellationToken::new();
        let parent = path("/a/");
        manager
            .lock(&parent, true, None, LockAccessType::Write, LockShareMode::Exclusive, Duration::from_secs(60), "/a/".to_string(), &cancel)
            .await
            .unwrap();
        let child = path("/a/b");
        let err = manager
            .lock(&child, false, None, LockAccessType::Write, LockShareMode::Exclusive, Duration::from_secs(60), "/a/b".to_string(), &cancel)
            .await
            .unwrap_err();
        match err {
            LockError::Conflict(status) => assert_eq!(status.parent_locks.len(), 1),
            _ => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn refresh_extends_timeout_and_keeps_token() {
        let manager = LockManager::builder().build();
        let cancel = CancellationToken::new();
        let p = path("/a/");
        let lock = manager
            .lock(&p, true, None, LockAccessType::Write, LockShareMode::Exclusive, Duration::from_secs(30), "/a/".to_string(), &cancel)
            .await
            .unwrap();
        let if_header = IfHeader::parse(&format!("</a/> (<{}>)", lock.state_token)).unwrap();
        let refreshed = manager.refresh(&if_header, Duration::from_secs(600), &p, &NoResources, &cancel).await.unwrap();
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].state_token, lock.state_token);
        assert_eq!(refreshed[0].timeout, Duration::from_secs(600));
        assert!(refreshed[0].last_refreshed_at >= lock.issued_at);
    }

    #[tokio::test]
    async fn refresh_with_unknown_token_fails_with_hrefs() {
        let manager = LockManager::builder().build();
        let cancel = CancellationToken::new();
        let p = path("/a/");
        let if_header = IfHeader::parse("</a/> (<opaquelocktoken:bogus>)").unwrap();
        let err = manager.refresh(&if_header, Duration::from_secs(600), &p, &NoResources, &cancel).await.unwrap_err();
        match err {
            LockError::RefreshFailed(hrefs) => assert_eq!(hrefs, vec!["/a/".to_string()]),
            _ => panic!("expected refresh failure"),
        }
    }

    #[tokio::test]
    async fn release_outside_lock_scope_is_rejected() {
        let manager = LockManager::builder().build();
        let cancel = CancellationToken::new();
        let p = path("/a");
        let lock = manager
            .lock(&p, false, None, LockAccessType::Write, LockShareMode::Exclusive, Duration::from_secs(30), "/a".to_string(), &cancel)
            .await
            .unwrap();
        let other = path("/b");
        let err = manager.release(&lock.state_token, &other, &cancel).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidLockRange));
    }

    #[tokio::test]
    async fn release_via_descendant_path_is_rejected() {
        let manager = LockManager::builder().build();
        let cancel = CancellationToken::new();
        let parent = path("/a/");
        let lock = manager
            .lock(&parent, true, None, LockAccessType::Write, LockShareMode::Exclusive, Duration::from_secs(30), "/a/".to_string(), &cancel)
            .await
            .unwrap();
        let child = path("/a/b");
        let err = manager.release(&lock.state_token, &child, &cancel).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidLockRange));
    }

    #[tokio::test]
    async fn release_then_lock_again_succeeds() {
        let manager = LockManager::builder().build();
        let cancel = CancellationToken::new();
        let p = path("/a");
        let lock = manager
            .lock(&p, false, None, LockAccessType::Write, LockShareMode::Exclusive, Duration::from_secs(30), "/a".to_string(), &cancel)
            .await
            .unwrap();
        manager.release(&lock.state_token, &p, &cancel).await.unwrap();
        assert!(manager.get_locks().await.unwrap().is_empty());
        manager
            .lock(&p, false, None, LockAccessType::Write, LockShareMode::Exclusive, Duration::from_secs(30), "/a".to_string(), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lock_implicit_with_satisfying_token_does_not_create_new_lock() {
        let manager = LockManager::builder().build();
        let cancel = CancellationToken::new();
        let p = path("/a/");
        let lock = manager
            .lock(&p, true, None, LockAccessType::Write, LockShareMode::Exclusive, Duration::from_secs(60), "/a/".to_string(), &cancel)
            .await
            .unwrap();
        let if_header = IfHeader::parse(&format!("</a/> (<{}>)", lock.state_token)).unwrap();
        let result = manager
            .lock_implicit(
                Some(&if_header),
                &p,
                true,
                None,
                LockAccessType::Write,
                LockShareMode::Exclusive,
                Duration::from_secs(60),
                "/a/".to_string(),
                &NoResources,
                &cancel,
            )
            .await
            .unwrap();
        match result {
            ImplicitLock::ViaExisting(locks) => assert_eq!(locks[0].state_token, lock.state_token),
            ImplicitLock::Fresh(_) => panic!("expected via-existing"),
        }
        assert_eq!(manager.get_locks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lock_implicit_with_no_if_header_creates_fresh_lock() {
        let manager = LockManager::builder().build();
        let cancel = CancellationToken::new();
        let p = path("/a/");
        let result = manager
            .lock_implicit(
                None,
                &p,
                true,
                None,
                LockAccessType::Write,
                LockShareMode::Exclusive,
                Duration::from_secs(60),
                "/a/".to_string(),
                &NoResources,
                &cancel,
            )
            .await
            .unwrap();
        assert!(matches!(result, ImplicitLock::Fresh(_)));
    }

    #[tokio::test]
    async fn cancelling_before_commit_leaves_no_lock_behind() {
        let manager = LockManager::builder().build();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let p = path("/a/");
        let err = manager
            .lock(&p, true, None, LockAccessType::Write, LockShareMode::Exclusive, Duration::from_secs(60), "/a/".to_string(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
        assert!(manager.get_locks().await.unwrap().is_empty());
    }
}
