//! Share-mode conflict analysis and the `Find` scope query (spec.md §4.E,
//! §4.F `Find`).
//!
//! Grounded on the share-mode bookkeeping in the teacher's in-memory lock
//! table: an exclusive lock conflicts with any other lock on an
//! overlapping scope; a shared lock conflicts only with an exclusive one.

use log::trace;

use crate::lock::{ActiveLock, LockShareMode, LockStatus};
use crate::webpath::{self, LockPath, PathRelation};

/// A not-yet-issued lock request, as far as conflict checking cares.
pub struct LockRequest<'a> {
    pub path: &'a LockPath,
    pub recursive: bool,
    pub share_mode: LockShareMode,
}

fn share_modes_conflict(a: LockShareMode, b: LockShareMode) -> bool {
    a.is_exclusive() || b.is_exclusive()
}

/// `Find(locks, parentUrl, withChildren, findParents)`: partition
/// `candidates` into parent/reference/child buckets relative to `query`,
/// keeping only locks whose scope actually overlaps it. `with_children`
/// drives whether a lock nested under `query` can be bucketed (it is
/// `query`'s own recursive flag); `find_parents` gates whether an
/// ancestor lock of `query` is reported at all.
pub fn find(query: &LockPath, with_children: bool, find_parents: bool, candidates: &[ActiveLock]) -> LockStatus {
    trace!("conflict check: query={} with_children={} find_parents={} candidates={}", query.as_str(), with_children, find_parents, candidates.len());
    let mut status = LockStatus::default();
    for lock in candidates {
        match webpath::compare(query, with_children, &lock.path, lock.recursive) {
            PathRelation::Reference => status.reference_locks.push(lock.clone()),
            PathRelation::LeftIsParent => status.child_locks.push(lock.clone()),
            PathRelation::RightIsParent => {
                if find_parents {
                    status.parent_locks.push(lock.clone());
                }
            },
            PathRelation::NoMatch => {},
        }
    }
    status
}

/// `Find` scoped to a lock acquisition's conflict check, which always asks
/// for parent locks (spec.md §4.F `Lock` step 2).
pub fn find_overlapping(request: &LockRequest<'_>, candidates: &[ActiveLock]) -> LockStatus {
    find(request.path, request.recursive, true, candidates)
}

/// The subset of `overlap` that would actually conflict with `request`
/// under share-mode rules, i.e. every overlapping lock except a shared lock
/// meeting a shared request.
pub fn conflicting(request: &LockRequest<'_>, overlap: &LockStatus) -> Vec<ActiveLock> {
    let conflicts: Vec<ActiveLock> =
        overlap.flatten().into_iter().filter(|existing| share_modes_conflict(request.share_mode, existing.share_mode)).collect();
    trace!("conflict check: share_mode={:?} yielded {} conflict(s)", request.share_mode, conflicts.len());
    conflicts
}

/// Convenience: find overlapping locks and return only the conflicting
/// subset, discarding non-conflicting shared/shared overlaps.
pub fn check(request: &LockRequest<'_>, candidates: &[ActiveLock]) -> Vec<ActiveLock> {
    let overlap = find_overlapping(request, candidates);
    conflicting(request, &overlap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lock(path: &str, recursive: bool, mode: LockShareMode) -> ActiveLock {
        ActiveLock::new(
            LockPath::parse(path).unwrap(),
            path.to_string(),
            recursive,
            None,
            crate::lock::LockAccessType::Write,
            mode,
            Duration::from_secs(60),
            format!("opaquelocktoken:{}", path),
            chrono::Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn exclusive_conflicts_with_shared() {
        let existing = lock("/a/", true, LockShareMode::Shared);
        let path = LockPath::parse("/a/").unwrap();
        let req = LockRequest { path: &path, recursive: true, share_mode: LockShareMode::Exclusive };
        let got = check(&req, &[existing]);
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn shared_does_not_conflict_with_shared() {
        let existing = lock("/a/", true, LockShareMode::Shared);
        let path = LockPath::parse("/a/").unwrap();
        let req = LockRequest { path: &path, recursive: true, share_mode: LockShareMode::Shared };
        let got = check(&req, &[existing]);
        assert!(got.is_empty());
    }

    #[test]
    fn non_overlapping_paths_never_conflict() {
        let existing = lock("/a/", true, LockShareMode::Exclusive);
        let path = LockPath::parse("/b/").unwrap();
        let req = LockRequest { path: &path, recursive: true, share_mode: LockShareMode::Exclusive };
        assert!(check(&req, &[existing]).is_empty());
    }

    #[test]
    fn child_lock_blocks_recursive_parent_request() {
        let existing = lock("/a/b", false, LockShareMode::Exclusive);
        let parent = LockPath::parse("/a/").unwrap();
        let req = LockRequest { path: &parent, recursive: true, share_mode: LockShareMode::Shared };
        assert_eq!(check(&req, &[existing]).len(), 1);
    }

    #[test]
    fn find_parents_false_hides_ancestor_lock() {
        let ancestor = lock("/a/", true, LockShareMode::Exclusive);
        let query = LockPath::parse("/a/b").unwrap();
        let status = find(&query, false, false, &[ancestor]);
        assert!(status.parent_locks.is_empty());
    }
}
