//! Two-generation membership filter for incremental indexing passes
//!
//! The filter answers "is this file in the project-and-libraries scope?" for
//! many concurrent readers while one indexing pass is adding files. Before a
//! new pass starts, the driver rotates generations: the set built by the last
//! pass becomes `previous`, and an empty set becomes `current`. Files re-added
//! during the new pass are then classified as new ([`FileAddStatus::Added`])
//! or merely reconfirmed ([`FileAddStatus::Present`]).
//!
//! Both generations are published through epoch-managed atomic pointers, so
//! reads never block on a rotation. A reader that loaded `current` just before
//! a rotation keeps working against that set until its operation ends.

use crate::bitset::ConcurrentBitSet;
use crossbeam::epoch::{self, Atomic, Guard, Owned};
use log::debug;
use roaring::RoaringBitmap;
use std::fmt;
use std::sync::atomic::Ordering;

/// Handle of a file; always strictly positive
pub type FileId = u32;

/// Kind of scope a filter represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterScopeType {
    ProjectAndLibraries,
    Other,
}

impl FilterScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectAndLibraries => "project-and-libraries",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FilterScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`IncrementalFilesFilter::ensure_file_id_present`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileAddStatus {
    /// Already in scope, or admitted again after being in scope last pass
    Present,
    /// Admitted and not known to the previous pass
    Added,
    /// Rejected by the admission predicate
    Skipped,
}

/// A filter over file ids, composable by scope kind
pub trait IdFilter: Send + Sync {
    fn contains_file_id(&self, file_id: FileId) -> bool;

    fn filtering_scope_type(&self) -> FilterScopeType {
        FilterScopeType::Other
    }
}

/// Membership filter with a `current` and an optional `previous` generation
pub struct IncrementalFilesFilter {
    /// Never null
    file_ids: Atomic<ConcurrentBitSet>,
    previous_file_ids: Atomic<ConcurrentBitSet>,
}

impl IncrementalFilesFilter {
    /// Create a filter with an empty current generation and no previous one
    pub fn new() -> Self {
        Self::with_current(ConcurrentBitSet::new())
    }

    /// Create a filter whose current generation holds `members`
    pub fn from_members(members: &RoaringBitmap) -> Self {
        Self::with_current(ConcurrentBitSet::from(members))
    }

    fn with_current(file_ids: ConcurrentBitSet) -> Self {
        Self {
            file_ids: Atomic::new(file_ids),
            previous_file_ids: Atomic::null(),
        }
    }

    #[inline]
    fn current<'g>(&self, guard: &'g Guard) -> &'g ConcurrentBitSet {
        let shared = self.file_ids.load(Ordering::Acquire, guard);
        // SAFETY: `file_ids` is never null, and a set unlinked from both slots
        // is only destroyed once every guard pinned before the unlink is gone.
        unsafe { shared.deref() }
    }

    #[inline]
    fn previous<'g>(&self, guard: &'g Guard) -> Option<&'g ConcurrentBitSet> {
        let shared = self.previous_file_ids.load(Ordering::Acquire, guard);
        // SAFETY: same reclamation rule as `current`.
        unsafe { shared.as_ref() }
    }

    /// Make sure `file_id` is in the current generation
    ///
    /// Returns [`FileAddStatus::Present`] straight away when the id is already
    /// current, without calling `admit`. Otherwise `admit` runs exactly once;
    /// on `true` the id is marked and classified against the previous
    /// generation, on `false` the result is [`FileAddStatus::Skipped`].
    ///
    /// The check, `admit`, and the mark are not one atomic step. Two threads
    /// racing on the same absent id may both run `admit`; marking is
    /// idempotent, so both end with the id present.
    ///
    /// The generation loaded at entry is used until the call returns, so the
    /// epoch stays pinned while `admit` runs. A slow `admit` delays reclamation
    /// of retired generations for every thread until it finishes. If the
    /// driver rotates meanwhile, the mark lands in the retired generation.
    pub fn ensure_file_id_present<F>(&self, file_id: FileId, admit: F) -> FileAddStatus
    where
        F: FnOnce() -> bool,
    {
        debug_assert!(file_id > 0, "file id must be positive, got {file_id}");

        let guard = &epoch::pin();
        let file_ids = self.current(guard);
        if file_ids.get(file_id) {
            return FileAddStatus::Present;
        }

        if !admit() {
            return FileAddStatus::Skipped;
        }

        file_ids.set(file_id);
        match self.previous(guard) {
            Some(previous) if previous.get(file_id) => FileAddStatus::Present,
            _ => FileAddStatus::Added,
        }
    }

    /// Drop `file_id` from the current generation; no-op when absent
    pub fn remove_file_id(&self, file_id: FileId) {
        debug_assert!(file_id > 0, "file id must be positive, got {file_id}");

        let guard = &epoch::pin();
        self.current(guard).clear(file_id);
    }

    /// Keep the current generation as `previous` and start an empty one
    ///
    /// Must only be called by the single driver that sequences passes.
    pub fn memoize_and_reset_file_ids(&self) {
        let guard = &epoch::pin();
        let file_ids = self.file_ids.load(Ordering::Acquire, guard);

        let discarded = self.previous_file_ids.swap(file_ids, Ordering::AcqRel, guard);
        self.file_ids
            .store(Owned::new(ConcurrentBitSet::new()), Ordering::Release);

        if !discarded.is_null() {
            // SAFETY: `discarded` is no longer reachable from either slot.
            unsafe { guard.defer_destroy(discarded) };
        }
        debug!("rotated file id generations");
    }

    /// Forget the previous generation
    ///
    /// Must only be called by the single driver that sequences passes.
    pub fn reset_previous_file_ids(&self) {
        let guard = &epoch::pin();
        let discarded = self
            .previous_file_ids
            .swap(epoch::Shared::null(), Ordering::AcqRel, guard);

        if !discarded.is_null() {
            // SAFETY: `discarded` is no longer reachable from either slot.
            unsafe { guard.defer_destroy(discarded) };
            debug!("released previous file id generation");
        }
    }

    /// Snapshot of the ids in the current generation
    pub fn current_members(&self) -> RoaringBitmap {
        let guard = &epoch::pin();
        self.current(guard).to_roaring()
    }

    /// Number of ids in the current generation
    pub fn current_len(&self) -> u64 {
        let guard = &epoch::pin();
        self.current(guard).cardinality()
    }

    pub fn has_previous(&self) -> bool {
        let guard = &epoch::pin();
        self.previous(guard).is_some()
    }
}

impl IdFilter for IncrementalFilesFilter {
    fn contains_file_id(&self, file_id: FileId) -> bool {
        debug_assert!(file_id > 0, "file id must be positive, got {file_id}");

        let guard = &epoch::pin();
        self.current(guard).get(file_id)
    }

    fn filtering_scope_type(&self) -> FilterScopeType {
        FilterScopeType::ProjectAndLibraries
    }
}

impl Default for IncrementalFilesFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IncrementalFilesFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncrementalFilesFilter")
            .field("current_len", &self.current_len())
            .field("has_previous", &self.has_previous())
            .finish()
    }
}

impl Drop for IncrementalFilesFilter {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can hold a reference into
        // either generation.
        unsafe {
            let guard = epoch::unprotected();
            for slot in [&self.file_ids, &self.previous_file_ids] {
                let shared = slot.load(Ordering::Relaxed, guard);
                if !shared.is_null() {
                    drop(shared.into_owned());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn admit_all() -> bool {
        true
    }

    #[test]
    fn test_new_filter_is_empty() {
        let filter = IncrementalFilesFilter::new();
        for id in [1, 2, 64, 1_000_000] {
            assert!(!filter.contains_file_id(id));
        }
        assert!(!filter.has_previous());
        assert_eq!(filter.current_len(), 0);
    }

    #[test]
    fn test_scope_type() {
        let filter = IncrementalFilesFilter::new();
        assert_eq!(
            filter.filtering_scope_type(),
            FilterScopeType::ProjectAndLibraries
        );
        assert_eq!(filter.filtering_scope_type().to_string(), "project-and-libraries");
    }

    #[test]
    fn test_admitted_file_is_present() {
        let filter = IncrementalFilesFilter::new();
        assert_eq!(filter.ensure_file_id_present(3, admit_all), FileAddStatus::Added);
        assert!(filter.contains_file_id(3));
    }

    #[test]
    fn test_second_ensure_skips_admission() {
        let filter = IncrementalFilesFilter::new();
        let calls = AtomicUsize::new(0);
        let admit = || {
            calls.fetch_add(1, Ordering::SeqCst);
            true
        };

        assert_eq!(filter.ensure_file_id_present(9, admit), FileAddStatus::Added);
        assert_eq!(filter.ensure_file_id_present(9, admit), FileAddStatus::Present);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rejected_file_is_skipped() {
        let filter = IncrementalFilesFilter::new();
        assert_eq!(filter.ensure_file_id_present(4, || false), FileAddStatus::Skipped);
        assert!(!filter.contains_file_id(4));
    }

    #[test]
    fn test_remove_then_readd() {
        let filter = IncrementalFilesFilter::new();
        filter.ensure_file_id_present(8, admit_all);
        filter.remove_file_id(8);
        assert!(!filter.contains_file_id(8));

        let calls = AtomicUsize::new(0);
        let status = filter.ensure_file_id_present(8, || {
            calls.fetch_add(1, Ordering::SeqCst);
            true
        });
        assert_eq!(status, FileAddStatus::Added);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(filter.contains_file_id(8));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let filter = IncrementalFilesFilter::new();
        filter.remove_file_id(12);
        assert!(!filter.contains_file_id(12));
    }

    #[test]
    fn test_remove_then_readd_consults_previous() {
        let filter = IncrementalFilesFilter::new();
        filter.ensure_file_id_present(6, admit_all);
        filter.memoize_and_reset_file_ids();

        assert_eq!(filter.ensure_file_id_present(6, admit_all), FileAddStatus::Present);
        filter.remove_file_id(6);
        assert!(!filter.contains_file_id(6));
        assert_eq!(filter.ensure_file_id_present(6, admit_all), FileAddStatus::Present);
    }

    #[test]
    fn test_rotation_clears_current() {
        let filter = IncrementalFilesFilter::new();
        for id in 1..=10 {
            filter.ensure_file_id_present(id, admit_all);
        }

        filter.memoize_and_reset_file_ids();

        assert!(filter.has_previous());
        assert_eq!(filter.current_len(), 0);
        for id in 1..=10 {
            assert!(!filter.contains_file_id(id));
        }
    }

    #[test]
    fn test_reconfirmed_file_is_present() {
        let filter = IncrementalFilesFilter::new();
        filter.ensure_file_id_present(21, admit_all);
        filter.memoize_and_reset_file_ids();

        assert_eq!(filter.ensure_file_id_present(21, admit_all), FileAddStatus::Present);
        assert!(filter.contains_file_id(21));
    }

    #[test]
    fn test_new_file_after_rotation_is_added() {
        let filter = IncrementalFilesFilter::new();
        filter.ensure_file_id_present(21, admit_all);
        filter.memoize_and_reset_file_ids();

        assert_eq!(filter.ensure_file_id_present(22, admit_all), FileAddStatus::Added);
    }

    #[test]
    fn test_removal_does_not_touch_previous() {
        let filter = IncrementalFilesFilter::new();
        filter.ensure_file_id_present(30, admit_all);
        filter.memoize_and_reset_file_ids();
        filter.remove_file_id(30);

        assert_eq!(filter.ensure_file_id_present(30, admit_all), FileAddStatus::Present);
    }

    #[test]
    fn test_skipped_after_rotation_stays_absent() {
        let filter = IncrementalFilesFilter::new();
        filter.ensure_file_id_present(40, admit_all);
        filter.memoize_and_reset_file_ids();

        assert_eq!(filter.ensure_file_id_present(40, || false), FileAddStatus::Skipped);
        assert!(!filter.contains_file_id(40));
    }

    #[test]
    fn test_reset_previous_makes_everything_new() {
        let filter = IncrementalFilesFilter::new();
        for id in [1, 2, 3] {
            filter.ensure_file_id_present(id, admit_all);
        }
        filter.memoize_and_reset_file_ids();
        filter.reset_previous_file_ids();

        assert!(!filter.has_previous());
        for id in [1, 2, 3] {
            assert_eq!(filter.ensure_file_id_present(id, admit_all), FileAddStatus::Added);
        }
    }

    #[test]
    fn test_reset_previous_without_previous() {
        let filter = IncrementalFilesFilter::new();
        filter.reset_previous_file_ids();
        assert!(!filter.has_previous());
    }

    #[test]
    fn test_only_two_generations_kept() {
        let filter = IncrementalFilesFilter::new();
        filter.ensure_file_id_present(1, admit_all);
        filter.memoize_and_reset_file_ids();
        filter.ensure_file_id_present(2, admit_all);
        filter.memoize_and_reset_file_ids();

        // 1 belonged to the generation before previous, which is gone
        assert_eq!(filter.ensure_file_id_present(1, admit_all), FileAddStatus::Added);
        assert_eq!(filter.ensure_file_id_present(2, admit_all), FileAddStatus::Present);
    }

    #[test]
    fn test_from_members() {
        let mut members = RoaringBitmap::new();
        members.insert(5);
        members.insert(500);

        let filter = IncrementalFilesFilter::from_members(&members);
        assert!(filter.contains_file_id(5));
        assert!(filter.contains_file_id(500));
        assert!(!filter.contains_file_id(6));
        assert!(!filter.has_previous());
        assert_eq!(filter.current_members(), members);
    }

    #[test]
    fn test_incremental_scenario() {
        let filter = IncrementalFilesFilter::new();

        assert_eq!(filter.ensure_file_id_present(5, admit_all), FileAddStatus::Added);
        assert!(filter.contains_file_id(5));

        filter.memoize_and_reset_file_ids();
        assert!(!filter.contains_file_id(5));

        assert_eq!(filter.ensure_file_id_present(5, admit_all), FileAddStatus::Present);
        assert_eq!(filter.ensure_file_id_present(7, admit_all), FileAddStatus::Added);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "file id must be positive")]
    fn test_zero_id_panics_on_ensure() {
        let filter = IncrementalFilesFilter::new();
        filter.ensure_file_id_present(0, admit_all);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "file id must be positive")]
    fn test_zero_id_panics_on_remove() {
        let filter = IncrementalFilesFilter::new();
        filter.remove_file_id(0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "file id must be positive")]
    fn test_zero_id_panics_on_contains() {
        let filter = IncrementalFilesFilter::new();
        filter.contains_file_id(0);
    }

    #[test]
    fn test_generation_retired_during_admit_stays_usable() {
        let filter = IncrementalFilesFilter::new();
        filter.ensure_file_id_present(1, admit_all);

        let status = filter.ensure_file_id_present(2, || {
            // The generation this call loaded is rotated out and then dropped
            filter.memoize_and_reset_file_ids();
            filter.reset_previous_file_ids();
            true
        });

        assert_eq!(status, FileAddStatus::Added);
        assert!(!filter.contains_file_id(1));
        assert!(!filter.contains_file_id(2));
        assert!(!filter.has_previous());

        assert_eq!(filter.ensure_file_id_present(2, admit_all), FileAddStatus::Added);
        assert!(filter.contains_file_id(2));
    }

    #[test]
    fn test_concurrent_ensure_marks_every_id() {
        let filter = IncrementalFilesFilter::new();
        let admissions = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for id in 1..=500 {
                        filter.ensure_file_id_present(id, || {
                            admissions.fetch_add(1, Ordering::Relaxed);
                            true
                        });
                    }
                });
            }
        });

        assert_eq!(filter.current_len(), 500);
        // Racing callers may admit the same id more than once
        let admitted = admissions.load(Ordering::Relaxed);
        assert!((500..=4000).contains(&admitted));
    }

    #[test]
    fn test_readers_during_rotation() {
        let filter = Arc::new(IncrementalFilesFilter::new());
        for id in 1..=100 {
            filter.ensure_file_id_present(id, admit_all);
        }

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let filter = Arc::clone(&filter);
                thread::spawn(move || {
                    for _ in 0..200 {
                        for id in 1..=100 {
                            let _ = filter.contains_file_id(id);
                        }
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            filter.memoize_and_reset_file_ids();
            for id in 1..=100 {
                filter.ensure_file_id_present(id, admit_all);
            }
        }
        filter.reset_previous_file_ids();

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(filter.current_len(), 100);
        assert!(!filter.has_previous());
    }
}
