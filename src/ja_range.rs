//! Range allocator built atop [`crate::ja::Ja`].
//!
//! The 64-bit key space `[0, 2^64-1]` is partitioned into disjoint
//! ranges, each keyed in the underlying Judy array by its `start`. A
//! range is FREE (available to allocate), ALLOCATED (claimed by
//! [`JaRange::add`]), or REMOVED (a terminal tombstone left behind by
//! [`JaRange::del`] until readers have drained). State only ever moves
//! FREE -> REMOVED or ALLOCATED -> REMOVED; REMOVED never reverts.
//!
//! Writers lock ranges in ascending `start` order and always insert the
//! replacement entries for an operation before unlocking/removing the
//! entries it consumed, so a concurrent reader walking the key space
//! never observes a gap where a point that was covered a moment ago is
//! suddenly covered by nothing.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::ja::node::JaEntry;
use crate::ja::Ja;
use crate::reclaim::{ReadGuard, Reclaim};
use crate::spinlock::{FasLock, FasLockGuard};

/// Bounded retries for [`JaRange::del`]'s three-way neighbour lock before
/// giving up and reporting [`Error::TransientRace`] to its own caller
/// (never escapes the public API; see [`Ja::add`]'s identical pattern).
const MAX_DEL_RETRY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Free = 0,
    Allocated = 1,
    Removed = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Free,
            1 => State::Allocated,
            _ => State::Removed,
        }
    }
}

/// One entry of the range partition: `[start, end]` inclusive, plus an
/// application-chosen payload for ALLOCATED ranges.
pub struct Range<T> {
    start: u64,
    end: u64,
    state: AtomicU8,
    lock: FasLock<()>,
    payload: Option<T>,
}

impl<T> Range<T> {
    /// The inclusive bounds this entry covers.
    pub fn bounds(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    /// Whether this entry currently represents unclaimed space.
    pub fn is_free(&self) -> bool {
        State::from_u8(self.state.load(Ordering::Acquire)) == State::Free
    }

    /// Borrow the payload of an ALLOCATED range.
    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    /// Acquire this range's write lock, serializing against any other
    /// writer touching the same range (e.g. an overlapping `del`).
    pub fn lock(&self) -> FasLockGuard<'_, ()> {
        self.lock.lock()
    }
}

/// A 64-bit range allocator.
pub struct JaRange<T, R: Reclaim = crate::reclaim::epoch::EpochReclaim> {
    index: Ja<Range<T>, R>,
}

impl<T> JaRange<T, crate::reclaim::epoch::EpochReclaim> {
    /// Construct an allocator over the full 64-bit key space, starting
    /// as a single FREE range `[0, u64::MAX]`.
    pub fn new() -> Result<Self> {
        Self::with_reclaim(crate::reclaim::epoch::EpochReclaim::new())
    }
}

impl<T, R: Reclaim> JaRange<T, R> {
    /// Construct an allocator using an explicit reclamation backend.
    pub fn with_reclaim(reclaim: R) -> Result<Self> {
        let index = Ja::with_reclaim(64, reclaim)?;
        Ok(Self { index })
    }

    /// Register this thread for RCU-style read access.
    pub fn register(&self) -> R::Guard<'_> {
        self.index.register()
    }

    /// Find the range entry covering `key`, if the index has been
    /// seeded (see [`JaRange::seed`]).
    pub fn lookup(&self, guard: &R::Guard<'_>, key: u64) -> Option<*const Range<T>> {
        let entry = self.index.lookup_lower_equal(guard, key);
        if entry.is_null() {
            return None;
        }
        let range = unsafe { (*entry).data() };
        if key <= range.end {
            Some(range as *const _)
        } else {
            None
        }
    }

    /// Seed the index with a single FREE range spanning `[start, end]`.
    /// Call once, before any concurrent reader or writer is active.
    pub fn seed(&self, guard: &R::Guard<'_>, start: u64, end: u64) -> Result<()> {
        let range = Range {
            start,
            end,
            state: AtomicU8::new(State::Free as u8),
            lock: FasLock::new(()),
            payload: None,
        };
        self.index.add(guard, start, Box::new(JaEntry::new(range)))
    }

    /// Claim `[start, end]`, which must lie wholly within one existing
    /// FREE range, splitting that range's unused head/tail back into
    /// FREE entries. Returns [`Error::AlreadyExists`] if the span is
    /// not entirely free, [`Error::InvalidArgument`] if `start > end`.
    pub fn add(&self, guard: &R::Guard<'_>, start: u64, end: u64, payload: T) -> Result<()> {
        if start > end {
            return Err(Error::InvalidArgument);
        }
        let covering_range_entry = self.index.lookup_lower_equal(guard, start);
        if covering_range_entry.is_null() {
            return Err(Error::NotFound);
        }
        let covering_range = unsafe { (*covering_range_entry).data() };

        if end > covering_range.end || !covering_range.is_free() {
            return Err(Error::AlreadyExists);
        }
        let _write_guard = covering_range.lock();
        if !covering_range.is_free() {
            return Err(Error::AlreadyExists);
        }

        let (old_start, old_end) = covering_range.bounds();
        log::debug!("ja_range: splitting [{old_start:#x}, {old_end:#x}] to carve out [{start:#x}, {end:#x}]");

        // Publish the new FREE/ALLOCATED partition before retiring the
        // range being split: insert-before-delete.
        if old_start < start {
            self.seed_free(guard, old_start, start - 1)?;
        }
        if end < old_end {
            self.seed_free(guard, end + 1, old_end)?;
        }
        let allocated = Range {
            start,
            end,
            state: AtomicU8::new(State::Allocated as u8),
            lock: FasLock::new(()),
            payload: Some(payload),
        };
        self.index.add(guard, start, Box::new(JaEntry::new(allocated)))?;

        covering_range.state.store(State::Removed as u8, Ordering::Release);
        let _ = self.index.del(guard, old_start, covering_range_entry);
        Ok(())
    }

    fn seed_free(&self, guard: &R::Guard<'_>, start: u64, end: u64) -> Result<()> {
        let range = Range {
            start,
            end,
            state: AtomicU8::new(State::Free as u8),
            lock: FasLock::new(()),
            payload: None,
        };
        self.index.add(guard, start, Box::new(JaEntry::new(range)))
    }

    /// Release a previously-[`JaRange::add`]ed range back to FREE,
    /// merging it with an immediately-adjacent FREE predecessor and/or
    /// successor so that "no two adjacent ranges are both FREE" holds
    /// continuously rather than only after a later compaction pass.
    ///
    /// Locks the predecessor (if any), the target, and the successor (if
    /// any) in ascending `start` order before deciding anything, holding
    /// all three regardless of their state. That serializes two
    /// concurrent `del`s of adjacent ALLOCATED ranges through whichever
    /// one the lock order makes wait on the other, so exactly one of
    /// them observes the freshly-FREE neighbour and coalesces through
    /// it. Publishes the merged FREE range before retiring (marking
    /// REMOVED and unlinking) any range it replaces, preserving the same
    /// insert-before-delete discipline [`JaRange::add`] uses.
    pub fn del(&self, guard: &R::Guard<'_>, start: u64) -> Result<()> {
        let mut backoff = Backoff::new();
        for _ in 0..MAX_DEL_RETRY {
            if self.try_del(guard, start)? {
                return Ok(());
            }
            backoff.spin();
        }
        Err(Error::TransientRace)
    }

    /// One attempt at the locked merge-and-retire in [`JaRange::del`].
    /// Returns `Ok(true)` on success, `Ok(false)` if a concurrent
    /// neighbour transition was observed and the caller should retry,
    /// and `Err` for a genuine failure (target missing/not allocated).
    fn try_del(&self, guard: &R::Guard<'_>, start: u64) -> Result<bool> {
        let target_entry = self.index.lookup(guard, start);
        if target_entry.is_null() {
            return Err(Error::NotFound);
        }
        let target = unsafe { (*target_entry).data() };

        let pred_entry = if start == 0 {
            core::ptr::null_mut()
        } else {
            let candidate = self.index.lookup_lower_equal(guard, start - 1);
            if candidate.is_null() || candidate == target_entry {
                core::ptr::null_mut()
            } else {
                candidate
            }
        };
        let succ_entry = if target.end == u64::MAX {
            core::ptr::null_mut()
        } else {
            self.index.lookup(guard, target.end + 1)
        };
        if target.end != u64::MAX && succ_entry.is_null() {
            // A neighbour is mid-publish (e.g. an `add` split); retry.
            return Ok(false);
        }

        // Lock in ascending `start` order: predecessor, target, successor.
        let pred_guard = if !pred_entry.is_null() {
            Some(unsafe { (*pred_entry).data() }.lock())
        } else {
            None
        };
        let target_guard = target.lock();
        let succ_guard = if !succ_entry.is_null() {
            Some(unsafe { (*succ_entry).data() }.lock())
        } else {
            None
        };

        if State::from_u8(target.state.load(Ordering::Acquire)) != State::Allocated {
            return Err(Error::NotFound);
        }
        let pred = if pred_entry.is_null() {
            None
        } else {
            let p = unsafe { (*pred_entry).data() };
            if State::from_u8(p.state.load(Ordering::Acquire)) == State::Removed {
                return Ok(false);
            }
            Some(p)
        };
        let succ = if succ_entry.is_null() {
            None
        } else {
            let s = unsafe { (*succ_entry).data() };
            if State::from_u8(s.state.load(Ordering::Acquire)) == State::Removed {
                return Ok(false);
            }
            Some(s)
        };

        let pred_merges = pred.is_some_and(|p| p.is_free());
        let succ_merges = succ.is_some_and(|s| s.is_free());
        let merged_start = if pred_merges { pred.unwrap().start } else { target.start };
        let merged_end = if succ_merges { succ.unwrap().end } else { target.end };

        log::debug!(
            "ja_range: freeing [{:#x}, {:#x}] as merged [{merged_start:#x}, {merged_end:#x}]",
            target.start,
            target.end
        );

        let merged = Range {
            start: merged_start,
            end: merged_end,
            state: AtomicU8::new(State::Free as u8),
            lock: FasLock::new(()),
            payload: None,
        };
        self.index.add(guard, merged_start, Box::new(JaEntry::new(merged)))?;

        target.state.store(State::Removed as u8, Ordering::Release);
        if pred_merges {
            pred.unwrap().state.store(State::Removed as u8, Ordering::Release);
        }
        if succ_merges {
            succ.unwrap().state.store(State::Removed as u8, Ordering::Release);
        }

        // Release locks before unlinking the entries they guarded, same
        // as the single-entry case this replaces.
        drop(succ_guard);
        drop(target_guard);
        drop(pred_guard);

        if succ_merges {
            let _ = self.index.del(guard, succ.unwrap().start, succ_entry);
        }
        self.index.del(guard, start, target_entry)?;
        if pred_merges {
            let _ = self.index.del(guard, pred.unwrap().start, pred_entry);
        }
        Ok(true)
    }

    /// Walk the whole partition and check that it covers `[0, u64::MAX]`
    /// with no gaps and no overlaps among non-REMOVED entries, and that
    /// no two adjacent entries are both FREE. Intended for tests and
    /// diagnostics, not the hot path.
    pub fn validate(&self, guard: &R::Guard<'_>) -> bool {
        let mut cur = self.index.lookup_lower_equal(guard, 0);
        if cur.is_null() {
            return false;
        }
        let mut expect_start = 0u64;
        let mut prev_was_free = false;
        loop {
            let range = unsafe { (*cur).data() };
            if range.start != expect_start {
                return false;
            }
            let is_free = range.is_free();
            if is_free && prev_was_free {
                return false;
            }
            if range.end == u64::MAX {
                return true;
            }
            let next_start = range.end + 1;
            let next = self.index.lookup(guard, next_start);
            if next.is_null() {
                return false;
            }
            expect_start = next_start;
            prev_was_free = is_free;
            cur = next;
        }
    }

    /// Block until every deferred free filed so far by this allocator
    /// has run.
    pub fn barrier(&self) {
        self.index.barrier();
    }

    /// Tear down the allocator, running `free_payload_cb` on every
    /// surviving ALLOCATED range's payload. Not RCU-safe: the caller
    /// must guarantee no concurrent reader or writer is active.
    pub fn destroy(self, mut free_payload_cb: impl FnMut(T)) {
        self.index.destroy(|range: alloc::boxed::Box<Range<T>>| {
            let range = *range;
            if let Some(p) = range.payload {
                free_payload_cb(p);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;

    #[test]
    fn seed_then_lookup_covers_whole_space() {
        let alloc: JaRange<u32> = JaRange::new().unwrap();
        let guard = alloc.register();
        guard.enter();

        alloc.seed(&guard, 0, u64::MAX).unwrap();
        let found = alloc.lookup(&guard, 1_000_000).unwrap();
        assert!(unsafe { (*found).is_free() });

        guard.leave();
    }

    #[test]
    fn add_splits_free_range_and_reports_allocated() {
        let alloc: JaRange<u32> = JaRange::new().unwrap();
        let guard = alloc.register();
        guard.enter();

        alloc.seed(&guard, 0, 999).unwrap();
        alloc.add(&guard, 100, 199, 7).unwrap();

        let allocated = alloc.lookup(&guard, 150).unwrap();
        assert!(!unsafe { (*allocated).is_free() });
        assert_eq!(unsafe { *(*allocated).payload().unwrap() }, 7);

        let before = alloc.lookup(&guard, 50).unwrap();
        assert!(unsafe { (*before).is_free() });
        let after = alloc.lookup(&guard, 500).unwrap();
        assert!(unsafe { (*after).is_free() });

        guard.leave();
    }

    #[test]
    fn add_overlapping_allocated_range_fails() {
        let alloc: JaRange<u32> = JaRange::new().unwrap();
        let guard = alloc.register();
        guard.enter();

        alloc.seed(&guard, 0, 999).unwrap();
        alloc.add(&guard, 100, 199, 1).unwrap();
        let result = alloc.add(&guard, 150, 250, 2);
        assert_eq!(result.unwrap_err(), Error::AlreadyExists);

        guard.leave();
    }

    #[test]
    fn del_frees_previously_allocated_range() {
        let alloc: JaRange<u32> = JaRange::new().unwrap();
        let guard = alloc.register();
        guard.enter();

        alloc.seed(&guard, 0, 999).unwrap();
        alloc.add(&guard, 100, 199, 9).unwrap();
        alloc.del(&guard, 100).unwrap();

        let found = alloc.lookup(&guard, 150).unwrap();
        assert!(unsafe { (*found).is_free() });

        guard.leave();
        alloc.barrier();
    }
}
