//! Shadow-metadata map for Judy Array interior nodes.
//!
//! Interior [`crate::ja`] nodes carry no lock or book-keeping fields of
//! their own; instead each interior node's *identity* (its address) is
//! looked up in this map to find the lock that serializes mutation at
//! that tree position, its current child count, its level, and (for
//! PIGEON nodes) a fallback-removal countdown. Recompaction replaces a
//! node with one of a different size; the new node's shadow entry
//! inherits the old one's lock object so writers racing through either
//! address serialize against each other.
//!
//! The map keeps its own internal epoch-reclamation instance, independent
//! of whatever [`crate::reclaim::Reclaim`] backend the owning [`crate::ja::Ja`]
//! was configured with, mirroring the original design where the shadow
//! table's hash table "does not put any requirement on the RCU flavor
//! used by applications using the judy array."

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use crate::reclaim::epoch::EpochReclaim;
use crate::reclaim::{ReadGuard, Reclaim};
use crate::spinlock::{FasLock, FasLockGuard};

/// Mutable write-side book-keeping for one interior node.
#[derive(Debug)]
pub struct ShadowMeta {
    /// Current number of live children.
    pub nr_child: u32,
    /// Depth of this node in the tree (root is level 0).
    pub level: u8,
    /// Remaining removals before a PIGEON node under `min_child` is
    /// allowed to shrink back to POOL. Irrelevant for non-PIGEON nodes.
    pub fallback_countdown: u8,
}

/// Flags for [`ShadowMap::clear`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearFlags {
    /// Defer freeing the shadow entry itself (always true in practice;
    /// kept as a flag to mirror the original `RCUJA_SHADOW_CLEAR_FREE_NODE`).
    pub free_node: bool,
}

struct ShadowEntry {
    key: usize,
    lock: Arc<FasLock<ShadowMeta>>,
    deleted: AtomicBool,
    next: AtomicPtr<ShadowEntry>,
    /// Bumped every time `set` retargets this entry's lock from a prior
    /// one during recompaction. Diagnostic only (`trace!` level); no
    /// mutation path ever reads it back.
    generation: AtomicU64,
}

/// A handle returned by [`ShadowMap::lookup_lock`]: the entry's lock,
/// already held, re-checked not to have been concurrently removed.
pub struct ShadowGuard<'m> {
    entry: &'m ShadowEntry,
    guard: FasLockGuard<'m, ShadowMeta>,
}

impl<'m> core::ops::Deref for ShadowGuard<'m> {
    type Target = ShadowMeta;
    fn deref(&self) -> &ShadowMeta {
        &self.guard
    }
}

impl<'m> core::ops::DerefMut for ShadowGuard<'m> {
    fn deref_mut(&mut self) -> &mut ShadowMeta {
        &mut self.guard
    }
}

impl<'m> ShadowGuard<'m> {
    /// The lock object backing this entry, for sharing with a sibling
    /// entry created during recompaction.
    pub fn lock_handle(&self) -> Arc<FasLock<ShadowMeta>> {
        Arc::clone(&self.entry.lock)
    }

    fn generation(&self) -> u64 {
        self.entry.generation.load(Ordering::Relaxed)
    }
}

/// Concurrent pointer-keyed map from interior node identity to its
/// write-side book-keeping.
pub struct ShadowMap {
    buckets: Box<[AtomicPtr<ShadowEntry>]>,
    mask: u64,
    reclaim: EpochReclaim,
}

fn hash_pointer(key: usize) -> u64 {
    // Bob Jenkins' one-at-a-time finisher on the two 32-bit halves,
    // matching the mixing strength the original shadow table used for
    // pointer-identity hashing, without needing the full lookup3 mix.
    let mut h = key as u64;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

impl ShadowMap {
    /// Create a map sized for roughly `capacity_hint` concurrently-live
    /// interior nodes. The bucket count is fixed at construction and
    /// never grows (see the corresponding Open Question decision).
    pub fn new(capacity_hint: usize) -> Self {
        let n = capacity_hint.max(16).next_power_of_two();
        let buckets = (0..n)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<alloc::vec::Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            mask: (n - 1) as u64,
            reclaim: EpochReclaim::new(),
        }
    }

    fn bucket(&self, key: usize) -> &AtomicPtr<ShadowEntry> {
        let idx = (hash_pointer(key) & self.mask) as usize;
        &self.buckets[idx]
    }

    /// Find the shadow entry for `key`, lock it, and re-check it has not
    /// been concurrently removed. Returns `None` if no entry exists or
    /// the one found was deleted before the lock could be taken.
    pub fn lookup_lock(&self, key: usize) -> Option<ShadowGuard<'_>> {
        let guard = self.reclaim.register();
        guard.enter();

        let mut cur = self.bucket(key).load(Ordering::Acquire);
        let found = loop {
            if cur.is_null() {
                break None;
            }
            let entry = unsafe { &*cur };
            if entry.key == key {
                break Some(entry);
            }
            cur = entry.next.load(Ordering::Acquire);
        };

        let result = found.map(|entry| {
            let lock_guard = entry.lock.lock();
            if entry.deleted.load(Ordering::Acquire) {
                drop(lock_guard);
                None
            } else {
                Some(ShadowGuard {
                    entry,
                    guard: lock_guard,
                })
            }
        });

        guard.leave();
        result.flatten()
    }

    /// Insert a new shadow entry for `key`. When `inherit_from` names an
    /// existing entry, the new entry shares that entry's lock object so
    /// recompaction's before/after node versions serialize together.
    pub fn set(&self, key: usize, inherit_from: Option<usize>) -> Arc<FasLock<ShadowMeta>> {
        let (lock, generation) = match inherit_from.and_then(|k| self.lookup_lock(k)) {
            Some(existing) => (existing.lock_handle(), existing.generation() + 1),
            None => (
                Arc::new(FasLock::new(ShadowMeta {
                    nr_child: 0,
                    level: 0,
                    fallback_countdown: 0,
                })),
                0,
            ),
        };

        let entry = Box::into_raw(Box::new(ShadowEntry {
            key,
            lock: Arc::clone(&lock),
            deleted: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
            generation: AtomicU64::new(generation),
        }));

        let bucket = self.bucket(key);
        loop {
            let head = bucket.load(Ordering::Relaxed);
            unsafe {
                (*entry).next.store(head, Ordering::Relaxed);
            }
            if bucket
                .compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        log::trace!("shadow map: set key={key:#x} inherit_from={inherit_from:?} generation={generation}");
        lock
    }

    /// Remove the shadow entry for `key`. Marks it deleted first (so any
    /// [`ShadowMap::lookup_lock`] racing with this call observes the
    /// tombstone once it acquires the lock), then unlinks it from its
    /// bucket chain on a best-effort basis and defers freeing its memory.
    pub fn clear(&self, key: usize, flags: ClearFlags) {
        let guard = self.reclaim.register();
        guard.enter();

        let bucket = self.bucket(key);
        let mut prev: *const AtomicPtr<ShadowEntry> = bucket;
        let mut cur = bucket.load(Ordering::Acquire);
        let mut found: *mut ShadowEntry = ptr::null_mut();

        while !cur.is_null() {
            let entry = unsafe { &*cur };
            if entry.key == key {
                found = cur;
                break;
            }
            prev = &entry.next;
            cur = entry.next.load(Ordering::Acquire);
        }

        if found.is_null() {
            guard.leave();
            return;
        }

        let entry = unsafe { &*found };
        {
            let _lock_guard = entry.lock.lock();
            entry.deleted.store(true, Ordering::Release);
        }

        let next = entry.next.load(Ordering::Acquire);
        unsafe {
            let _ = (*prev).compare_exchange(found, next, Ordering::Release, Ordering::Relaxed);
        }

        if flags.free_node {
            unsafe {
                guard.defer_reclaim(found);
            }
        }
        guard.leave();
    }

    /// Block until every deferred shadow-entry free filed so far has run.
    pub fn barrier(&self) {
        self.reclaim.barrier();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_lookup_lock_succeeds() {
        let map = ShadowMap::new(16);
        map.set(0x1000, None);
        let guard = map.lookup_lock(0x1000).expect("entry should exist");
        assert_eq!(guard.nr_child, 0);
    }

    #[test]
    fn lookup_lock_missing_key_is_none() {
        let map = ShadowMap::new(16);
        assert!(map.lookup_lock(0xdead).is_none());
    }

    #[test]
    fn clear_then_lookup_lock_is_none() {
        let map = ShadowMap::new(16);
        map.set(0x2000, None);
        map.clear(0x2000, ClearFlags { free_node: true });
        assert!(map.lookup_lock(0x2000).is_none());
        map.barrier();
    }

    #[test]
    fn inherited_lock_is_shared() {
        let map = ShadowMap::new(16);
        map.set(0x3000, None);
        {
            let mut g = map.lookup_lock(0x3000).unwrap();
            g.nr_child = 5;
        }

        map.set(0x3001, Some(0x3000));
        let g2 = map.lookup_lock(0x3001).unwrap();
        // Sharing the lock does not share the meta struct's contents;
        // the new entry starts from a fresh ShadowMeta by construction
        // only when no inheritance occurred. With inheritance, the Arc
        // is literally the same allocation, so both keys observe the
        // same nr_child.
        assert_eq!(g2.nr_child, 5);
    }

    #[test]
    fn write_through_shared_lock_is_visible_both_keys() {
        let map = ShadowMap::new(16);
        map.set(0x4000, None);
        map.set(0x4001, Some(0x4000));

        {
            let mut g = map.lookup_lock(0x4001).unwrap();
            g.level = 3;
        }

        let g = map.lookup_lock(0x4000).unwrap();
        assert_eq!(g.level, 3);
    }
}
