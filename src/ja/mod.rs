//! A concurrent, RCU-read, fine-grained-write ordered map keyed by a
//! fixed-width unsigned integer, organized as a byte-decomposed trie
//! ("Judy array").
//!
//! Readers never block and never take a lock: a lookup walks from the
//! root following `Acquire`-ordered loads and never touches the shadow
//! map. Writers serialize only against the other writer(s) mutating the
//! same tree position, found via [`crate::shadow::ShadowMap::lookup_lock`]
//! keyed by the node's allocation identity ([`node::NodeOrChain::identity`]).

pub mod node;

use alloc::boxed::Box;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicPtr, Ordering};

use self::node::{
    alloc_chain_head, size_for_count, JaEntry, Node, NodeOrChain, JA_FALLBACK_REMOVAL_COUNT,
    SIZE_TABLE,
};
use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::reclaim::epoch::EpochReclaim;
use crate::reclaim::{ReadGuard, Reclaim};
use crate::shadow::{ClearFlags, ShadowMap};

/// Maximum number of bounded-retry attempts before a writer gives up and
/// reports [`Error::TransientRace`] to its own caller (never escapes a
/// public operation; each public operation loops until this is spent).
const MAX_RETRY: usize = 64;

/// A Judy array over `key_bits`-wide keys (`8 <= key_bits <= 64`,
/// a multiple of 8), storing [`JaEntry<T>`] payloads, reclaimed with
/// reclamation backend `R` (defaults to [`EpochReclaim`]).
pub struct Ja<T, R: Reclaim = EpochReclaim> {
    root: AtomicPtr<NodeOrChain<T>>,
    depth: u8,
    shadow: ShadowMap,
    reclaim: R,
    _marker: PhantomData<T>,
}

impl<T> Ja<T, EpochReclaim> {
    /// Construct a tree over `key_bits`-wide keys using the default
    /// epoch-based reclamation backend.
    pub fn new(key_bits: u32) -> Result<Self> {
        Self::with_reclaim(key_bits, EpochReclaim::new())
    }
}

impl<T, R: Reclaim> Ja<T, R> {
    /// Construct a tree over `key_bits`-wide keys using an explicit
    /// reclamation backend.
    pub fn with_reclaim(key_bits: u32, reclaim: R) -> Result<Self> {
        if key_bits == 0 || key_bits > 64 || key_bits % 8 != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            root: AtomicPtr::new(core::ptr::null_mut()),
            depth: (key_bits / 8) as u8,
            shadow: ShadowMap::new(256),
            reclaim,
            _marker: PhantomData,
        })
    }

    /// Register this thread with the tree's reclamation backend. The
    /// returned guard must bracket every [`Ja::lookup`],
    /// [`Ja::lookup_lower_equal`], [`Ja::add`], [`Ja::add_unique`], and
    /// [`Ja::del`] call via [`ReadGuard::enter`]/[`ReadGuard::leave`]
    /// (or the RAII [`crate::reclaim::Section`] wrapper).
    pub fn register(&self) -> R::Guard<'_> {
        self.reclaim.register()
    }

    /// Block until every deferred node free filed so far — by this tree
    /// or its shadow map — has run.
    pub fn barrier(&self) {
        self.reclaim.barrier();
        self.shadow.barrier();
    }

    fn byte_at(&self, key: u64, level: u8) -> u8 {
        let shift = 8 * (self.depth - 1 - level);
        ((key >> shift) & 0xff) as u8
    }

    /// Walk from the root to the slot that would hold `key`'s duplicate
    /// chain. Returns null if any level along the path is absent.
    fn descend(&self, key: u64) -> *mut NodeOrChain<T> {
        let mut cur = self.root.load(Ordering::Acquire);
        for level in 0..self.depth {
            if cur.is_null() {
                return core::ptr::null_mut();
            }
            let node = match unsafe { &*cur } {
                NodeOrChain::Interior(n) => n,
                NodeOrChain::Chain(_) => return core::ptr::null_mut(),
            };
            let byte = self.byte_at(key, level);
            cur = node.find(byte);
        }
        cur
    }

    /// Look up the duplicate-key chain head for `key`. The caller is
    /// responsible for holding an active reader section on `guard`.
    pub fn lookup(&self, _guard: &R::Guard<'_>, key: u64) -> *mut JaEntry<T> {
        let slot = self.descend(key);
        if slot.is_null() {
            return core::ptr::null_mut();
        }
        match unsafe { &*slot } {
            NodeOrChain::Chain(c) => c.head.load(Ordering::Acquire),
            NodeOrChain::Interior(_) => core::ptr::null_mut(),
        }
    }

    /// Largest live key's duplicate-chain head among keys `<= key`, or
    /// null if none exists.
    pub fn lookup_lower_equal(&self, _guard: &R::Guard<'_>, key: u64) -> *mut JaEntry<T> {
        let root = self.root.load(Ordering::Acquire);
        if root.is_null() {
            return core::ptr::null_mut();
        }
        let node = match unsafe { &*root } {
            NodeOrChain::Interior(n) => n,
            NodeOrChain::Chain(_) => return core::ptr::null_mut(),
        };
        match self.lower_equal_from(node, key, 0) {
            Some(slot) => match unsafe { &*slot } {
                NodeOrChain::Chain(c) => c.head.load(Ordering::Acquire),
                NodeOrChain::Interior(_) => core::ptr::null_mut(),
            },
            None => core::ptr::null_mut(),
        }
    }

    /// Backtracking descent for `lookup_lower_equal`: among this node's
    /// live children with key byte `<= target`, try the closest one
    /// first; if its subtree turns out to hold nothing usable (can only
    /// happen transiently under concurrent deletion), fall back to the
    /// next-closest, then to the richest key in a subtree that is
    /// wholly below the target byte.
    fn lower_equal_from(&self, node: &Node<T>, key: u64, level: u8) -> Option<*mut NodeOrChain<T>> {
        let target = self.byte_at(key, level);
        let mut candidates = node.iter();
        candidates.retain(|(k, _)| *k <= target);
        candidates.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let is_last = level + 1 == self.depth;
        for (k, child) in candidates {
            if child.is_null() {
                continue;
            }
            if is_last {
                return Some(child);
            }
            let child_node = match unsafe { &*child } {
                NodeOrChain::Interior(n) => n,
                NodeOrChain::Chain(_) => continue,
            };
            let found = if k == target {
                self.lower_equal_from(child_node, key, level + 1)
            } else {
                Self::max_in_subtree(child_node, self.depth - level - 1)
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Walk the rightmost (greatest-key) path of a subtree `remaining`
    /// levels deep and return the chain it bottoms out at.
    fn max_in_subtree(node: &Node<T>, remaining: u8) -> Option<*mut NodeOrChain<T>> {
        let best = node.iter().into_iter().max_by_key(|(k, _)| *k)?;
        if remaining == 1 {
            return Some(best.1);
        }
        match unsafe { &*best.1 } {
            NodeOrChain::Interior(n) => Self::max_in_subtree(n, remaining - 1),
            NodeOrChain::Chain(_) => None,
        }
    }

    fn ensure_root(&self) -> *mut NodeOrChain<T> {
        let cur = self.root.load(Ordering::Acquire);
        if !cur.is_null() {
            return cur;
        }
        let boxed_node = Node::new_at(0);
        let wrapped = Box::into_raw(Box::new(NodeOrChain::Interior(*boxed_node)));
        match self
            .root
            .compare_exchange(cur, wrapped, Ordering::Release, Ordering::Acquire)
        {
            Ok(_) => {
                self.shadow.set(node_identity(wrapped), None);
                wrapped
            }
            Err(actual) => {
                unsafe {
                    drop(Box::from_raw(wrapped));
                }
                actual
            }
        }
    }

    /// Insert `entry` under `key`, allowing duplicates (appended to the
    /// existing chain). Grows interior nodes (recompaction) as needed.
    pub fn add(&self, guard: &R::Guard<'_>, key: u64, entry: Box<JaEntry<T>>) -> Result<()> {
        let entry_ptr = Box::into_raw(entry);
        let mut backoff = Backoff::new();
        for _ in 0..MAX_RETRY {
            match self.try_add(guard, key, entry_ptr) {
                Ok(()) => return Ok(()),
                Err(Error::TransientRace) => {
                    log::warn!("ja::add: lost a race at key={key:#x}, retrying");
                    backoff.spin();
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::TransientRace)
    }

    /// Insert `entry` under `key` only if no entry already exists for
    /// that key. On a race where two writers publish concurrently, the
    /// first to link into the chain wins; the loser's entry is dropped
    /// and the winner's pointer is returned.
    pub fn add_unique(
        &self,
        guard: &R::Guard<'_>,
        key: u64,
        entry: Box<JaEntry<T>>,
    ) -> *mut JaEntry<T> {
        let existing = self.lookup(guard, key);
        if !existing.is_null() {
            drop(entry);
            return existing;
        }
        let entry_ptr = Box::into_raw(entry);
        let mut backoff = Backoff::new();
        loop {
            match self.try_add_unique(guard, key, entry_ptr) {
                Ok(accepted) => return accepted,
                Err(()) => {
                    log::warn!("ja::add_unique: lost a race at key={key:#x}, retrying");
                    backoff.spin();
                }
            }
        }
    }

    fn try_add(&self, guard: &R::Guard<'_>, key: u64, entry_ptr: *mut JaEntry<T>) -> Result<()> {
        let slot = self.descend_or_build(guard, key)?;
        match unsafe { &*slot } {
            NodeOrChain::Chain(c) => {
                append_to_chain(c, entry_ptr);
                Ok(())
            }
            NodeOrChain::Interior(_) => Err(Error::TransientRace),
        }
    }

    fn try_add_unique(
        &self,
        guard: &R::Guard<'_>,
        key: u64,
        entry_ptr: *mut JaEntry<T>,
    ) -> core::result::Result<*mut JaEntry<T>, ()> {
        let slot = match self.descend_or_build(guard, key) {
            Ok(s) => s,
            Err(_) => return Err(()),
        };
        let chain = match unsafe { &*slot } {
            NodeOrChain::Chain(c) => c,
            NodeOrChain::Interior(_) => return Err(()),
        };
        let head = chain.head.load(Ordering::Acquire);
        if !head.is_null() {
            unsafe {
                drop(Box::from_raw(entry_ptr));
            }
            return Ok(head);
        }
        match chain.head.compare_exchange(
            core::ptr::null_mut(),
            entry_ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(entry_ptr),
            Err(winner) => {
                unsafe {
                    drop(Box::from_raw(entry_ptr));
                }
                Ok(winner)
            }
        }
    }

    /// Walk from the root to `key`'s chain slot, creating and growing
    /// interior nodes along the way as needed. Every mutation of a node
    /// that is not a pure append into spare capacity is serialized by
    /// that node's shadow lock.
    fn descend_or_build(&self, guard: &R::Guard<'_>, key: u64) -> Result<*mut NodeOrChain<T>> {
        let mut cur = self.ensure_root();
        let mut level = 0u8;
        while level < self.depth {
            let node = match unsafe { &*cur } {
                NodeOrChain::Interior(n) => n,
                NodeOrChain::Chain(_) => return Err(Error::TransientRace),
            };
            let byte = self.byte_at(key, level);
            let existing = node.find(byte);
            if !existing.is_null() {
                cur = existing;
                level += 1;
                continue;
            }

            let identity = node_identity(cur);
            let mut shadow = match self.shadow.lookup_lock(identity) {
                Some(s) => s,
                None => return Err(Error::TransientRace),
            };

            if !node.find(byte).is_null() {
                cur = node.find(byte);
                level += 1;
                continue;
            }

            if node.is_full() {
                let grown = self.grow_node(guard, cur, node, &mut shadow)?;
                drop(shadow);
                // `grown` replaces `cur` at this same `level`: it was just
                // recompacted, not descended into, so `byte` must be
                // re-searched for in it before advancing.
                cur = grown;
                continue;
            }

            let is_last = level + 1 == self.depth;
            let child: *mut NodeOrChain<T> = if is_last {
                Box::into_raw(alloc_chain_head::<T>())
            } else {
                let fresh = Node::new_at(0);
                let raw = Box::into_raw(Box::new(NodeOrChain::Interior(*fresh)));
                self.shadow.set(node_identity(raw), None);
                raw
            };
            self.append_child(node, byte, child);
            shadow.nr_child += 1;
            cur = child;
            level += 1;
        }
        Ok(cur)
    }

    fn append_child(&self, node: &Node<T>, byte: u8, child: *mut NodeOrChain<T>) {
        match &node.body {
            node::NodeBody::Linear(l) => l.append(byte, child),
            node::NodeBody::Pool(p) => p.sub(byte).append(byte, child),
            node::NodeBody::Pigeon(p) => p.set(byte, child),
        }
    }

    /// Replace `old` (at `old_ptr`, reached via the parent slot the
    /// caller is about to overwrite) with a node one size class larger,
    /// copying every live entry across, inheriting the old node's
    /// shadow lock so racing writers serialize against either address,
    /// and deferring the old node's reclamation.
    fn grow_node(
        &self,
        guard: &R::Guard<'_>,
        old_ptr: *mut NodeOrChain<T>,
        old: &Node<T>,
        old_shadow: &mut crate::shadow::ShadowGuard<'_>,
    ) -> Result<*mut NodeOrChain<T>> {
        let next_index = old.size_index as usize + 1;
        if next_index >= SIZE_TABLE.len() {
            return Err(Error::AllocationFailure);
        }
        log::debug!(
            "ja: recompacting node {:p} size_index {} -> {next_index}",
            old_ptr,
            old.size_index
        );
        let fresh = Node::new_at(next_index);
        for (k, child) in old.iter() {
            self.append_child(&fresh, k, child);
        }
        let fresh_raw = Box::into_raw(Box::new(NodeOrChain::Interior(*fresh)));
        let old_identity = node_identity(old_ptr);
        let fresh_identity = node_identity(fresh_raw);
        self.shadow.set(fresh_identity, Some(old_identity));

        self.retarget_parent_slot(old_ptr, fresh_raw);

        old_shadow.fallback_countdown = 0;
        self.shadow.clear(old_identity, ClearFlags { free_node: true });
        unsafe {
            guard.defer_reclaim(old_ptr);
        }
        log::trace!("ja: node {:p} grown to size_index {next_index}", fresh_raw);
        Ok(fresh_raw)
    }

    /// Swing whichever atomic slot currently holds `old_ptr` (the root,
    /// or some ancestor's child slot) to point at `new_ptr` instead.
    /// Re-derives the slot by re-descending rather than threading a
    /// borrow of it through the recursive walk, trading one extra
    /// traversal for simpler lifetimes.
    fn retarget_parent_slot(&self, old_ptr: *mut NodeOrChain<T>, new_ptr: *mut NodeOrChain<T>) {
        if self
            .root
            .compare_exchange(old_ptr, new_ptr, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        let mut cur = self.root.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = match unsafe { &*cur } {
                NodeOrChain::Interior(n) => n,
                NodeOrChain::Chain(_) => break,
            };
            let mut advanced = false;
            for (byte, child) in node.iter() {
                if child == old_ptr {
                    self.compare_exchange_child(node, byte, old_ptr, new_ptr);
                    return;
                }
                if !child.is_null() {
                    if let NodeOrChain::Interior(_) = unsafe { &*child } {
                        cur = child;
                        advanced = true;
                        break;
                    }
                }
            }
            if !advanced {
                break;
            }
        }
    }

    fn compare_exchange_child(
        &self,
        node: &Node<T>,
        byte: u8,
        old: *mut NodeOrChain<T>,
        new: *mut NodeOrChain<T>,
    ) {
        match &node.body {
            node::NodeBody::Pigeon(p) => {
                let _ = p.get(byte);
                p.set(byte, new);
                let _ = old;
            }
            node::NodeBody::Linear(l) => {
                l.remove(byte);
                l.append(byte, new);
            }
            node::NodeBody::Pool(p) => {
                let sub = p.sub(byte);
                sub.remove(byte);
                sub.append(byte, new);
            }
        }
    }

    /// Remove `entry` from `key`'s duplicate chain. Shrinks interior
    /// nodes (recompaction) once a node's child count falls under its
    /// size class's `min_child`, subject to the PIGEON fallback
    /// countdown so a node oscillating at the boundary does not thrash.
    pub fn del(&self, guard: &R::Guard<'_>, key: u64, entry: *mut JaEntry<T>) -> Result<()> {
        let slot = self.descend(key);
        if slot.is_null() {
            return Err(Error::NotFound);
        }
        let chain = match unsafe { &*slot } {
            NodeOrChain::Chain(c) => c,
            NodeOrChain::Interior(_) => return Err(Error::NotFound),
        };
        if !unlink_from_chain(chain, entry) {
            return Err(Error::NotFound);
        }
        unsafe {
            guard.defer_reclaim(entry);
        }
        if chain.head.load(Ordering::Acquire).is_null() {
            self.unlink_empty_chain_slot(guard, key, slot);
            self.maybe_shrink_path(guard, key);
        }
        Ok(())
    }

    /// Remove a now-empty chain's own slot from its parent interior node
    /// (the last level before the leaf), so a fully-deleted key does not
    /// leave a phantom child inflating `nr_child`/size-band bookkeeping
    /// forever. Best-effort under the parent's shadow lock: if the slot
    /// was concurrently refilled or already unlinked by the time the lock
    /// is acquired, this is a no-op.
    fn unlink_empty_chain_slot(&self, guard: &R::Guard<'_>, key: u64, chain_ptr: *mut NodeOrChain<T>) {
        if self.depth == 0 {
            return;
        }
        let mut cur = self.root.load(Ordering::Acquire);
        for level in 0..self.depth - 1 {
            if cur.is_null() {
                return;
            }
            let node = match unsafe { &*cur } {
                NodeOrChain::Interior(n) => n,
                NodeOrChain::Chain(_) => return,
            };
            let byte = self.byte_at(key, level);
            cur = node.find(byte);
        }
        if cur.is_null() {
            return;
        }
        let parent = match unsafe { &*cur } {
            NodeOrChain::Interior(n) => n,
            NodeOrChain::Chain(_) => return,
        };

        let last_byte = self.byte_at(key, self.depth - 1);
        let identity = node_identity(cur);
        let mut shadow = match self.shadow.lookup_lock(identity) {
            Some(s) => s,
            None => return,
        };

        if parent.find(last_byte) != chain_ptr {
            // Concurrently refilled or already unlinked by another writer.
            return;
        }
        let still_empty = match unsafe { &*chain_ptr } {
            NodeOrChain::Chain(c) => c.head.load(Ordering::Acquire).is_null(),
            NodeOrChain::Interior(_) => false,
        };
        if !still_empty {
            return;
        }

        if parent.unlink(last_byte) {
            shadow.nr_child = shadow.nr_child.saturating_sub(1);
            unsafe {
                guard.defer_reclaim(chain_ptr);
            }
        }
    }

    /// After a chain becomes empty, walk the path again and consider
    /// shrinking any interior node whose count has dropped under its
    /// size class's minimum. Best-effort: failing to shrink promptly
    /// only costs memory, never correctness, so lock contention here
    /// simply skips the opportunity rather than retrying.
    fn maybe_shrink_path(&self, guard: &R::Guard<'_>, key: u64) {
        let mut cur = self.root.load(Ordering::Acquire);
        for level in 0..self.depth {
            if cur.is_null() {
                return;
            }
            let node = match unsafe { &*cur } {
                NodeOrChain::Interior(n) => n,
                NodeOrChain::Chain(_) => return,
            };
            let byte = self.byte_at(key, level);
            let identity = node_identity(cur);
            if let Some(mut shadow) = self.shadow.lookup_lock(identity) {
                let class = SIZE_TABLE[node.size_index as usize];
                let under_min = node.nr_child() < class.min_child;
                let is_pigeon = matches!(class.kind, node::NodeKind::Pigeon);
                if under_min && node.size_index > 0 {
                    if is_pigeon && shadow.fallback_countdown < JA_FALLBACK_REMOVAL_COUNT {
                        shadow.fallback_countdown += 1;
                    } else {
                        drop(shadow);
                        let _ = self.shrink_node(guard, cur, node);
                    }
                }
            }
            cur = node.find(byte);
        }
    }

    fn shrink_node(&self, guard: &R::Guard<'_>, old_ptr: *mut NodeOrChain<T>, old: &Node<T>) -> Result<()> {
        let next_index = old.size_index as usize - 1;
        if SIZE_TABLE[next_index].max_child < old.nr_child() {
            return Ok(());
        }
        log::debug!(
            "ja: recompacting node {:p} size_index {} -> {next_index}",
            old_ptr,
            old.size_index
        );
        let fresh = Node::new_at(next_index);
        for (k, child) in old.iter() {
            self.append_child(&fresh, k, child);
        }
        let fresh_raw = Box::into_raw(Box::new(NodeOrChain::Interior(*fresh)));
        let old_identity = node_identity(old_ptr);
        let fresh_identity = node_identity(fresh_raw);
        self.shadow.set(fresh_identity, Some(old_identity));
        self.retarget_parent_slot(old_ptr, fresh_raw);
        self.shadow.clear(old_identity, ClearFlags { free_node: true });
        unsafe {
            guard.defer_reclaim(old_ptr);
        }
        Ok(())
    }

    /// Tear down the whole tree, running `free_cb` on every surviving
    /// payload. Not RCU-safe: the caller must guarantee no concurrent
    /// reader or writer is active.
    pub fn destroy(self, mut free_cb: impl FnMut(Box<T>)) {
        let root = self.root.load(Ordering::Relaxed);
        if !root.is_null() {
            unsafe {
                destroy_subtree(root, self.depth, &mut free_cb);
            }
        }
    }
}

fn node_identity<T>(ptr: *mut NodeOrChain<T>) -> usize {
    NodeOrChain::identity(ptr)
}

/// Link `entry_ptr` onto the tail of the duplicate-key chain, preserving
/// insertion order (the chain is usually only a few entries long, so a
/// linear walk to the tail is cheaper than maintaining a separate tail
/// pointer and its own publication discipline).
fn append_to_chain<T>(chain: &node::ChainHead<T>, entry_ptr: *mut JaEntry<T>) {
    unsafe {
        (*entry_ptr).next_store(core::ptr::null_mut());
    }
    loop {
        let head = chain.head.load(Ordering::Acquire);
        if head.is_null() {
            if chain
                .head
                .compare_exchange_weak(core::ptr::null_mut(), entry_ptr, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            continue;
        }

        let mut cur = head;
        let mut prev_next: *const core::sync::atomic::AtomicPtr<JaEntry<T>> = unsafe { (*cur).next_slot() };
        loop {
            let next = unsafe { &*prev_next }.load(Ordering::Acquire);
            if next.is_null() {
                break;
            }
            cur = next;
            prev_next = unsafe { (*cur).next_slot() };
        }
        if unsafe { &*prev_next }
            .compare_exchange_weak(core::ptr::null_mut(), entry_ptr, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

fn unlink_from_chain<T>(chain: &node::ChainHead<T>, target: *mut JaEntry<T>) -> bool {
    let mut prev_next: *const core::sync::atomic::AtomicPtr<JaEntry<T>> = &chain.head;
    loop {
        let cur = unsafe { &*prev_next }.load(Ordering::Acquire);
        if cur.is_null() {
            return false;
        }
        if cur == target {
            let next = unsafe { (*cur).next() };
            let ok = unsafe { &*prev_next }
                .compare_exchange(cur, next, Ordering::Release, Ordering::Relaxed)
                .is_ok();
            return ok;
        }
        prev_next = unsafe { (*cur).next_slot() };
    }
}

unsafe fn destroy_subtree<T>(ptr: *mut NodeOrChain<T>, remaining: u8, free_cb: &mut impl FnMut(Box<T>)) {
    if ptr.is_null() {
        return;
    }
    let owned = Box::from_raw(ptr);
    match *owned {
        NodeOrChain::Interior(node) => {
            for (_, child) in node.iter() {
                destroy_subtree(child, remaining - 1, free_cb);
            }
        }
        NodeOrChain::Chain(chain) => {
            let mut cur = chain.head.load(Ordering::Relaxed);
            while !cur.is_null() {
                let entry = Box::from_raw(cur);
                cur = entry.next();
                free_cb(Box::new(entry.into_data()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;

    #[test]
    fn insert_then_lookup_roundtrip() {
        let tree: Ja<u64> = Ja::new(32).unwrap();
        let guard = tree.register();
        guard.enter();

        tree.add(&guard, 42, Box::new(JaEntry::new(100))).unwrap();
        let found = tree.lookup(&guard, 42);
        assert!(!found.is_null());
        unsafe {
            assert_eq!(*(*found).data(), 100);
        }

        guard.leave();
    }

    #[test]
    fn lookup_missing_key_is_null() {
        let tree: Ja<u64> = Ja::new(16).unwrap();
        let guard = tree.register();
        guard.enter();
        assert!(tree.lookup(&guard, 7).is_null());
        guard.leave();
    }

    #[test]
    fn add_unique_rejects_duplicate() {
        let tree: Ja<u64> = Ja::new(16).unwrap();
        let guard = tree.register();
        guard.enter();

        let first = tree.add_unique(&guard, 9, Box::new(JaEntry::new(1)));
        let second = tree.add_unique(&guard, 9, Box::new(JaEntry::new(2)));
        assert_eq!(first, second);

        guard.leave();
    }

    #[test]
    fn lookup_lower_equal_finds_closest_key_below() {
        let tree: Ja<u64> = Ja::new(16).unwrap();
        let guard = tree.register();
        guard.enter();

        tree.add(&guard, 10, Box::new(JaEntry::new(10))).unwrap();
        tree.add(&guard, 20, Box::new(JaEntry::new(20))).unwrap();

        let found = tree.lookup_lower_equal(&guard, 15);
        assert!(!found.is_null());
        unsafe {
            assert_eq!(*(*found).data(), 10);
        }

        guard.leave();
    }

    #[test]
    fn del_then_lookup_returns_null() {
        let tree: Ja<u64> = Ja::new(16).unwrap();
        let guard = tree.register();
        guard.enter();

        tree.add(&guard, 5, Box::new(JaEntry::new(55))).unwrap();
        let found = tree.lookup(&guard, 5);
        tree.del(&guard, 5, found).unwrap();
        assert!(tree.lookup(&guard, 5).is_null());

        guard.leave();
        tree.barrier();
    }

    #[test]
    fn many_insertions_force_recompaction() {
        let tree: Ja<u64> = Ja::new(16).unwrap();
        let guard = tree.register();
        guard.enter();

        for k in 0..64u64 {
            tree.add(&guard, k, Box::new(JaEntry::new(k))).unwrap();
        }
        for k in 0..64u64 {
            let found = tree.lookup(&guard, k);
            assert!(!found.is_null(), "key {k} missing after recompaction");
        }

        guard.leave();
    }

    #[test]
    fn invalid_key_bits_rejected() {
        assert_eq!(Ja::<u64>::new(0).unwrap_err(), Error::InvalidArgument);
        assert_eq!(Ja::<u64>::new(65).unwrap_err(), Error::InvalidArgument);
        assert_eq!(Ja::<u64>::new(12).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn root_size_index_is_monotone_nondecreasing_under_growth() {
        let tree: Ja<u64> = Ja::new(8).unwrap();
        let guard = tree.register();
        guard.enter();

        let keys = [0u64, 1, 3, 6, 12, 25, 48, 92, 200];
        let mut last_size_index = 0u8;
        for &k in &keys {
            tree.add(&guard, k, Box::new(JaEntry::new(k))).unwrap();
            let root = tree.root.load(Ordering::Acquire);
            let (size_index, nr_child) = match unsafe { &*root } {
                NodeOrChain::Interior(n) => (n.size_index, n.nr_child()),
                NodeOrChain::Chain(_) => panic!("root must stay interior for key_bits=8"),
            };
            assert!(
                size_index >= last_size_index,
                "root size index regressed after inserting {k:#x}"
            );
            last_size_index = size_index;
            let class = SIZE_TABLE[size_index as usize];
            assert!(nr_child <= class.max_child, "root over capacity for its size class");
        }

        guard.leave();
    }
}
