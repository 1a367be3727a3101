//! RCU-read, mutex-write interval tree.
//!
//! A red-black tree (Cormen/Leiserson/Rivest/Stein, ch. 13) augmented
//! with each subtree's maximum interval end, used by
//! [`crate::ja_range::JaRange`] to answer "does any range overlap
//! `[lo, hi]`" without a linear scan. Readers call [`RbTree::search`],
//! [`RbTree::min`]/[`RbTree::max`]/[`RbTree::next`]/[`RbTree::prev`]
//! under nothing more than an active reclamation-guard section.
//! Writers ([`RbTree::insert`]/[`RbTree::remove`]) internally acquire the
//! tree's mutex `M` (by default [`crate::spinlock::TicketLock`]) for the
//! duration of the call, so they never run concurrently with each other
//! even without any caller-side discipline; every rotation is
//! copy-on-write, so a reader who loaded a node before a rotation keeps
//! following a self-consistent (if stale) view of the tree rather than
//! observing a half-rotated one.

use alloc::boxed::Box;
use core::cmp::Ordering as CmpOrdering;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};

use crate::reclaim::{ReadGuard, Reclaim};
use crate::spinlock::{TicketLock, TicketLockGuard};

const RED: u8 = 0;
const BLACK: u8 = 1;

/// A closed interval `[begin, end]` plus an opaque payload, stored as
/// one red-black tree node.
pub struct RbNode<T> {
    begin: u64,
    end: u64,
    max_end: AtomicU64,
    color: AtomicU8,
    parent: AtomicPtr<RbNode<T>>,
    left: AtomicPtr<RbNode<T>>,
    right: AtomicPtr<RbNode<T>>,
    /// Once a node is spliced out by a copy-on-write rotation or
    /// transplant, `decay_next` points at the node that replaced it so
    /// a reader holding a stale pointer can step forward to live data
    /// instead of dereferencing a freed node. Never cleared; the node
    /// itself is only freed once no reader can still be chasing it.
    decay_next: AtomicPtr<RbNode<T>>,
    /// Wrapped so [`RbTree::remove`]'s two-child case can move this
    /// node's data into a freshly published replacement without also
    /// running its destructor here when this node is later reclaimed —
    /// see the `data_moved` flag below and this type's `Drop` impl.
    data: ManuallyDrop<T>,
    data_moved: bool,
}

impl<T> RbNode<T> {
    fn new(begin: u64, end: u64, data: T) -> Box<Self> {
        Box::new(Self {
            begin,
            end,
            max_end: AtomicU64::new(end),
            color: AtomicU8::new(RED),
            parent: AtomicPtr::new(core::ptr::null_mut()),
            left: AtomicPtr::new(core::ptr::null_mut()),
            right: AtomicPtr::new(core::ptr::null_mut()),
            decay_next: AtomicPtr::new(core::ptr::null_mut()),
            data: ManuallyDrop::new(data),
            data_moved: false,
        })
    }

    /// The interval this node covers.
    pub fn interval(&self) -> (u64, u64) {
        (self.begin, self.end)
    }

    /// Borrow the payload.
    pub fn data(&self) -> &T {
        &self.data
    }

    fn decay(&self) -> *mut RbNode<T> {
        self.decay_next.load(Ordering::Acquire)
    }

    fn max_end(&self) -> u64 {
        self.max_end.load(Ordering::Acquire)
    }

    fn color(&self) -> u8 {
        self.color.load(Ordering::Acquire)
    }
}

impl<T> Drop for RbNode<T> {
    fn drop(&mut self) {
        if !self.data_moved {
            unsafe {
                ManuallyDrop::drop(&mut self.data);
            }
        }
    }
}

unsafe fn follow_decay<T>(mut p: *mut RbNode<T>) -> *mut RbNode<T> {
    while !p.is_null() {
        let next = (*p).decay();
        if next.is_null() {
            break;
        }
        p = next;
    }
    p
}

/// A concurrent interval tree. `R` is the reclamation backend used to
/// defer freeing nodes spliced out by a write; `M` is the mutex
/// serializing writers.
pub struct RbTree<T, R: Reclaim, M = TicketLock<()>> {
    root: AtomicPtr<RbNode<T>>,
    lock: M,
    reclaim: R,
}

impl<T, R: Reclaim> RbTree<T, R, TicketLock<()>> {
    /// Construct an empty tree guarded by the default [`TicketLock`].
    pub fn new(reclaim: R) -> Self {
        Self {
            root: AtomicPtr::new(core::ptr::null_mut()),
            lock: TicketLock::new(()),
            reclaim,
        }
    }
}

impl<T, R: Reclaim, M> RbTree<T, R, M> {
    /// Register this thread with the tree's reclamation backend. The
    /// returned guard must bracket every read-side call
    /// ([`RbTree::search`] and friends, [`RbTree::min`]/[`RbTree::max`]/
    /// [`RbTree::next`]/[`RbTree::prev`]) via [`ReadGuard::enter`]/
    /// [`ReadGuard::leave`] (or the RAII [`crate::reclaim::Section`]
    /// wrapper).
    pub fn register(&self) -> R::Guard<'_> {
        self.reclaim.register()
    }

    /// Block until every deferred node free filed so far by this tree
    /// has run.
    pub fn barrier(&self) {
        self.reclaim.barrier();
    }

    fn root(&self) -> *mut RbNode<T> {
        unsafe { follow_decay(self.root.load(Ordering::Acquire)) }
    }

    /// Find a node whose interval contains `point`, if any.
    pub fn search(&self, _guard: &R::Guard<'_>, point: u64) -> Option<*const RbNode<T>> {
        let mut cur = self.root();
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if point >= node.begin && point <= node.end {
                return Some(cur as *const _);
            }
            let left = unsafe { follow_decay(node.left.load(Ordering::Acquire)) };
            let go_left = !left.is_null() && unsafe { &*left }.max_end() >= point;
            cur = if go_left {
                left
            } else {
                unsafe { follow_decay(node.right.load(Ordering::Acquire)) }
            };
        }
        None
    }

    /// Find a node whose interval overlaps `[begin, end]`, if any. Same
    /// descent as [`RbTree::search`], generalized from point-containment
    /// to interval overlap.
    pub fn search_range(&self, _guard: &R::Guard<'_>, begin: u64, end: u64) -> Option<*const RbNode<T>> {
        let mut cur = self.root();
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if node.begin <= end && begin <= node.end {
                return Some(cur as *const _);
            }
            let left = unsafe { follow_decay(node.left.load(Ordering::Acquire)) };
            let go_left = !left.is_null() && unsafe { &*left }.max_end() >= begin;
            cur = if go_left {
                left
            } else {
                unsafe { follow_decay(node.right.load(Ordering::Acquire)) }
            };
        }
        None
    }

    /// Find the node whose interval begins exactly at `begin`, if any.
    pub fn search_begin_key(&self, _guard: &R::Guard<'_>, begin: u64) -> Option<*const RbNode<T>> {
        let mut cur = self.root();
        while !cur.is_null() {
            let node = unsafe { &*cur };
            match begin.cmp(&node.begin) {
                CmpOrdering::Equal => return Some(cur as *const _),
                CmpOrdering::Less => cur = unsafe { follow_decay(node.left.load(Ordering::Acquire)) },
                CmpOrdering::Greater => {
                    cur = unsafe { follow_decay(node.right.load(Ordering::Acquire)) }
                }
            }
        }
        None
    }

    /// Smallest-begin node in the tree.
    pub fn min(&self, _guard: &R::Guard<'_>) -> Option<*const RbNode<T>> {
        let mut cur = self.root();
        if cur.is_null() {
            return None;
        }
        loop {
            let left = unsafe { follow_decay((*cur).left.load(Ordering::Acquire)) };
            if left.is_null() {
                return Some(cur as *const _);
            }
            cur = left;
        }
    }

    /// Largest-begin node in the tree.
    pub fn max(&self, _guard: &R::Guard<'_>) -> Option<*const RbNode<T>> {
        let mut cur = self.root();
        if cur.is_null() {
            return None;
        }
        loop {
            let right = unsafe { follow_decay((*cur).right.load(Ordering::Acquire)) };
            if right.is_null() {
                return Some(cur as *const _);
            }
            cur = right;
        }
    }

    /// In-order successor of `node`.
    pub fn next(&self, _guard: &R::Guard<'_>, node: *const RbNode<T>) -> Option<*const RbNode<T>> {
        unsafe { inorder_step(node as *mut RbNode<T>, true) }
    }

    /// In-order predecessor of `node`.
    pub fn prev(&self, _guard: &R::Guard<'_>, node: *const RbNode<T>) -> Option<*const RbNode<T>> {
        unsafe { inorder_step(node as *mut RbNode<T>, false) }
    }

    /// Whether `node` is the null sentinel — i.e. whether any of the
    /// search/traversal primitives above actually found something.
    /// Offered for callers who prefer `is_nil(x)` over matching on
    /// `Option`; equivalent to `node.is_none()`.
    pub fn is_nil(node: Option<*const RbNode<T>>) -> bool {
        node.is_none()
    }
}

unsafe fn inorder_step<T>(node: *mut RbNode<T>, forward: bool) -> Option<*const RbNode<T>> {
    let node = follow_decay(node);
    if node.is_null() {
        return None;
    }
    let n = &*node;
    let near = if forward { &n.right } else { &n.left };
    let mut cur = follow_decay(near.load(Ordering::Acquire));
    if !cur.is_null() {
        loop {
            let c = &*cur;
            let deep_slot = if forward { &c.left } else { &c.right };
            let deep = follow_decay(deep_slot.load(Ordering::Acquire));
            if deep.is_null() {
                return Some(cur as *const _);
            }
            cur = deep;
        }
    }
    // Walk up until we cross an edge taken from the "far" side.
    let mut child = node;
    let mut parent = follow_decay(n.parent.load(Ordering::Acquire));
    while !parent.is_null() {
        let p = &*parent;
        let far = if forward { &p.left } else { &p.right };
        if core::ptr::eq(far.load(Ordering::Acquire), child) {
            return Some(parent as *const _);
        }
        child = parent;
        parent = follow_decay(p.parent.load(Ordering::Acquire));
    }
    None
}

impl<T, R: Reclaim, M> RbTree<T, R, M>
where
    M: WriteLock,
{
    /// Insert `(begin, end, data)`. Acquires `M` for the duration of the
    /// call, so two threads calling `insert`/`remove` on the same tree
    /// concurrently serialize against each other automatically. `guard`
    /// defers reclamation of any node a rebalancing rotation supersedes.
    pub fn insert(&self, guard: &R::Guard<'_>, begin: u64, end: u64, data: T) -> *mut RbNode<T> {
        let _write_guard = self.lock.acquire();
        let node = Box::into_raw(RbNode::new(begin, end, data));
        let mut parent: *mut RbNode<T> = core::ptr::null_mut();
        let mut cur = self.root.load(Ordering::Relaxed);

        while !cur.is_null() {
            parent = cur;
            let p = unsafe { &*cur };
            bump_max_end(p, end);
            cur = if begin < p.begin {
                p.left.load(Ordering::Relaxed)
            } else {
                p.right.load(Ordering::Relaxed)
            };
        }

        unsafe {
            (*node).parent.store(parent, Ordering::Relaxed);
        }
        if parent.is_null() {
            self.root.store(node, Ordering::Release);
        } else {
            let p = unsafe { &*parent };
            if begin < p.begin {
                p.left.store(node, Ordering::Release);
            } else {
                p.right.store(node, Ordering::Release);
            }
        }

        self.fixup_insert(guard, node);
        node
    }

    fn fixup_insert(&self, guard: &R::Guard<'_>, mut z: *mut RbNode<T>) {
        unsafe {
            while !(*z).parent.load(Ordering::Relaxed).is_null()
                && (*(*z).parent.load(Ordering::Relaxed)).color() == RED
            {
                let parent = (*z).parent.load(Ordering::Relaxed);
                let grandparent = (*parent).parent.load(Ordering::Relaxed);
                if grandparent.is_null() {
                    break;
                }
                let parent_is_left = core::ptr::eq((*grandparent).left.load(Ordering::Relaxed), parent);
                let uncle = if parent_is_left {
                    (*grandparent).right.load(Ordering::Relaxed)
                } else {
                    (*grandparent).left.load(Ordering::Relaxed)
                };

                if !uncle.is_null() && (*uncle).color() == RED {
                    (*parent).color.store(BLACK, Ordering::Relaxed);
                    (*uncle).color.store(BLACK, Ordering::Relaxed);
                    (*grandparent).color.store(RED, Ordering::Relaxed);
                    z = grandparent;
                } else if parent_is_left {
                    if core::ptr::eq((*parent).right.load(Ordering::Relaxed), z) {
                        z = parent;
                        z = self.rotate_left(guard, z);
                    }
                    let parent = (*z).parent.load(Ordering::Relaxed);
                    let grandparent = (*parent).parent.load(Ordering::Relaxed);
                    (*parent).color.store(BLACK, Ordering::Relaxed);
                    (*grandparent).color.store(RED, Ordering::Relaxed);
                    self.rotate_right(guard, grandparent);
                } else {
                    if core::ptr::eq((*parent).left.load(Ordering::Relaxed), z) {
                        z = parent;
                        z = self.rotate_right(guard, z);
                    }
                    let parent = (*z).parent.load(Ordering::Relaxed);
                    let grandparent = (*parent).parent.load(Ordering::Relaxed);
                    (*parent).color.store(BLACK, Ordering::Relaxed);
                    (*grandparent).color.store(RED, Ordering::Relaxed);
                    self.rotate_left(guard, grandparent);
                }
            }
            let root = self.root.load(Ordering::Relaxed);
            (*root).color.store(BLACK, Ordering::Release);
        }
    }

    /// Rotate left around `x`, publishing the new subtree root with a
    /// single `Release` store into `x`'s old parent slot. Both `x` and
    /// `y` (its old right child, which becomes the new subtree root)
    /// have several fields change as a unit — child pointers, parent
    /// pointer, color — so each gets a freshly allocated replacement
    /// (mirroring [`RbTree::replace_with_copy`]) rather than having
    /// those fields mutated on the live node one at a time, which would
    /// let a concurrent reader observe a half-rotated node. `x` and `y`
    /// decay to their respective replacements and are handed to `guard`
    /// for deferred reclamation. Returns the replacement for `x`, since
    /// callers that hold a stale copy of the old `x` pointer need it to
    /// keep rebalancing from a live node.
    fn rotate_left(&self, guard: &R::Guard<'_>, x: *mut RbNode<T>) -> *mut RbNode<T> {
        log::debug!("rbtree: rotate_left around {:p}", x);
        unsafe {
            let y = (*x).right.load(Ordering::Relaxed);
            let x_left = (*x).left.load(Ordering::Relaxed);
            let y_left = (*y).left.load(Ordering::Relaxed);
            let y_right = (*y).right.load(Ordering::Relaxed);
            let parent = (*x).parent.load(Ordering::Relaxed);

            let x_data = ManuallyDrop::into_inner(core::ptr::read(&(*x).data));
            (*x).data_moved = true;
            let y_data = ManuallyDrop::into_inner(core::ptr::read(&(*y).data));
            (*y).data_moved = true;

            let new_x = Box::into_raw(RbNode::new((*x).begin, (*x).end, x_data));
            let new_y = Box::into_raw(RbNode::new((*y).begin, (*y).end, y_data));

            (*new_x).color.store((*x).color(), Ordering::Relaxed);
            (*new_x).left.store(x_left, Ordering::Relaxed);
            (*new_x).right.store(y_left, Ordering::Relaxed);
            (*new_x).parent.store(new_y, Ordering::Relaxed);
            if !x_left.is_null() {
                (*x_left).parent.store(new_x, Ordering::Release);
            }
            if !y_left.is_null() {
                (*y_left).parent.store(new_x, Ordering::Release);
            }
            recompute_max_end(new_x);

            (*new_y).color.store((*y).color(), Ordering::Relaxed);
            (*new_y).left.store(new_x, Ordering::Relaxed);
            (*new_y).right.store(y_right, Ordering::Relaxed);
            (*new_y).parent.store(parent, Ordering::Relaxed);
            if !y_right.is_null() {
                (*y_right).parent.store(new_y, Ordering::Release);
            }
            recompute_max_end(new_y);

            if parent.is_null() {
                self.root.store(new_y, Ordering::Release);
            } else if core::ptr::eq((*parent).left.load(Ordering::Relaxed), x) {
                (*parent).left.store(new_y, Ordering::Release);
            } else {
                (*parent).right.store(new_y, Ordering::Release);
            }

            (*x).decay_next.store(new_x, Ordering::Release);
            (*y).decay_next.store(new_y, Ordering::Release);
            (*x).max_end.store(0, Ordering::Relaxed);
            (*y).max_end.store(0, Ordering::Relaxed);
            guard.defer_reclaim(x);
            guard.defer_reclaim(y);

            new_x
        }
    }

    /// Mirror image of [`RbTree::rotate_left`]; see its doc comment.
    fn rotate_right(&self, guard: &R::Guard<'_>, x: *mut RbNode<T>) -> *mut RbNode<T> {
        log::debug!("rbtree: rotate_right around {:p}", x);
        unsafe {
            let y = (*x).left.load(Ordering::Relaxed);
            let x_right = (*x).right.load(Ordering::Relaxed);
            let y_right = (*y).right.load(Ordering::Relaxed);
            let y_left = (*y).left.load(Ordering::Relaxed);
            let parent = (*x).parent.load(Ordering::Relaxed);

            let x_data = ManuallyDrop::into_inner(core::ptr::read(&(*x).data));
            (*x).data_moved = true;
            let y_data = ManuallyDrop::into_inner(core::ptr::read(&(*y).data));
            (*y).data_moved = true;

            let new_x = Box::into_raw(RbNode::new((*x).begin, (*x).end, x_data));
            let new_y = Box::into_raw(RbNode::new((*y).begin, (*y).end, y_data));

            (*new_x).color.store((*x).color(), Ordering::Relaxed);
            (*new_x).right.store(x_right, Ordering::Relaxed);
            (*new_x).left.store(y_right, Ordering::Relaxed);
            (*new_x).parent.store(new_y, Ordering::Relaxed);
            if !x_right.is_null() {
                (*x_right).parent.store(new_x, Ordering::Release);
            }
            if !y_right.is_null() {
                (*y_right).parent.store(new_x, Ordering::Release);
            }
            recompute_max_end(new_x);

            (*new_y).color.store((*y).color(), Ordering::Relaxed);
            (*new_y).right.store(new_x, Ordering::Relaxed);
            (*new_y).left.store(y_left, Ordering::Relaxed);
            (*new_y).parent.store(parent, Ordering::Relaxed);
            if !y_left.is_null() {
                (*y_left).parent.store(new_y, Ordering::Release);
            }
            recompute_max_end(new_y);

            if parent.is_null() {
                self.root.store(new_y, Ordering::Release);
            } else if core::ptr::eq((*parent).left.load(Ordering::Relaxed), x) {
                (*parent).left.store(new_y, Ordering::Release);
            } else {
                (*parent).right.store(new_y, Ordering::Release);
            }

            (*x).decay_next.store(new_x, Ordering::Release);
            (*y).decay_next.store(new_y, Ordering::Release);
            (*x).max_end.store(0, Ordering::Relaxed);
            (*y).max_end.store(0, Ordering::Relaxed);
            guard.defer_reclaim(x);
            guard.defer_reclaim(y);

            new_x
        }
    }

    /// Remove `node` from the tree. The two-children case uses
    /// "teleportation": rather than splicing the in-order successor
    /// into `node`'s position in place (which would mutate a node a
    /// reader might be visiting), a *fresh copy* of the successor
    /// replaces `node`, and the original successor slot is spliced out
    /// as if it held the successor's (now-vacated) single child. `node`
    /// itself is marked decayed to its replacement and its reclamation
    /// deferred.
    pub fn remove(&self, guard: &R::Guard<'_>, node: *mut RbNode<T>) {
        let _write_guard = self.lock.acquire();
        unsafe {
            let has_two_children =
                !(*node).left.load(Ordering::Relaxed).is_null() && !(*node).right.load(Ordering::Relaxed).is_null();

            if has_two_children {
                let succ = {
                    let mut cur = (*node).right.load(Ordering::Relaxed);
                    while !(*cur).left.load(Ordering::Relaxed).is_null() {
                        cur = (*cur).left.load(Ordering::Relaxed);
                    }
                    cur
                };
                self.splice_out_successor(guard, succ);
                self.replace_with_copy(node, succ, guard);
            } else {
                self.splice_single_child(guard, node);
                (*node).max_end.store(0, Ordering::Relaxed);
                guard.defer_reclaim(node);
            }
        }
    }

    /// Remove `succ` (which has at most a right child) from its current
    /// position, rebalancing as needed, without touching its key/data.
    /// `succ` itself is left for [`RbTree::replace_with_copy`] to decay
    /// and defer-reclaim, since its interval is about to be teleported
    /// into `node`'s old slot rather than simply discarded.
    unsafe fn splice_out_successor(&self, guard: &R::Guard<'_>, succ: *mut RbNode<T>) {
        self.splice_single_child(guard, succ);
    }

    /// Splice `node` out of the tree in favor of its single child, if
    /// any. The child is promoted into `node`'s old slot via a freshly
    /// allocated copy — the same pattern [`RbTree::replace_with_copy`]
    /// uses for the two-child case — rather than updating the child's
    /// parent pointer and `node`'s parent's child-slot pointer as two
    /// separate in-place writes a concurrent reader could observe
    /// half-done. The child decays to its replacement and is handed to
    /// `guard` for deferred reclamation; `node` itself is left for the
    /// caller to dispose of, since callers differ on whether `node`'s
    /// own interval is simply gone (a real deletion) or is about to be
    /// replaced by a teleported copy ([`RbTree::splice_out_successor`]).
    unsafe fn splice_single_child(&self, guard: &R::Guard<'_>, node: *mut RbNode<T>) {
        let child = {
            let left = (*node).left.load(Ordering::Relaxed);
            if !left.is_null() {
                left
            } else {
                (*node).right.load(Ordering::Relaxed)
            }
        };
        let parent = (*node).parent.load(Ordering::Relaxed);
        let node_was_black = (*node).color() == BLACK;

        if child.is_null() {
            if parent.is_null() {
                self.root.store(core::ptr::null_mut(), Ordering::Release);
            } else if core::ptr::eq((*parent).left.load(Ordering::Relaxed), node) {
                (*parent).left.store(core::ptr::null_mut(), Ordering::Release);
            } else {
                (*parent).right.store(core::ptr::null_mut(), Ordering::Release);
            }
            if !parent.is_null() {
                recompute_max_end(parent);
            }
            if node_was_black {
                self.fixup_remove(guard, core::ptr::null_mut(), parent);
            }
            return;
        }

        let child_left = (*child).left.load(Ordering::Relaxed);
        let child_right = (*child).right.load(Ordering::Relaxed);
        let child_data = ManuallyDrop::into_inner(core::ptr::read(&(*child).data));
        (*child).data_moved = true;

        let replacement = Box::into_raw(RbNode::new((*child).begin, (*child).end, child_data));
        (*replacement).color.store((*child).color(), Ordering::Relaxed);
        (*replacement).left.store(child_left, Ordering::Relaxed);
        (*replacement).right.store(child_right, Ordering::Relaxed);
        (*replacement).parent.store(parent, Ordering::Relaxed);
        if !child_left.is_null() {
            (*child_left).parent.store(replacement, Ordering::Release);
        }
        if !child_right.is_null() {
            (*child_right).parent.store(replacement, Ordering::Release);
        }
        if parent.is_null() {
            self.root.store(replacement, Ordering::Release);
        } else if core::ptr::eq((*parent).left.load(Ordering::Relaxed), node) {
            (*parent).left.store(replacement, Ordering::Release);
        } else {
            (*parent).right.store(replacement, Ordering::Release);
        }
        recompute_max_end(replacement);
        if !parent.is_null() {
            recompute_max_end(parent);
        }

        (*child).decay_next.store(replacement, Ordering::Release);
        (*child).max_end.store(0, Ordering::Relaxed);
        guard.defer_reclaim(child);

        if node_was_black {
            self.fixup_remove(guard, replacement, parent);
        }
    }

    /// Publish a freshly allocated node carrying `succ`'s interval in
    /// `node`'s old position, copying `node`'s color and topology, then
    /// decay both `node` and `succ` toward it.
    unsafe fn replace_with_copy(&self, node: *mut RbNode<T>, succ: *mut RbNode<T>, guard: &R::Guard<'_>) {
        // `node` may itself have decayed: it sits on `succ`'s ancestor
        // path, so the rebalancing splicing `succ` out already ran
        // could have rotated around `node` and replaced it.
        let node = follow_decay(node);
        log::debug!("rbtree: teleporting successor {:p} into {:p}'s place", succ, node);
        let moved_data = ManuallyDrop::into_inner(core::ptr::read(&(*succ).data));
        (*succ).data_moved = true;
        let replacement = RbNode::new((*succ).begin, (*succ).end, moved_data);
        let replacement = Box::into_raw(replacement);

        (*replacement).color.store((*node).color(), Ordering::Relaxed);
        let parent = (*node).parent.load(Ordering::Relaxed);
        let left = (*node).left.load(Ordering::Relaxed);
        let right = (*node).right.load(Ordering::Relaxed);

        (*replacement).parent.store(parent, Ordering::Relaxed);
        (*replacement).left.store(left, Ordering::Relaxed);
        (*replacement).right.store(right, Ordering::Relaxed);
        if !left.is_null() {
            (*left).parent.store(replacement, Ordering::Release);
        }
        if !right.is_null() {
            (*right).parent.store(replacement, Ordering::Release);
        }
        if parent.is_null() {
            self.root.store(replacement, Ordering::Release);
        } else if core::ptr::eq((*parent).left.load(Ordering::Relaxed), node) {
            (*parent).left.store(replacement, Ordering::Release);
        } else {
            (*parent).right.store(replacement, Ordering::Release);
        }
        recompute_max_end(replacement);

        (*node).decay_next.store(replacement, Ordering::Release);
        (*succ).decay_next.store(replacement, Ordering::Release);
        (*node).max_end.store(0, Ordering::Relaxed);
        guard.defer_reclaim(node);
        guard.defer_reclaim(succ);
    }

    fn fixup_remove(&self, guard: &R::Guard<'_>, mut x: *mut RbNode<T>, mut parent: *mut RbNode<T>) {
        unsafe {
            while x != self.root.load(Ordering::Relaxed) && node_color(x) == BLACK && !parent.is_null() {
                let parent_left = (*parent).left.load(Ordering::Relaxed);
                if core::ptr::eq(parent_left, x) {
                    let mut sibling = (*parent).right.load(Ordering::Relaxed);
                    if node_color(sibling) == RED {
                        (*sibling).color.store(BLACK, Ordering::Relaxed);
                        (*parent).color.store(RED, Ordering::Relaxed);
                        parent = self.rotate_left(guard, parent);
                        sibling = (*parent).right.load(Ordering::Relaxed);
                    }
                    let sib_left = (*sibling).left.load(Ordering::Relaxed);
                    let sib_right = (*sibling).right.load(Ordering::Relaxed);
                    if node_color(sib_left) == BLACK && node_color(sib_right) == BLACK {
                        (*sibling).color.store(RED, Ordering::Relaxed);
                        x = parent;
                        parent = (*x).parent.load(Ordering::Relaxed);
                    } else {
                        if node_color(sib_right) == BLACK {
                            if !sib_left.is_null() {
                                (*sib_left).color.store(BLACK, Ordering::Relaxed);
                            }
                            (*sibling).color.store(RED, Ordering::Relaxed);
                            self.rotate_right(guard, sibling);
                            sibling = (*parent).right.load(Ordering::Relaxed);
                        }
                        (*sibling).color.store((*parent).color(), Ordering::Relaxed);
                        (*parent).color.store(BLACK, Ordering::Relaxed);
                        let sib_right = (*sibling).right.load(Ordering::Relaxed);
                        if !sib_right.is_null() {
                            (*sib_right).color.store(BLACK, Ordering::Relaxed);
                        }
                        self.rotate_left(guard, parent);
                        x = self.root.load(Ordering::Relaxed);
                        parent = core::ptr::null_mut();
                    }
                } else {
                    let mut sibling = (*parent).left.load(Ordering::Relaxed);
                    if node_color(sibling) == RED {
                        (*sibling).color.store(BLACK, Ordering::Relaxed);
                        (*parent).color.store(RED, Ordering::Relaxed);
                        parent = self.rotate_right(guard, parent);
                        sibling = (*parent).left.load(Ordering::Relaxed);
                    }
                    let sib_left = (*sibling).left.load(Ordering::Relaxed);
                    let sib_right = (*sibling).right.load(Ordering::Relaxed);
                    if node_color(sib_left) == BLACK && node_color(sib_right) == BLACK {
                        (*sibling).color.store(RED, Ordering::Relaxed);
                        x = parent;
                        parent = (*x).parent.load(Ordering::Relaxed);
                    } else {
                        if node_color(sib_left) == BLACK {
                            if !sib_right.is_null() {
                                (*sib_right).color.store(BLACK, Ordering::Relaxed);
                            }
                            (*sibling).color.store(RED, Ordering::Relaxed);
                            self.rotate_left(guard, sibling);
                            sibling = (*parent).left.load(Ordering::Relaxed);
                        }
                        (*sibling).color.store((*parent).color(), Ordering::Relaxed);
                        (*parent).color.store(BLACK, Ordering::Relaxed);
                        let sib_left = (*sibling).left.load(Ordering::Relaxed);
                        if !sib_left.is_null() {
                            (*sib_left).color.store(BLACK, Ordering::Relaxed);
                        }
                        self.rotate_right(guard, parent);
                        x = self.root.load(Ordering::Relaxed);
                        parent = core::ptr::null_mut();
                    }
                }
            }
            if !x.is_null() {
                (*x).color.store(BLACK, Ordering::Relaxed);
            }
        }
    }
}

unsafe fn node_color<T>(p: *mut RbNode<T>) -> u8 {
    if p.is_null() {
        BLACK
    } else {
        (*p).color()
    }
}

fn bump_max_end<T>(node: &RbNode<T>, candidate: u64) {
    let mut cur = node.max_end();
    while candidate > cur {
        match node
            .max_end
            .compare_exchange_weak(cur, candidate, Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
}

fn recompute_max_end<T>(node: *mut RbNode<T>) {
    unsafe {
        let n = &*node;
        let mut m = n.end;
        let left = follow_decay(n.left.load(Ordering::Acquire));
        if !left.is_null() {
            m = m.max((*left).max_end());
        }
        let right = follow_decay(n.right.load(Ordering::Acquire));
        if !right.is_null() {
            m = m.max((*right).max_end());
        }
        n.max_end.store(m, Ordering::Release);
    }
}

/// Lock contract `RbTree`'s writer side needs: something it can acquire
/// and hold for the duration of one [`RbTree::insert`]/[`RbTree::remove`]
/// call, so concurrent writers on the same tree serialize against each
/// other automatically rather than by caller discipline alone.
/// Implemented for [`TicketLock`]; a caller providing their own mutex
/// type only needs to implement this to use it with `RbTree`.
pub trait WriteLock {
    /// RAII guard returned by [`WriteLock::acquire`].
    type Guard<'a>
    where
        Self: 'a;

    /// Acquire the lock, blocking until it is free.
    fn acquire(&self) -> Self::Guard<'_>;
}

impl<T> WriteLock for TicketLock<T> {
    type Guard<'a> = TicketLockGuard<'a, T>;

    fn acquire(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::epoch::EpochReclaim;
    extern crate std;

    #[test]
    fn insert_then_search_point() {
        let tree: RbTree<u32, EpochReclaim> = RbTree::new(EpochReclaim::new());
        let guard = tree.reclaim.register();
        guard.enter();

        tree.insert(&guard, 10, 20, 1);
        tree.insert(&guard, 30, 40, 2);

        let found = tree.search(&guard, 15).unwrap();
        assert_eq!(unsafe { *(*found).data() }, 1);
        assert!(tree.search(&guard, 25).is_none());

        guard.leave();
    }

    #[test]
    fn min_and_max_track_begin_extremes() {
        let tree: RbTree<u32, EpochReclaim> = RbTree::new(EpochReclaim::new());
        let guard = tree.reclaim.register();
        guard.enter();

        tree.insert(&guard, 5, 6, 0);
        tree.insert(&guard, 1, 2, 0);
        tree.insert(&guard, 9, 9, 0);

        let min = tree.min(&guard).unwrap();
        let max = tree.max(&guard).unwrap();
        assert_eq!(unsafe { (*min).interval() }, (1, 2));
        assert_eq!(unsafe { (*max).interval() }, (9, 9));

        guard.leave();
    }

    #[test]
    fn search_range_finds_overlap_not_just_containment() {
        let tree: RbTree<u32, EpochReclaim> = RbTree::new(EpochReclaim::new());
        let guard = tree.reclaim.register();
        guard.enter();

        tree.insert(&guard, 10, 20, 1);
        assert!(tree.search_range(&guard, 15, 25).is_some());
        assert!(tree.search_range(&guard, 0, 5).is_none());

        guard.leave();
    }

    #[test]
    fn remove_two_child_node_keeps_others_reachable() {
        let tree: RbTree<u32, EpochReclaim> = RbTree::new(EpochReclaim::new());
        let guard = tree.reclaim.register();
        guard.enter();

        let a = tree.insert(&guard, 10, 10, 0);
        tree.insert(&guard, 5, 5, 0);
        tree.insert(&guard, 15, 15, 0);

        tree.remove(&guard, a);
        assert!(tree.search_begin_key(&guard, 5).is_some());
        assert!(tree.search_begin_key(&guard, 15).is_some());
        assert!(tree.search_begin_key(&guard, 10).is_none());

        guard.leave();
        tree.reclaim.barrier();
    }

    #[test]
    fn many_insertions_preserve_max_end_invariant() {
        let tree: RbTree<u32, EpochReclaim> = RbTree::new(EpochReclaim::new());
        let guard = tree.reclaim.register();
        guard.enter();

        for i in 0..200u64 {
            tree.insert(&guard, i * 2, i * 2 + 1, 0);
        }
        assert!(tree.search(&guard, 50).is_some());
        assert!(tree.search(&guard, 399).is_some());

        guard.leave();
    }

    #[test]
    fn concurrent_inserts_from_multiple_threads_all_land() {
        let tree: RbTree<u32, EpochReclaim> = RbTree::new(EpochReclaim::new());

        std::thread::scope(|scope| {
            for t in 0..8u64 {
                let tree = &tree;
                scope.spawn(move || {
                    let guard = tree.reclaim.register();
                    guard.enter();
                    for i in 0..50u64 {
                        let begin = t * 1000 + i * 2;
                        tree.insert(&guard, begin, begin + 1, t as u32);
                    }
                    guard.leave();
                });
            }
        });

        let guard = tree.reclaim.register();
        guard.enter();
        for t in 0..8u64 {
            for i in 0..50u64 {
                let begin = t * 1000 + i * 2;
                assert!(tree.search(&guard, begin).is_some(), "missing interval at {begin}");
            }
        }
        guard.leave();
    }
}
