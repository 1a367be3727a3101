//! Interior node representation and the size-class table.
//!
//! The tagged-pointer encoding described for this structure is expressed
//! here as an enum discriminant instead of packed pointer bits: each
//! child slot is an `AtomicPtr<NodeOrChain<T>>`, and `NodeOrChain`'s own
//! variant tag is the "tag" — the invariant that "tag and pointee always
//! agree" is enforced by the type system rather than by hand.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, Ordering};


/// One entry in the fixed size-class table: a node holds `nr_child`
/// children where `min_child <= nr_child <= max_child`, outside of a
/// transient window during recompaction.
#[derive(Debug, Clone, Copy)]
pub struct SizeClass {
    pub kind: NodeKind,
    pub max_child: u32,
    pub min_child: u32,
}

/// The node configuration a size-class index maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A sorted array of (key byte, child) pairs, scanned linearly.
    Linear,
    /// `width` LINEAR sub-nodes; the high bits of the key byte select
    /// which sub-node to linearly scan.
    Pool { width: u8 },
    /// A flat 256-entry array indexed directly by the key byte.
    Pigeon,
}

/// Number of removals tolerated while a PIGEON node is under
/// `min_child` before it is allowed to shrink back to POOL. Amortizes
/// the shrink decision so that a workload oscillating around the
/// boundary does not thrash between configurations.
pub const JA_FALLBACK_REMOVAL_COUNT: u8 = 8;

/// The eight concrete node sizes, ascending capacity.
///
/// `max_child` values borrow the LINEAR row from the original 64-bit
/// Judy array size table (1, 3, 7, 14); the POOL and PIGEON rows are
/// this crate's own construction sized to keep `width`-way sub-node
/// capacity an exact multiple of the LINEAR capacity it reuses, since
/// the retrieved sources disagree on a POOL-shaped table (see DESIGN.md).
pub const SIZE_TABLE: [SizeClass; 8] = [
    SizeClass { kind: NodeKind::Linear, max_child: 1, min_child: 0 },
    SizeClass { kind: NodeKind::Linear, max_child: 3, min_child: 0 },
    SizeClass { kind: NodeKind::Linear, max_child: 7, min_child: 1 },
    SizeClass { kind: NodeKind::Linear, max_child: 14, min_child: 3 },
    SizeClass { kind: NodeKind::Pool { width: 2 }, max_child: 28, min_child: 7 },
    SizeClass { kind: NodeKind::Pool { width: 4 }, max_child: 56, min_child: 14 },
    SizeClass { kind: NodeKind::Pool { width: 4 }, max_child: 124, min_child: 28 },
    SizeClass { kind: NodeKind::Pigeon, max_child: 256, min_child: 62 },
];

/// Sub-node capacity of a POOL configuration at `size_index`.
fn pool_subnode_capacity(size_index: usize, width: u8) -> u32 {
    SIZE_TABLE[size_index].max_child / width as u32
}

/// Smallest size index whose `max_child` accommodates `nr_child` children.
pub fn size_for_count(nr_child: u32) -> usize {
    SIZE_TABLE
        .iter()
        .position(|s| s.max_child >= nr_child)
        .unwrap_or(SIZE_TABLE.len() - 1)
}

/// Sentinel index meaning "absent" — used only in book-keeping, never
/// stored as an actual pointer tag since absence is represented by a
/// null `AtomicPtr`.
pub const NODE_INDEX_NULL: usize = 8;

/// What a child slot ultimately refers to: another interior node, or
/// (only at the final tree level) the head of a duplicate-key chain.
pub enum NodeOrChain<T> {
    Interior(Node<T>),
    Chain(ChainHead<T>),
}

/// Head of a singly-linked list of same-key user entries.
pub struct ChainHead<T> {
    pub head: AtomicPtr<JaEntry<T>>,
}

impl<T> ChainHead<T> {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

/// Intrusive wrapper giving a user payload the singly-linked `next`
/// pointer the duplicate-key chain needs, the same shape as
/// [`crate::fifo::FifoEntry`].
#[repr(C)]
pub struct JaEntry<T> {
    next: AtomicPtr<JaEntry<T>>,
    data: T,
}

impl<T> JaEntry<T> {
    /// Wrap `data` for insertion into a [`crate::ja::Ja`].
    #[inline]
    pub fn new(data: T) -> Self {
        Self {
            next: AtomicPtr::new(core::ptr::null_mut()),
            data,
        }
    }

    /// Borrow the wrapped payload.
    #[inline]
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Mutably borrow the wrapped payload.
    #[inline]
    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Consume the wrapper, returning the payload.
    #[inline]
    pub fn into_data(self) -> T {
        self.data
    }

    /// The next entry in this key's duplicate chain, if any.
    #[inline]
    pub fn next(&self) -> *mut JaEntry<T> {
        self.next.load(Ordering::Acquire)
    }

    /// Set this entry's successor link. Used only while linking a fresh
    /// entry onto a chain head, before it is published.
    #[inline]
    pub(crate) fn next_store(&self, next: *mut JaEntry<T>) {
        self.next.store(next, Ordering::Relaxed);
    }

    /// Raw access to the `next` slot itself, for a caller walking the
    /// chain that needs to CAS the *previous* link rather than load it.
    #[inline]
    pub(crate) fn next_slot(&self) -> *const AtomicPtr<JaEntry<T>> {
        &self.next
    }
}

/// One LINEAR sub-node: parallel arrays of key bytes and children,
/// scanned linearly up to `nr_child`.
pub struct LinearNode<T> {
    capacity: u32,
    nr_child: AtomicU32,
    keys: Box<[AtomicU8]>,
    children: Box<[AtomicPtr<NodeOrChain<T>>]>,
}

impl<T> LinearNode<T> {
    fn with_capacity(capacity: u32) -> Self {
        Self {
            capacity,
            nr_child: AtomicU32::new(0),
            keys: (0..capacity).map(|_| AtomicU8::new(0)).collect::<Vec<_>>().into_boxed_slice(),
            children: (0..capacity)
                .map(|_| AtomicPtr::new(core::ptr::null_mut()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    pub fn nr_child(&self) -> u32 {
        self.nr_child.load(Ordering::Acquire)
    }

    /// Linear scan for `byte`. Returns the child slot pointer value.
    pub fn find(&self, byte: u8) -> *mut NodeOrChain<T> {
        let n = self.nr_child() as usize;
        for i in 0..n {
            if self.keys[i].load(Ordering::Acquire) == byte {
                return self.children[i].load(Ordering::Acquire);
            }
        }
        core::ptr::null_mut()
    }

    /// Largest populated key byte `<= byte`, with its child.
    pub fn find_lower_equal(&self, byte: u8) -> Option<(u8, *mut NodeOrChain<T>)> {
        let n = self.nr_child() as usize;
        let mut best: Option<(u8, *mut NodeOrChain<T>)> = None;
        for i in 0..n {
            let k = self.keys[i].load(Ordering::Acquire);
            if k <= byte && best.map_or(true, |(bk, _)| k > bk) {
                best = Some((k, self.children[i].load(Ordering::Acquire)));
            }
        }
        best
    }

    /// Append a new (key, child) pair. Caller must hold the node's
    /// shadow lock and must have already verified `nr_child < capacity`.
    pub fn append(&self, byte: u8, child: *mut NodeOrChain<T>) {
        let i = self.nr_child() as usize;
        debug_assert!((i as u32) < self.capacity);
        self.keys[i].store(byte, Ordering::Relaxed);
        self.children[i].store(child, Ordering::Release);
        self.nr_child.fetch_add(1, Ordering::Release);
    }

    /// Remove the entry for `byte` by swapping the last live slot into
    /// its place. Caller must hold the node's shadow lock.
    pub fn remove(&self, byte: u8) -> bool {
        let n = self.nr_child() as usize;
        for i in 0..n {
            if self.keys[i].load(Ordering::Acquire) == byte {
                let last = n - 1;
                if i != last {
                    let last_key = self.keys[last].load(Ordering::Acquire);
                    let last_child = self.children[last].load(Ordering::Acquire);
                    self.keys[i].store(last_key, Ordering::Relaxed);
                    self.children[i].store(last_child, Ordering::Release);
                }
                self.children[last].store(core::ptr::null_mut(), Ordering::Release);
                self.nr_child.fetch_sub(1, Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Iterate over all live (key, child) pairs, for recompaction copies.
    pub fn iter(&self) -> impl Iterator<Item = (u8, *mut NodeOrChain<T>)> + '_ {
        let n = self.nr_child() as usize;
        (0..n).map(move |i| {
            (
                self.keys[i].load(Ordering::Acquire),
                self.children[i].load(Ordering::Acquire),
            )
        })
    }
}

/// A POOL node: `width` LINEAR sub-nodes selected by the high bits of
/// the key byte.
pub struct PoolNode<T> {
    width: u8,
    subs: Box<[LinearNode<T>]>,
}

impl<T> PoolNode<T> {
    fn new(width: u8, sub_capacity: u32) -> Self {
        Self {
            width,
            subs: (0..width)
                .map(|_| LinearNode::with_capacity(sub_capacity))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    fn sub_index(&self, byte: u8) -> usize {
        (byte as usize) * (self.width as usize) / 256
    }

    pub fn sub(&self, byte: u8) -> &LinearNode<T> {
        &self.subs[self.sub_index(byte)]
    }

    pub fn nr_child(&self) -> u32 {
        self.subs.iter().map(LinearNode::nr_child).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, *mut NodeOrChain<T>)> + '_ {
        self.subs.iter().flat_map(LinearNode::iter)
    }

    pub fn find_lower_equal(&self, byte: u8) -> Option<(u8, *mut NodeOrChain<T>)> {
        let start = self.sub_index(byte);
        if let Some(hit) = self.subs[start].find_lower_equal(byte) {
            return Some(hit);
        }
        for sub in self.subs[..start].iter().rev() {
            if let Some((k, c)) = sub.iter().max_by_key(|(k, _)| *k) {
                return Some((k, c));
            }
        }
        None
    }
}

/// A PIGEON node: a flat, directly-indexed 256-entry array.
pub struct PigeonNode<T> {
    children: Box<[AtomicPtr<NodeOrChain<T>>; 256]>,
    nr_child: AtomicU32,
}

impl<T> PigeonNode<T> {
    fn new() -> Self {
        Self {
            children: Box::new(core::array::from_fn(|_| AtomicPtr::new(core::ptr::null_mut()))),
            nr_child: AtomicU32::new(0),
        }
    }

    pub fn get(&self, byte: u8) -> *mut NodeOrChain<T> {
        self.children[byte as usize].load(Ordering::Acquire)
    }

    pub fn nr_child(&self) -> u32 {
        self.nr_child.load(Ordering::Acquire)
    }

    pub fn set(&self, byte: u8, child: *mut NodeOrChain<T>) {
        let was_null = self.children[byte as usize].load(Ordering::Relaxed).is_null();
        self.children[byte as usize].store(child, Ordering::Release);
        if was_null && !child.is_null() {
            self.nr_child.fetch_add(1, Ordering::Release);
        } else if !was_null && child.is_null() {
            self.nr_child.fetch_sub(1, Ordering::Release);
        }
    }

    pub fn find_lower_equal(&self, byte: u8) -> Option<(u8, *mut NodeOrChain<T>)> {
        let mut b = byte;
        loop {
            let c = self.children[b as usize].load(Ordering::Acquire);
            if !c.is_null() {
                return Some((b, c));
            }
            if b == 0 {
                return None;
            }
            b -= 1;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, *mut NodeOrChain<T>)> + '_ {
        self.children.iter().enumerate().filter_map(|(i, c)| {
            let p = c.load(Ordering::Acquire);
            if p.is_null() {
                None
            } else {
                Some((i as u8, p))
            }
        })
    }
}

/// One interior node: its size-class index plus the body matching
/// that index's [`NodeKind`].
pub enum NodeBody<T> {
    Linear(LinearNode<T>),
    Pool(PoolNode<T>),
    Pigeon(PigeonNode<T>),
}

pub struct Node<T> {
    pub size_index: u8,
    pub body: NodeBody<T>,
}

impl<T> Node<T> {
    pub fn new_at(size_index: usize) -> Box<Self> {
        let class = SIZE_TABLE[size_index];
        let body = match class.kind {
            NodeKind::Linear => NodeBody::Linear(LinearNode::with_capacity(class.max_child)),
            NodeKind::Pool { width } => {
                NodeBody::Pool(PoolNode::new(width, pool_subnode_capacity(size_index, width)))
            }
            NodeKind::Pigeon => NodeBody::Pigeon(PigeonNode::new()),
        };
        Box::new(Self {
            size_index: size_index as u8,
            body,
        })
    }

    pub fn nr_child(&self) -> u32 {
        match &self.body {
            NodeBody::Linear(l) => l.nr_child(),
            NodeBody::Pool(p) => p.nr_child(),
            NodeBody::Pigeon(p) => p.nr_child(),
        }
    }

    pub fn find(&self, byte: u8) -> *mut NodeOrChain<T> {
        match &self.body {
            NodeBody::Linear(l) => l.find(byte),
            NodeBody::Pool(p) => p.sub(byte).find(byte),
            NodeBody::Pigeon(p) => p.get(byte),
        }
    }

    pub fn find_lower_equal(&self, byte: u8) -> Option<(u8, *mut NodeOrChain<T>)> {
        match &self.body {
            NodeBody::Linear(l) => l.find_lower_equal(byte),
            NodeBody::Pool(p) => p.find_lower_equal(byte),
            NodeBody::Pigeon(p) => p.find_lower_equal(byte),
        }
    }

    pub fn iter(&self) -> alloc::vec::Vec<(u8, *mut NodeOrChain<T>)> {
        match &self.body {
            NodeBody::Linear(l) => l.iter().collect(),
            NodeBody::Pool(p) => p.iter().collect(),
            NodeBody::Pigeon(p) => p.iter().collect(),
        }
    }

    /// Whether inserting one more child would exceed this node's
    /// current size class.
    pub fn is_full(&self) -> bool {
        self.nr_child() >= SIZE_TABLE[self.size_index as usize].max_child
    }

    /// Remove the child slot for `byte` entirely (not replace it),
    /// decrementing `nr_child`. Caller must hold the node's shadow lock.
    /// Returns whether a child was actually present to remove.
    pub fn unlink(&self, byte: u8) -> bool {
        match &self.body {
            NodeBody::Linear(l) => l.remove(byte),
            NodeBody::Pool(p) => p.sub(byte).remove(byte),
            NodeBody::Pigeon(p) => {
                if p.get(byte).is_null() {
                    false
                } else {
                    p.set(byte, core::ptr::null_mut());
                    true
                }
            }
        }
    }
}

pub fn alloc_chain_head<T>() -> Box<NodeOrChain<T>> {
    Box::new(NodeOrChain::Chain(ChainHead::new()))
}

impl<T> NodeOrChain<T> {
    /// Shadow map key for the node or chain head allocated at `this`.
    ///
    /// `NodeOrChain<T>` is a plain Rust enum with no `#[repr]`: the
    /// compiler is free to place the `Interior(Node<T>)` payload at
    /// whatever offset it likes relative to the enum's own address, so
    /// a pointer to the *payload* (`&Node<T> as *const Node<T>`) is not
    /// interchangeable with a pointer to the *allocation*
    /// (`Box<NodeOrChain<T>>`'s address) without relying on that offset
    /// being zero, which is not a language guarantee. Every shadow map
    /// key must therefore be derived from this function, called on the
    /// `*mut NodeOrChain<T>` the node was allocated as — never on a
    /// reference to an interior node obtained by matching through one.
    pub fn identity(this: *const Self) -> usize {
        this as usize
    }
}
