//! # rcu-cds
//!
//! RCU-friendly ordered containers: a 64-bit-keyed Judy array, a range
//! allocator built on top of it, and an interval-augmented red-black
//! tree, in the spirit of the [Concurrency Kit](http://concurrencykit.org/)
//! and [userspace-RCU](https://liburcu.org/) C libraries this crate grew
//! out of.
//!
//! Readers never block and never allocate: every lookup walks a
//! snapshot of the structure reachable through `Acquire`-ordered loads.
//! Writers serialize only against the other writer(s) touching the same
//! position (an interior node's shadow lock, a range's own lock, an
//! external mutex around the tree) and defer reclamation of anything a
//! reader might still be looking at through a pluggable [`reclaim`]
//! backend.
//!
//! ## Module Organization
//!
//! ### Foundation
//! - [`cc`] - Compiler compatibility utilities (bit operations, branch hints)
//! - [`malloc`] - Memory allocator abstraction
//!
//! ### Core Primitives
//! - [`pr`] - Atomic primitives and memory barriers
//! - [`mod@backoff`] - Exponential backoff for contention management
//!
//! ### Locks
//! - [`spinlock`] - Unfair and FIFO-fair spinlocks
//! - [`barrier`] - Execution barriers, for coordinating concurrent tests
//!
//! ### Memory Reclamation
//! - [`reclaim`] - The [`reclaim::Reclaim`] trait, plus epoch-based and
//!   hazard-pointer backends
//!
//! ### Containers
//! - [`shadow`] - Shadow-metadata map backing Judy array interior nodes
//! - [`ja`] - The Judy array itself
//! - [`ja_range`] - A 64-bit range allocator built on [`ja`]
//! - [`rbtree`] - An interval-augmented concurrent red-black tree
//! - [`error`] - The shared error taxonomy
//!
//! ### Test support
//! - [`fifo`] - Lock-free FIFO queues
//! - [`glue`] - Owning queue wrapper used by the concurrent scenario tests

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

extern crate alloc;

// =============================================================================
// Tier 0: Foundation (No Internal Dependencies)
// =============================================================================

/// Compiler compatibility utilities.
///
/// Provides bit manipulation operations (ffs, ctz, popcount) and branch
/// prediction hints, used by the Judy array's node-size dispatch.
pub mod cc;

/// Memory allocator abstraction.
///
/// Defines the [`Allocator`](malloc::Allocator) trait for custom memory
/// allocation, and a precondition the Judy array's interior nodes rely
/// on: allocations are at least 8-byte aligned.
pub mod malloc;

// =============================================================================
// Tier 1: Core Primitives (Depends on Tier 0)
// =============================================================================

/// Atomic primitives and memory barriers.
///
/// Provides atomic operations with various memory orderings, the
/// vocabulary the RCU publication/teardown discipline is expressed in.
pub mod pr;

/// Exponential backoff for contention management.
pub mod backoff;

// =============================================================================
// Tier 2: Locks (Depends on Tiers 0-1)
// =============================================================================

/// Unfair and FIFO-fair spinlocks.
pub mod spinlock;

/// Execution barriers, for synchronizing concurrent test threads.
pub mod barrier;

/// Lock-free FIFO queues.
pub mod fifo;

// =============================================================================
// Tier 3: Memory Reclamation (Depends on Tiers 0-2)
// =============================================================================

/// Pluggable RCU-style reclamation: the [`reclaim::Reclaim`] trait plus
/// epoch-based and hazard-pointer backends.
pub mod reclaim;

// =============================================================================
// Tier 4: Containers (Depends on Tiers 0-3)
// =============================================================================

/// Shared error taxonomy for every public operation in this crate.
pub mod error;

/// Shadow-metadata map backing Judy array interior nodes.
pub mod shadow;

/// The Judy array: a concurrent, ordered, 64-bit-keyed map.
pub mod ja;

/// A 64-bit range allocator built atop [`ja`].
pub mod ja_range;

/// An interval-augmented concurrent red-black tree.
pub mod rbtree;

// =============================================================================
// Tier 5: Test support
// =============================================================================

/// Work-distribution helpers for the concurrent scenario tests.
pub mod glue;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use cc::{ctz, ctz_u64, ffs, ffs_u64, popcount, popcount_u64};
pub use error::{Error, Result};
pub use ja::Ja;
pub use ja_range::JaRange;
pub use malloc::Allocator;
pub use rbtree::RbTree;
pub use reclaim::{ReadGuard, Reclaim, Section};
