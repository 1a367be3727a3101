//! Work-distribution helpers for the concurrent scenario tests.
//!
//! These are plumbing for the test harness, not part of the tree/range
//! public surface: spreading a fixed set of operations across worker
//! threads so a scenario test can assert a property ("every key that
//! was ever added is found exactly once at the end") rather than racing
//! threads directly against assertions.

pub mod deque;
pub mod queue;

pub use deque::Deque;
pub use queue::Queue;
