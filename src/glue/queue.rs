//! A safe, owning MPMC queue, wrapping the intrusive [`crate::fifo::MpmcFifo`]
//! so test code can push plain values without managing entry lifetimes
//! by hand.

use alloc::boxed::Box;

use crate::fifo::{FifoEntry, MpmcFifo};

/// An owning multi-producer, multi-consumer FIFO queue.
pub struct Queue<T> {
    inner: MpmcFifo<T>,
}

impl<T> Queue<T> {
    /// Create a new, empty queue.
    pub fn new() -> Self {
        Self {
            inner: MpmcFifo::new(),
        }
    }

    /// Push a value onto the tail of the queue.
    pub fn push(&self, value: T) {
        let entry = Box::into_raw(Box::new(FifoEntry::new(value)));
        unsafe {
            self.inner.enqueue(entry);
        }
    }

    /// Pop a value from the head of the queue, if any.
    pub fn pop(&self) -> Option<T> {
        unsafe {
            self.inner.dequeue().map(|entry| {
                let boxed = Box::from_raw(entry);
                boxed.into_data()
            })
        }
    }

    /// Whether the queue currently has no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;

    #[test]
    fn push_pop_preserves_fifo_order() {
        let q = Queue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn drop_reclaims_remaining_entries() {
        let q: Queue<std::string::String> = Queue::new();
        q.push("leaked if drop is wrong".into());
        drop(q);
    }
}
