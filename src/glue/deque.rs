//! A lock-guarded doubly-linked deque, for scenario tests that need to
//! both FIFO- and LIFO-drain a queue of pending operations.

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::spinlock::{FasLock, FasLockGuard};

struct DequeEntry<T> {
    prev: *mut DequeEntry<T>,
    next: *mut DequeEntry<T>,
    data: T,
}

struct DequeState<T> {
    head: *mut DequeEntry<T>,
    tail: *mut DequeEntry<T>,
}

/// An owning doubly-linked deque, serialized by a single lock (unlike
/// [`super::queue::Queue`], whose head/tail locks are independent).
pub struct Deque<T> {
    state: FasLock<DequeState<T>>,
    // Kept as a separate atomic only so an uncontended `is_empty` check
    // does not need to take the lock.
    len: AtomicUsize,
}

impl<T> Deque<T> {
    /// Create an empty deque.
    pub fn new() -> Self {
        Self {
            state: FasLock::new(DequeState {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
            }),
            len: AtomicUsize::new(0),
        }
    }

    fn bump_len(&self, delta: isize) {
        if delta >= 0 {
            self.len.fetch_add(delta as usize, Ordering::Relaxed);
        } else {
            self.len.fetch_sub((-delta) as usize, Ordering::Relaxed);
        }
    }

    /// Push `value` onto the front of the deque.
    pub fn push_front(&self, value: T) {
        let entry = Box::into_raw(Box::new(DequeEntry {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            data: value,
        }));
        let mut s = self.state.lock();
        unsafe {
            (*entry).next = s.head;
            if !s.head.is_null() {
                (*s.head).prev = entry;
            }
            s.head = entry;
            if s.tail.is_null() {
                s.tail = entry;
            }
        }
        drop(s);
        self.bump_len(1);
    }

    /// Push `value` onto the back of the deque.
    pub fn push_back(&self, value: T) {
        let entry = Box::into_raw(Box::new(DequeEntry {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            data: value,
        }));
        let mut s = self.state.lock();
        unsafe {
            (*entry).prev = s.tail;
            if !s.tail.is_null() {
                (*s.tail).next = entry;
            }
            s.tail = entry;
            if s.head.is_null() {
                s.head = entry;
            }
        }
        drop(s);
        self.bump_len(1);
    }

    /// Pop a value from the front of the deque (FIFO drain order when
    /// paired with [`Deque::push_back`]).
    pub fn pop_front(&self) -> Option<T> {
        let popped = self.unlink_front(&mut self.state.lock());
        if popped.is_some() {
            self.bump_len(-1);
        }
        popped
    }

    /// Pop a value from the back of the deque (LIFO drain order when
    /// paired with [`Deque::push_back`]).
    pub fn pop_back(&self) -> Option<T> {
        let popped = self.unlink_back(&mut self.state.lock());
        if popped.is_some() {
            self.bump_len(-1);
        }
        popped
    }

    fn unlink_front(&self, s: &mut FasLockGuard<'_, DequeState<T>>) -> Option<T> {
        let entry = s.head;
        if entry.is_null() {
            return None;
        }
        unsafe {
            s.head = (*entry).next;
            if !s.head.is_null() {
                (*s.head).prev = ptr::null_mut();
            } else {
                s.tail = ptr::null_mut();
            }
            Some(Box::from_raw(entry).data)
        }
    }

    fn unlink_back(&self, s: &mut FasLockGuard<'_, DequeState<T>>) -> Option<T> {
        let entry = s.tail;
        if entry.is_null() {
            return None;
        }
        unsafe {
            s.tail = (*entry).prev;
            if !s.tail.is_null() {
                (*s.tail).next = ptr::null_mut();
            } else {
                s.head = ptr::null_mut();
            }
            Some(Box::from_raw(entry).data)
        }
    }

    /// Whether the deque currently has no entries.
    pub fn is_empty(&self) -> bool {
        self.len.load(Ordering::Relaxed) == 0
    }
}

impl<T> Default for Deque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Deque<T> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

unsafe impl<T: Send> Send for Deque<T> {}
unsafe impl<T: Send> Sync for Deque<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;

    #[test]
    fn fifo_drain_via_back_push_front_pop() {
        let dq = Deque::new();
        dq.push_back(1);
        dq.push_back(2);
        dq.push_back(3);
        assert_eq!(dq.pop_front(), Some(1));
        assert_eq!(dq.pop_front(), Some(2));
        assert_eq!(dq.pop_front(), Some(3));
        assert_eq!(dq.pop_front(), None);
    }

    #[test]
    fn lifo_drain_via_back_push_back_pop() {
        let dq = Deque::new();
        dq.push_back(1);
        dq.push_back(2);
        dq.push_back(3);
        assert_eq!(dq.pop_back(), Some(3));
        assert_eq!(dq.pop_back(), Some(2));
        assert_eq!(dq.pop_back(), Some(1));
    }

    #[test]
    fn push_front_then_pop_back_is_fifo_too() {
        let dq = Deque::new();
        dq.push_front(1);
        dq.push_front(2);
        dq.push_front(3);
        assert_eq!(dq.pop_back(), Some(1));
        assert_eq!(dq.pop_back(), Some(2));
        assert_eq!(dq.pop_back(), Some(3));
    }

    #[test]
    fn is_empty_tracks_contents() {
        let dq = Deque::new();
        assert!(dq.is_empty());
        dq.push_back(42);
        assert!(!dq.is_empty());
        dq.pop_front();
        assert!(dq.is_empty());
    }
}
