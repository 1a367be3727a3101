//! Epoch-based reclamation backend.
//!
//! Readers stamp their thread-local record with the current global epoch
//! on every [`ReadGuard::enter`]; a grace period has passed for epoch `e`
//! once every thread whose record shows `active != 0` has advanced past
//! `e`. Deferred frees are bucketed by the epoch active when they were
//! filed and only run once that bucket's epoch is at least
//! [`EPOCH_GRACE`] behind the current one.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::{ReadGuard, Reclaim};
use crate::backoff::Backoff;

static GLOBAL_EPOCH: AtomicUsize = AtomicUsize::new(0);

/// Number of epochs a garbage bucket must lag the global epoch before
/// its contents are known unreachable by any reader.
const EPOCH_GRACE: usize = 2;

#[repr(C)]
struct EpochRecord {
    epoch: AtomicUsize,
    active: AtomicUsize,
    next: AtomicPtr<EpochRecord>,
    garbage: [UnsafeCell<Vec<DeferredFree>>; 3],
}

struct DeferredFree {
    ptr: *mut u8,
    free_fn: unsafe fn(*mut u8),
}

impl EpochRecord {
    fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            garbage: [
                UnsafeCell::new(Vec::new()),
                UnsafeCell::new(Vec::new()),
                UnsafeCell::new(Vec::new()),
            ],
        }
    }
}

/// Epoch-based [`Reclaim`] backend.
///
/// The default reclamation service for [`crate::ja::Ja`],
/// [`crate::ja_range::JaRange`], and [`crate::rbtree::RbTree`].
pub struct EpochReclaim {
    records: AtomicPtr<EpochRecord>,
}

impl EpochReclaim {
    /// Create a new, empty epoch service.
    pub const fn new() -> Self {
        Self {
            records: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn try_advance(&self) -> bool {
        let global = GLOBAL_EPOCH.load(Ordering::Acquire);
        let new_epoch = global.wrapping_add(1);

        let mut current = self.records.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            if record.active.load(Ordering::Acquire) != 0 {
                let thread_epoch = record.epoch.load(Ordering::Acquire);
                if thread_epoch != global {
                    return false;
                }
            }
            current = record.next.load(Ordering::Acquire);
        }

        GLOBAL_EPOCH
            .compare_exchange(global, new_epoch, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Drain garbage buckets that are at least [`EPOCH_GRACE`] epochs
    /// behind the current global epoch, across every registered thread.
    fn drain_reclaimable(&self) {
        let global = GLOBAL_EPOCH.load(Ordering::Acquire);
        let safe_bucket = global.wrapping_sub(EPOCH_GRACE) % 3;

        let mut current = self.records.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            let garbage = unsafe { &mut *record.garbage[safe_bucket].get() };
            let drained = garbage.len();
            for item in garbage.drain(..) {
                unsafe {
                    (item.free_fn)(item.ptr);
                }
            }
            if drained > 0 {
                log::trace!("epoch reclaim: freed {drained} object(s) from bucket {safe_bucket}");
            }
            current = record.next.load(Ordering::Acquire);
        }
    }
}

impl Default for EpochReclaim {
    fn default() -> Self {
        Self::new()
    }
}

impl Reclaim for EpochReclaim {
    type Guard<'a> = EpochGuard<'a>;

    fn register(&self) -> EpochGuard<'_> {
        let record = Box::into_raw(Box::new(EpochRecord::new()));

        loop {
            let head = self.records.load(Ordering::Relaxed);
            unsafe {
                (*record).next.store(head, Ordering::Relaxed);
            }
            if self
                .records
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        EpochGuard {
            service: self,
            record,
            _marker: core::marker::PhantomData,
        }
    }

    fn barrier(&self) {
        let mut backoff = Backoff::new();
        for _ in 0..(EPOCH_GRACE + 1) {
            while !self.try_advance() {
                backoff.spin();
            }
        }
        self.drain_reclaimable();
    }
}

/// Per-thread registration handle for [`EpochReclaim`].
///
/// Not `Send`/`Sync`: a guard belongs to the thread that registered it.
pub struct EpochGuard<'a> {
    service: &'a EpochReclaim,
    record: *mut EpochRecord,
    _marker: core::marker::PhantomData<*mut ()>,
}

impl ReadGuard for EpochGuard<'_> {
    fn enter(&self) {
        let record = unsafe { &*self.record };
        let global = GLOBAL_EPOCH.load(Ordering::Acquire);
        record.epoch.store(global, Ordering::Relaxed);
        record.active.fetch_add(1, Ordering::Release);
        crate::pr::fence_acquire();
    }

    fn leave(&self) {
        let record = unsafe { &*self.record };
        crate::pr::fence_release();
        record.active.fetch_sub(1, Ordering::Release);
    }

    unsafe fn defer_reclaim<T>(&self, ptr: *mut T) {
        let record = &*self.record;
        let epoch = record.epoch.load(Ordering::Relaxed) % 3;
        let garbage = &mut *record.garbage[epoch].get();
        garbage.push(DeferredFree {
            ptr: ptr as *mut u8,
            free_fn: |p| {
                drop(Box::from_raw(p as *mut T));
            },
        });
        let _ = self.service;
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        let record = unsafe { &*self.record };
        if record.active.load(Ordering::Relaxed) > 0 {
            self.leave();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_leave_round_trip() {
        let service = EpochReclaim::new();
        let guard = service.register();
        guard.enter();
        guard.leave();
    }

    #[test]
    fn defer_reclaim_runs_after_barrier() {
        let service = EpochReclaim::new();
        let guard = service.register();

        let ptr = Box::into_raw(Box::new(7i32));
        unsafe {
            guard.defer_reclaim(ptr);
        }
        drop(guard);
        service.barrier();
    }

    #[test]
    fn concurrent_readers_do_not_block_each_other() {
        let service = EpochReclaim::new();
        let g1 = service.register();
        let g2 = service.register();

        g1.enter();
        g2.enter();
        g2.leave();
        g1.leave();
    }
}
