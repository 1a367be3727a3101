//! Hazard-pointer reclamation backend.
//!
//! Each registered thread publishes the addresses it is currently
//! dereferencing into a small fixed array. A writer may only free an
//! object once a scan of every thread's published addresses shows none
//! of them still point at it. This is the alternative to
//! [`super::epoch::EpochReclaim`] for callers who would rather pay a
//! scan cost proportional to live retirees than hold an epoch back for
//! a slow reader.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::{ReadGuard, Reclaim};
use crate::backoff::Backoff;

/// Hazard-pointer slots available per registered thread.
pub const HP_PER_THREAD: usize = 4;

const SCAN_THRESHOLD: usize = 2 * HP_PER_THREAD;

#[repr(C)]
struct HpRecord {
    hazards: [AtomicPtr<()>; HP_PER_THREAD],
    next: AtomicPtr<HpRecord>,
    active: AtomicUsize,
    retire_list: UnsafeCell<Vec<RetiredNode>>,
}

struct RetiredNode {
    ptr: *mut (),
    free_fn: unsafe fn(*mut ()),
}

impl HpRecord {
    fn new() -> Self {
        Self {
            hazards: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicUsize::new(1),
            retire_list: UnsafeCell::new(Vec::new()),
        }
    }
}

/// Hazard-pointer [`Reclaim`] backend.
pub struct HazardReclaim {
    records: AtomicPtr<HpRecord>,
}

impl HazardReclaim {
    /// Create a new, empty hazard-pointer service.
    pub const fn new() -> Self {
        Self {
            records: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn collect_hazards(&self) -> Vec<*mut ()> {
        let mut hazards = Vec::new();
        let mut current = self.records.load(Ordering::Acquire);

        while !current.is_null() {
            let record = unsafe { &*current };
            if record.active.load(Ordering::Acquire) != 0 {
                for hp in &record.hazards {
                    let ptr = hp.load(Ordering::Acquire);
                    if !ptr.is_null() {
                        hazards.push(ptr);
                    }
                }
            }
            current = record.next.load(Ordering::Acquire);
        }

        hazards
    }

    fn scan_all(&self) {
        let hazards = self.collect_hazards();
        let mut current = self.records.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            let retire_list = unsafe { &mut *record.retire_list.get() };
            retire_list.retain(|node| {
                if hazards.contains(&node.ptr) {
                    true
                } else {
                    unsafe {
                        (node.free_fn)(node.ptr);
                    }
                    false
                }
            });
            current = record.next.load(Ordering::Acquire);
        }
    }

    fn pending_retirees(&self) -> usize {
        let mut total = 0;
        let mut current = self.records.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            total += unsafe { (*record.retire_list.get()).len() };
            current = record.next.load(Ordering::Acquire);
        }
        total
    }
}

impl Default for HazardReclaim {
    fn default() -> Self {
        Self::new()
    }
}

impl Reclaim for HazardReclaim {
    type Guard<'a> = HpGuard<'a>;

    fn register(&self) -> HpGuard<'_> {
        let record = Box::into_raw(Box::new(HpRecord::new()));

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

        HpGuard {
            service: self,
            record,
        }
    }

    fn barrier(&self) {
        let mut backoff = Backoff::new();
        self.scan_all();
        while self.pending_retirees() > 0 {
            backoff.spin();
            self.scan_all();
        }
        log::trace!("hazard reclaim: barrier drained all retire lists");
    }
}

/// Per-thread registration handle for [`HazardReclaim`].
pub struct HpGuard<'a> {
    service: &'a HazardReclaim,
    record: *mut HpRecord,
}

impl HpGuard<'_> {
    /// Publish `ptr` into hazard slot `slot`, protecting it from
    /// reclamation until [`HpGuard::clear`] or [`ReadGuard::leave`].
    pub fn protect<T>(&self, slot: usize, ptr: *const T) -> Option<usize> {
        if slot >= HP_PER_THREAD {
            return None;
        }
        let record = unsafe { &*self.record };
        record.hazards[slot].store(ptr as *mut (), Ordering::Release);
        crate::pr::fence_acquire();
        Some(slot)
    }

    /// Clear a single hazard slot.
    pub fn clear(&self, slot: usize) {
        if slot < HP_PER_THREAD {
            let record = unsafe { &*self.record };
            record.hazards[slot].store(ptr::null_mut(), Ordering::Release);
        }
    }
}

impl ReadGuard for HpGuard<'_> {
    fn enter(&self) {
        let record = unsafe { &*self.record };
        record.active.store(1, Ordering::Release);
    }

    fn leave(&self) {
        let record = unsafe { &*self.record };
        for hp in &record.hazards {
            hp.store(ptr::null_mut(), Ordering::Release);
        }
    }

    unsafe fn defer_reclaim<T>(&self, ptr: *mut T) {
        let record = &*self.record;
        let retire_list = &mut *record.retire_list.get();
        retire_list.push(RetiredNode {
            ptr: ptr as *mut (),
            free_fn: |p| {
                drop(Box::from_raw(p as *mut T));
            },
        });
        if retire_list.len() >= SCAN_THRESHOLD {
            self.service.scan_all();
        }
    }
}

impl Drop for HpGuard<'_> {
    fn drop(&mut self) {
        self.leave();
        let record = unsafe { &*self.record };
        record.active.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protect_and_clear_round_trip() {
        let service = HazardReclaim::new();
        let guard = service.register();

        let value = Box::new(42i32);
        let ptr = Box::into_raw(value);

        guard.protect(0, ptr);
        guard.clear(0);

        unsafe {
            drop(Box::from_raw(ptr));
        }
    }

    #[test]
    fn defer_reclaim_then_barrier_frees() {
        let service = HazardReclaim::new();
        let guard = service.register();

        let ptr = Box::into_raw(Box::new(7i32));
        unsafe {
            guard.defer_reclaim(ptr);
        }
        drop(guard);
        service.barrier();
        assert_eq!(service.pending_retirees(), 0);
    }
}
