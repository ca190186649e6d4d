//! Quiescence-based safe memory reclamation.
//!
//! A node unlinked from a concurrent structure cannot be freed on the spot:
//! another thread may still hold a pointer to it from an in-flight operation.
//! Unlinked nodes are instead *retired* to a per-thread list, and a retire
//! list is only freed once every operation that was in flight has exited.
//!
//! The quiescence detector is deliberately simple: a gate mutex plus a global
//! in-flight counter. Every operation [`pin`](Collector::pin)s the collector
//! at entry, which briefly takes and releases the gate (so a reclamation
//! round in progress holds new entries back) and then increments the counter.
//! When a thread's retire list outgrows its threshold, the thread takes the
//! gate, spins until the counter drains to zero, and frees its own list. No
//! live reference can exist to any node freed this way: the node was
//! unreachable from the root before it was retired, and every operation that
//! might have seen it earlier has since been counted out.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;

/// Capacity of the thread registry. Slots are preallocated, so ids must stay
/// below this bound.
pub const MAX_THREADS: usize = 128;

/// A thread's retire list is freed once it grows past this length.
const RETIRE_THRESHOLD: usize = 100;

thread_local! {
    static THREAD_ID: Cell<usize> = Cell::new(0);
}

/// Binds the calling thread to a retire slot. Must be called before the
/// thread's first operation on any structure that retires nodes.
pub fn register_thread(tid: usize) {
    assert!(tid < MAX_THREADS, "thread id {} out of range", tid);
    THREAD_ID.with(|id| id.set(tid));
}

/// A type-erased deferred free of a `Box`-allocated node.
struct Deferred {
    ptr: *mut (),
    free: unsafe fn(*mut ()),
}

impl Deferred {
    fn new<T>(ptr: *mut T) -> Self {
        unsafe fn free<T>(ptr: *mut ()) {
            drop(Box::from_raw(ptr.cast::<T>()));
        }
        Deferred {
            ptr: ptr.cast(),
            free: free::<T>,
        }
    }

    /// # Safety
    ///
    /// The pointee must still be live and must not be freed again.
    unsafe fn run(self) {
        (self.free)(self.ptr);
    }
}

struct Slot {
    retired: UnsafeCell<Vec<Deferred>>,
}

// A slot is written only by its registered owner thread; a reclamation round
// drains a slot only after the in-flight counter shows its owner has exited.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

/// Per-structure reclamation state: the retire slots, the gate, and the
/// in-flight counter.
pub struct Collector {
    slots: Box<[CachePadded<Slot>]>,
    gate: Mutex<()>,
    in_flight: CachePadded<AtomicUsize>,
    threads: AtomicUsize,
}

impl Collector {
    pub fn new() -> Self {
        let slots = (0..MAX_THREADS)
            .map(|_| {
                CachePadded::new(Slot {
                    retired: UnsafeCell::new(Vec::new()),
                })
            })
            .collect();
        Collector {
            slots,
            gate: Mutex::new(()),
            in_flight: CachePadded::new(AtomicUsize::new(0)),
            threads: AtomicUsize::new(1),
        }
    }

    /// Fixes the number of worker threads. Call once, before concurrent use.
    pub fn set_thread_count(&self, n: usize) {
        assert!(
            n <= MAX_THREADS,
            "thread count {} exceeds capacity {}",
            n,
            MAX_THREADS
        );
        self.threads.store(n, Ordering::Relaxed);
    }

    /// Binds the calling thread to slot `tid`. Ids must be below the
    /// configured thread count and unique per concurrent thread.
    pub fn register(&self, tid: usize) {
        let n = self.threads.load(Ordering::Relaxed);
        assert!(tid < n, "thread id {} not below thread count {}", tid, n);
        register_thread(tid);
    }

    /// Enters an operation's critical section. The returned guard keeps every
    /// retired-but-unfreed node alive until it is dropped.
    pub fn pin(&self) -> Guard<'_> {
        // A round in progress holds the gate; entering behind it would let
        // this operation observe nodes the round is about to free.
        drop(self.gate.lock());
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Guard {
            collector: self,
            tid: THREAD_ID.with(Cell::get),
        }
    }

    /// Waits for in-flight operations to drain, then frees thread `tid`'s
    /// retire list.
    fn reclaim(&self, tid: usize) {
        let _round = self.gate.lock();
        let backoff = Backoff::new();
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
        // No operation is in flight and the gate keeps new ones out, so the
        // listed nodes are unreachable from every thread.
        let retired = unsafe { &mut *self.slots[tid].retired.get() };
        for node in retired.drain(..) {
            unsafe { node.run() };
        }
    }

    /// Frees every slot's retire list. Exclusive access makes this safe
    /// without touching the gate.
    pub fn reclaim_all(&mut self) {
        for slot in self.slots.iter() {
            let retired = unsafe { &mut *slot.retired.get() };
            for node in retired.drain(..) {
                unsafe { node.run() };
            }
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.reclaim_all();
    }
}

/// An entered critical section. Dropping the guard exits the section and, if
/// the thread's retire list has outgrown its threshold, runs a reclamation
/// round.
pub struct Guard<'c> {
    collector: &'c Collector,
    tid: usize,
}

impl Guard<'_> {
    /// Hands a node over to the calling thread's retire list.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box::into_raw`, must already be unreachable from
    /// the structure's root, and must be retired exactly once.
    pub unsafe fn retire<T>(&self, ptr: *mut T) {
        let retired = &mut *self.collector.slots[self.tid].retired.get();
        retired.push(Deferred::new(ptr));
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.collector.in_flight.fetch_sub(1, Ordering::SeqCst);
        // The list length is only ever written by this thread.
        let over = unsafe { (*self.collector.slots[self.tid].retired.get()).len() }
            > RETIRE_THRESHOLD;
        if over {
            self.collector.reclaim(self.tid);
        }
    }
}
