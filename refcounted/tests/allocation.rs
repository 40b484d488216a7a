#![cfg(not(shuttle))]

use refcounted::{try_make_counted, Error, IntrusivePtr, RefCount, RefCounted};
use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
    mem::{align_of, size_of},
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
    },
};

/// Forwards to the system allocator, except that allocations of exactly
/// `FAIL_SIZE` bytes made on the current thread return null.
struct FailingAllocator;

thread_local! {
    static FAIL_SIZE: Cell<usize> = const { Cell::new(0) };
    static FAILURES: Cell<usize> = const { Cell::new(0) };
}

unsafe impl GlobalAlloc for FailingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let fail_size = FAIL_SIZE.try_with(Cell::get).unwrap_or(0);
        if fail_size != 0 && layout.size() == fail_size {
            let _ = FAILURES.try_with(|failures| failures.set(failures.get() + 1));
            return std::ptr::null_mut();
        }
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
    }
}

#[global_allocator]
static GLOBAL: FailingAllocator = FailingAllocator;

fn fail_allocations_of<T>() {
    FAIL_SIZE.with(|size| size.set(size_of::<T>()));
}

fn allocate_normally() {
    FAIL_SIZE.with(|size| size.set(0));
}

fn failures() -> usize {
    FAILURES.with(Cell::get)
}

struct Big {
    rc: RefCount,
    drops: Arc<AtomicUsize>,
    payload: [u64; 61],
}

impl Big {
    fn new(drops: &Arc<AtomicUsize>) -> Self {
        Self {
            rc: RefCount::new(),
            drops: drops.clone(),
            payload: [7; 61],
        }
    }
}

unsafe impl RefCounted for Big {
    fn ref_count(&self) -> &RefCount {
        &self.rc
    }
}

impl Drop for Big {
    fn drop(&mut self) {
        self.drops.fetch_add(1, SeqCst);
    }
}

#[test]
fn try_make_counted_reports_failure() {
    let drops = Arc::new(AtomicUsize::new(0));

    fail_allocations_of::<Big>();
    let result = try_make_counted(Big::new(&drops));
    allocate_normally();

    assert_eq!(failures(), 1);
    assert_eq!(
        result.err(),
        Some(Error::AllocationFailed {
            size: size_of::<Big>(),
            align: align_of::<Big>(),
        })
    );
    // The value was dropped right away and nothing else holds on to it.
    assert_eq!(drops.load(SeqCst), 1);
    assert_eq!(Arc::strong_count(&drops), 1);

    let p = try_make_counted(Big::new(&drops)).unwrap();
    assert!(p.unique());
    assert_eq!(p.payload[60], 7);
    drop(p);
    assert_eq!(drops.load(SeqCst), 2);
}

#[test]
fn try_new_reports_failure() {
    let drops = Arc::new(AtomicUsize::new(0));

    fail_allocations_of::<Big>();
    let err = IntrusivePtr::try_new(Big::new(&drops)).err();
    allocate_normally();

    let Some(err) = err else {
        panic!("allocation should have failed");
    };
    assert_eq!(
        err.to_string(),
        format!(
            "failed to allocate {} bytes (align {}) for a counted object",
            size_of::<Big>(),
            align_of::<Big>()
        )
    );
    assert_eq!(drops.load(SeqCst), 1);
    assert_eq!(Arc::strong_count(&drops), 1);
}

#[test]
fn other_sizes_are_unaffected() {
    let drops = Arc::new(AtomicUsize::new(0));

    fail_allocations_of::<Big>();
    let small = try_make_counted(Small {
        rc: RefCount::new(),
        drops: drops.clone(),
    });
    allocate_normally();

    assert_eq!(failures(), 0);
    let small = small.unwrap();
    assert!(small.unique());
    drop(small);
    assert_eq!(drops.load(SeqCst), 1);
}

struct Small {
    rc: RefCount,
    drops: Arc<AtomicUsize>,
}

unsafe impl RefCounted for Small {
    fn ref_count(&self) -> &RefCount {
        &self.rc
    }
}

impl Drop for Small {
    fn drop(&mut self) {
        self.drops.fetch_add(1, SeqCst);
    }
}
