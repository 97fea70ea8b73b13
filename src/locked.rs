use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use crate::block::ALIGNMENT;
use crate::heap::Heap;
use crate::region::MemoryRegion;

/// Process-wide heap for hosts that want a single manager instead of
/// carrying an instance around. Point `#[global_allocator]` at it to back
/// `alloc` collections.
pub static HEAP: LockedHeap = LockedHeap::empty();

/// [`Heap`] behind a spin lock, const-constructible so it can live in a
/// `static` and serve as the `#[global_allocator]`.
pub struct LockedHeap {
    heap: Mutex<Heap>,
    used: AtomicUsize,
}

impl LockedHeap {
    pub const fn empty() -> Self {
        LockedHeap {
            heap: Mutex::new(Heap::new()),
            used: AtomicUsize::new(0),
        }
    }

    pub fn init(&self, regions: &[MemoryRegion]) -> usize {
        self.heap.lock().init(regions)
    }

    pub fn lock(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock()
    }

    /// Layout bytes currently handed out through the `GlobalAlloc` surface.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.heap.lock().available()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Per-request alignment above the global constant is not supported.
        if layout.align() > ALIGNMENT {
            return null_mut();
        }

        let ptr = self.heap.lock().malloc(layout.size());
        if !ptr.is_null() {
            self.used.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        self.heap.lock().free(ptr);
        self.used.fetch_sub(layout.size(), Ordering::Relaxed);
    }
}
