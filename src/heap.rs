use core::ptr::{self, null_mut};

use crate::block::{align_up, Block, ALLOC_BIT, BLOCK_META_SIZE};
use crate::region::MemoryRegion;
use crate::trace::HeapTrace;

/// Free-list memory manager over caller-supplied regions.
///
/// The regions handed to [`Heap::init`] become the manager's entire working
/// set; it never asks the host for more memory. Every block carries an
/// in-band [`Block`] header, free blocks form one address-ordered list
/// across all regions, and adjacent free blocks are merged eagerly.
///
/// Access must be serialized by the caller; see [`LockedHeap`](crate::LockedHeap)
/// for the mutex-wrapped form.
pub struct Heap {
    start_block: Block,
    end_block: *mut Block,
    available_bytes: usize,
    capacity_bytes: usize,
    region_count: usize,
    trace: Option<&'static dyn HeapTrace>,
}

// Safety: the raw pointers reference memory the heap exclusively owns from
// init onward. No region memory points back at the Heap struct, so the
// value can move between threads as long as access stays serialized.
unsafe impl Send for Heap {}

impl Heap {
    pub const fn new() -> Self {
        Heap {
            start_block: Block {
                next: null_mut(),
                size: 0,
            },
            end_block: null_mut(),
            available_bytes: 0,
            capacity_bytes: 0,
            region_count: 0,
            trace: None,
        }
    }

    /// Install an observer for setup events. Call before [`Heap::init`].
    pub fn set_trace(&mut self, trace: &'static dyn HeapTrace) {
        self.trace = Some(trace);
    }

    /// Set up the heap over `regions` and stitch them into one free list.
    ///
    /// Regions must be declared in ascending address order and must not
    /// overlap; violating that rejects the whole call. Regions too small to
    /// hold a header plus one aligned allocation are dropped individually.
    /// Returns the number of regions admitted, or 0 when nothing was
    /// admitted, the declarations overlap, or the heap is already set up.
    pub fn init(&mut self, regions: &[MemoryRegion]) -> usize {
        if !self.end_block.is_null() {
            return 0;
        }

        // Overlap check on the declared bounds, before any normalization.
        let mut declared_end = 0usize;
        for region in regions {
            if declared_end > region.start {
                return 0;
            }
            declared_end = region.end();
        }

        for region in regions {
            let region = match region.normalized() {
                Some(region) => region,
                None => continue,
            };
            let start = region.start;
            let size = region.size;

            if self.end_block.is_null() {
                self.start_block.next = start as *mut Block;
                self.start_block.size = 0;
            }

            let prev_end_block = self.end_block;

            // Trailing sentinel: size 0, terminates the list until the next
            // region (if any) is stitched in behind it.
            let end_block = (start + size - BLOCK_META_SIZE) as *mut Block;
            let first_block = start as *mut Block;
            unsafe {
                (*end_block).next = null_mut();
                (*end_block).size = 0;

                (*first_block).next = end_block;
                (*first_block).size = size - BLOCK_META_SIZE;

                if !prev_end_block.is_null() {
                    (*prev_end_block).next = first_block;
                }
            }
            self.end_block = end_block;

            let usable = size - BLOCK_META_SIZE;
            self.available_bytes += usable;
            self.capacity_bytes += usable;
            self.region_count += 1;

            if let Some(trace) = self.trace {
                trace.region_admitted(start, start + size, usable);
            }
        }

        if self.region_count > 0 {
            if let Some(trace) = self.trace {
                trace.ready(self.region_count, self.capacity_bytes);
            }
        }

        self.region_count
    }

    /// Alias of [`Heap::init`].
    pub fn assign_regions(&mut self, regions: &[MemoryRegion]) -> usize {
        self.init(regions)
    }

    /// Allocate `size` bytes. Returns null when the heap is not set up, the
    /// request is zero or oversized, or no free block fits.
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        if self.end_block.is_null() || size == 0 || size & ALLOC_BIT != 0 {
            return null_mut();
        }

        let size = align_up(size) + BLOCK_META_SIZE;
        if size & ALLOC_BIT != 0 {
            return null_mut();
        }

        unsafe {
            // First fit, keeping a prev cursor so the block can be spliced
            // out. Sentinels have size 0 and never match.
            let mut prev: *mut Block = &mut self.start_block;
            let mut curr = (*prev).next;
            while (*curr).size < size {
                if curr == self.end_block || (*curr).next.is_null() {
                    return null_mut();
                }
                prev = curr;
                curr = (*curr).next;
            }

            let payload = (curr as *mut u8).add(BLOCK_META_SIZE);
            (*prev).next = (*curr).next;

            // Split only when the remainder can hold a header plus a usable
            // allocation on its own; smaller tails stay with the block.
            if (*curr).size - size > 2 * BLOCK_META_SIZE {
                let tail = (curr as *mut u8).add(size) as *mut Block;
                (*tail).size = (*curr).size - size;
                (*curr).size = size;
                self.insert_free_block(tail);
            }

            self.available_bytes -= (*curr).size;
            (*curr).size |= ALLOC_BIT;
            (*curr).next = null_mut();

            payload
        }
    }

    /// Allocate `nitems * size` zeroed bytes. Returns null on multiply
    /// overflow or allocation failure.
    pub fn calloc(&mut self, nitems: usize, size: usize) -> *mut u8 {
        let total = match nitems.checked_mul(size) {
            Some(total) => total,
            None => return null_mut(),
        };

        let payload = self.malloc(total);
        if !payload.is_null() {
            unsafe { ptr::write_bytes(payload, 0, total) };
        }
        payload
    }

    /// Resize an allocation:
    ///
    /// - `ptr` null, `size` 0: null, no state change
    /// - `ptr` null, `size` > 0: same as [`Heap::malloc`]
    /// - `ptr` non-null, `size` 0: same as [`Heap::free`], returns null
    /// - both non-zero: allocate, copy the surviving payload, release the
    ///   old block; on allocation failure `ptr` stays valid and null is
    ///   returned
    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            if !ptr.is_null() {
                self.free(ptr);
            }
            return null_mut();
        }
        if ptr.is_null() {
            return self.malloc(size);
        }

        let old_payload = unsafe {
            let block = ptr.sub(BLOCK_META_SIZE) as *mut Block;
            ((*block).size & !ALLOC_BIT) - BLOCK_META_SIZE
        };

        let new_ptr = self.malloc(size);
        if !new_ptr.is_null() {
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_payload.min(size)) };
            self.free(ptr);
        }
        new_ptr
    }

    /// Release an allocation. Null is a no-op; a pointer whose header does
    /// not look live (allocated bit set, no list link) is silently ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        unsafe {
            let block = ptr.sub(BLOCK_META_SIZE) as *mut Block;
            if (*block).size & ALLOC_BIT != 0 && (*block).next.is_null() {
                (*block).size &= !ALLOC_BIT;
                self.available_bytes += (*block).size;
                self.insert_free_block(block);
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.end_block.is_null()
    }

    /// Bytes currently on the free list, headers included.
    pub fn available(&self) -> usize {
        self.available_bytes
    }

    /// Total usable bytes admitted at init time; fixed thereafter.
    pub fn capacity(&self) -> usize {
        self.capacity_bytes
    }

    pub fn region_count(&self) -> usize {
        self.region_count
    }

    /// Insert a detached free block at its address-sorted position and
    /// merge with whichever neighbours touch it.
    unsafe fn insert_free_block(&mut self, block: *mut Block) {
        let mut new_block = block;
        let mut curr: *mut Block = &mut self.start_block;

        unsafe {
            while !curr.is_null() && (*curr).next < new_block {
                curr = (*curr).next;
            }

            if (curr as *mut u8).add((*curr).size) == new_block as *mut u8 {
                (*curr).size += (*new_block).size;
                new_block = curr;
            }

            if (new_block as *mut u8).add((*new_block).size) == (*curr).next as *mut u8 {
                if (*curr).next == self.end_block {
                    // The terminal sentinel stays a distinct object.
                    (*new_block).next = self.end_block;
                } else {
                    (*new_block).size += (*(*curr).next).size;
                    (*new_block).next = (*(*curr).next).next;
                }
            } else {
                (*new_block).next = (*curr).next;
            }

            if curr != new_block {
                (*curr).next = new_block;
            }
        }
    }
}
