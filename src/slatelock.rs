//! Mutex-locked wrapper integrating [`Slate`] with the allocator traits.

use crate::slab::{SizeClass, LARGE_SHARD_SIZE, LARGE_THRESHOLD};
use crate::Slate;

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

/// Strongest alignment every small-class shard address satisfies
/// (shards are 48 bytes apart from a page-aligned region base).
const SMALL_ALIGN: usize = 16;

/// Slate lock: wrapper struct containing a mutex-locked [`Slate`].
///
/// Implements [`GlobalAlloc`] and, with the `allocator-api2` feature, the
/// stable `Allocator` API. The lock is coarse: one critical section per
/// allocator call.
#[derive(Debug)]
pub struct Slatelock<R: lock_api::RawMutex>(lock_api::Mutex<R, Slate>);

impl<R: lock_api::RawMutex> Slatelock<R> {
    pub const fn new(slate: Slate) -> Self {
        Self(lock_api::Mutex::new(slate))
    }

    /// Lock the mutex and access the inner [`Slate`].
    pub fn lock(&self) -> lock_api::MutexGuard<'_, R, Slate> {
        self.0.lock()
    }
}

/// Request size to pass through for `layout`, or `None` when the layout's
/// alignment cannot be met by either class.
///
/// Small shards guarantee 16-byte alignment and large shards 256-byte
/// alignment, so layouts demanding more than 16 are bumped into the large
/// class by inflating the request past the class threshold.
fn size_for_layout(layout: Layout) -> Option<usize> {
    if layout.align() <= SMALL_ALIGN {
        Some(layout.size())
    } else if layout.align() <= LARGE_SHARD_SIZE {
        Some(layout.size().max(LARGE_THRESHOLD))
    } else {
        None
    }
}

unsafe impl<R: lock_api::RawMutex> GlobalAlloc for Slatelock<R> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match size_for_layout(layout) {
            Some(size) => self.lock().alloc(size).map_or(ptr::null_mut(), |nn| nn.as_ptr()),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: caller guarantees ptr came from alloc,
        // where null means allocation failure, thus ptr is not null
        let freed = self.lock().free(NonNull::new_unchecked(ptr));

        debug_assert!(freed.is_ok());
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            ptr.write_bytes(0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());

        let (old_size, new_req) = match (size_for_layout(layout), size_for_layout(new_layout)) {
            (Some(old_size), Some(new_req)) => (old_size, new_req),
            _ => return ptr::null_mut(),
        };

        // runs release only whole; the allocation can stay put whenever the
        // rounded shard count doesn't change
        let old_class = SizeClass::of_size(old_size);
        let new_class = SizeClass::of_size(new_req);
        if old_class == new_class && old_class.shards_for(old_size) == new_class.shards_for(new_req)
        {
            return ptr;
        }

        match self.lock().alloc(new_req) {
            Ok(allocation) => {
                ptr::copy_nonoverlapping(ptr, allocation.as_ptr(), layout.size().min(new_size));
                let freed = self.lock().free(NonNull::new_unchecked(ptr));
                debug_assert!(freed.is_ok());
                allocation.as_ptr()
            }
            Err(_) => ptr::null_mut(),
        }
    }
}

#[cfg(feature = "allocator-api2")]
unsafe impl<R: lock_api::RawMutex> allocator_api2::alloc::Allocator for Slatelock<R> {
    fn allocate(
        &self,
        layout: Layout,
    ) -> Result<NonNull<[u8]>, allocator_api2::alloc::AllocError> {
        if layout.size() == 0 {
            // zero-size allocations get a well-aligned dangling pointer
            let dangling = layout.align() as *mut u8;
            return Ok(NonNull::slice_from_raw_parts(
                unsafe { NonNull::new_unchecked(dangling) },
                0,
            ));
        }

        let size = size_for_layout(layout).ok_or(allocator_api2::alloc::AllocError)?;

        self.lock()
            .alloc(size)
            .map(|nn| NonNull::slice_from_raw_parts(nn, layout.size()))
            .map_err(|_| allocator_api2::alloc::AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            let freed = self.lock().free(ptr);

            debug_assert!(freed.is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::SMALL_SHARD_SIZE;

    fn locked() -> Slatelock<spin::Mutex<()>> {
        Slate::new().lock()
    }

    #[test]
    fn global_alloc_round_trip() {
        let slate = locked();
        let layout = Layout::from_size_align(100, 8).unwrap();

        unsafe {
            let ptr = slate.alloc(layout);
            assert!(!ptr.is_null());
            ptr.write_bytes(0xab, layout.size());

            let zeroed = slate.alloc_zeroed(layout);
            assert!(!zeroed.is_null());
            for i in 0..layout.size() {
                assert_eq!(*zeroed.add(i), 0);
            }

            slate.dealloc(ptr, layout);
            slate.dealloc(zeroed, layout);
        }
    }

    #[test]
    fn over_aligned_layouts_use_the_large_class() {
        let slate = locked();

        unsafe {
            let layout = Layout::from_size_align(40, 64).unwrap();
            let ptr = slate.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 64, 0);
            slate.dealloc(ptr, layout);

            // beyond what a large shard can guarantee
            let huge_align = Layout::from_size_align(40, 512).unwrap();
            assert!(slate.alloc(huge_align).is_null());
        }
    }

    #[test]
    fn realloc_within_a_shard_is_in_place() {
        let slate = locked();
        let layout = Layout::from_size_align(10, 8).unwrap();

        unsafe {
            let ptr = slate.alloc(layout);
            ptr.write_bytes(0x5a, 10);

            // still one 48-byte shard
            let same = slate.realloc(ptr, layout, SMALL_SHARD_SIZE);
            assert_eq!(same, ptr);

            // four shards: moved, contents preserved
            let grown = slate.realloc(same, Layout::from_size_align_unchecked(SMALL_SHARD_SIZE, 8), 150);
            assert!(!grown.is_null());
            assert_ne!(grown, ptr);
            for i in 0..10 {
                assert_eq!(*grown.add(i), 0x5a);
            }

            slate.dealloc(grown, Layout::from_size_align_unchecked(150, 8));
        }
    }

    #[cfg(feature = "allocator-api2")]
    #[test]
    fn allocator_api_vec() {
        let slate = locked();

        let mut v = allocator_api2::vec::Vec::with_capacity_in(4, &slate);
        for i in 0..1000 {
            v.push(i);
        }
        assert_eq!(v.len(), 1000);
        assert!(v.iter().copied().eq(0..1000));
    }
}
