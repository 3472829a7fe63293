//! # slate
//!
//! A slab allocator built on 256-bit presence-bitmap run search.
//!
//! Memory is handed out in fixed-size *shards* of two size classes (48-byte
//! shards for requests under 512 bytes, 256-byte shards otherwise). Up to 256
//! shards form a *cluster*, whose free/used state is one 256-bit presence
//! bitmap; an allocation is a *run* of consecutive free shards found by
//! condensing that bitmap with shift-and-AND. All clusters of both classes
//! live inside fixed-size memory-mapped *slabs*, chained append-only and
//! grown lazily when every existing cluster turns a request down. Slabs are
//! never returned to the operating system; churn is expected at shard
//! granularity.
//!
//! ```
//! use slate::Slate;
//!
//! let mut slate = Slate::new();
//!
//! let ptr = slate.alloc(100).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0xab, 100);
//!     slate.free(ptr).unwrap();
//! }
//! ```
//!
//! Call [`lock`](Slate::lock) to get a [`Slatelock`], which supports the
//! [`GlobalAlloc`](core::alloc::GlobalAlloc) trait and (with the
//! `allocator-api2` feature) the `Allocator` API.

#![cfg_attr(not(test), no_std)]

#[cfg(not(feature = "fuzzing"))]
mod bitmap;
#[cfg(feature = "fuzzing")]
pub mod bitmap;
mod cluster;
mod slab;

#[cfg(feature = "counters")]
mod counters;
#[cfg(feature = "lock_api")]
mod slatelock;

#[cfg(feature = "counters")]
pub use counters::Counters;
#[cfg(feature = "lock_api")]
pub use slatelock::Slatelock;

use core::ptr::{null_mut, NonNull};

use slab::{SizeClass, SlabHeader, SlabRef};

/// Failure of [`Slate::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The request needs more shards of its class than one cluster holds.
    AllocationTooLarge,
    /// The operating system denied a new slab mapping.
    OutOfMemory,
}

impl core::fmt::Display for AllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AllocError::AllocationTooLarge => f.write_str("allocation exceeds one cluster"),
            AllocError::OutOfMemory => f.write_str("slab mapping request denied"),
        }
    }
}

/// Failure of [`Slate::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// The pointer does not correspond to a currently-occupied run start.
    /// Double frees land here too.
    InvalidFree,
}

impl core::fmt::Display for FreeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FreeError::InvalidFree => f.write_str("pointer is not a live allocation"),
        }
    }
}

/// The slate allocator: a chain of memory-mapped slabs whose shard occupancy
/// is tracked by per-cluster presence bitmaps.
///
/// The first slab is mapped on the first allocation; the chain only ever
/// grows. `Slate` itself performs no synchronization; wrap it with
/// [`lock`](Slate::lock) for shared use.
pub struct Slate {
    head: *mut SlabHeader,

    #[cfg(feature = "counters")]
    counters: Counters,
}

unsafe impl Send for Slate {}

impl core::fmt::Debug for Slate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Slate").field("head", &self.head).finish()
    }
}

impl Default for Slate {
    fn default() -> Self {
        Self::new()
    }
}

impl Slate {
    pub const fn new() -> Self {
        Self {
            head: null_mut(),

            #[cfg(feature = "counters")]
            counters: Counters::new(),
        }
    }

    /// Allocate `size` bytes, rounded up to whole shards of the matching
    /// size class.
    ///
    /// Clusters are probed first-fit in a fixed index order across the slab
    /// chain, favouring allocation speed over packing density. When no
    /// cluster can seat the run, a new slab is mapped and appended.
    /// Zero-size requests are rounded up to one shard.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let class = SizeClass::of_size(size);
        let len = class.shards_for(size).ok_or(AllocError::AllocationTooLarge)?;

        let mut slab = match self.head_slab() {
            Some(slab) => slab,
            None => {
                let slab = SlabRef::create()?;
                self.head = slab.0;
                self.account_slab();
                slab
            }
        };

        loop {
            // the cluster index travels with the local index; the shard
            // address needs both
            if let Some((cluster, local)) = unsafe { slab.claim(class, len) } {
                unsafe {
                    slab.set_run_length(SlabRef::slot_index(class, cluster, local), len);
                    slab.check_cluster(class, cluster);
                }

                self.account_alloc(len * class.shard_size());

                // the shard data region of an mmap'd slab is never at null
                return Ok(unsafe {
                    NonNull::new_unchecked(slab.shard_ptr(class, cluster, local))
                });
            }

            slab = match unsafe { slab.next() } {
                Some(next) => next,
                None => {
                    // every cluster of this class is exhausted; grow the
                    // chain and retry against the fresh slab alone
                    let next = SlabRef::create()?;
                    unsafe { slab.set_next(next) };
                    self.account_slab();
                    next
                }
            };
        }
    }

    /// Release the allocation at `ptr`.
    ///
    /// The owning slab is found by address-range containment and the run
    /// length is read back from the slab's run-length table. Pointers that
    /// don't name a currently-occupied run start — foreign pointers, shard
    /// interiors, and double frees — are rejected with [`FreeError`] and
    /// leave the allocator state untouched.
    ///
    /// # Safety
    /// If `ptr` names a live allocation of this allocator, the caller must
    /// not access that memory afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        let mut cursor = self.head_slab();
        let slab = loop {
            match cursor {
                Some(slab) if slab.contains(ptr.as_ptr()) => break slab,
                Some(slab) => cursor = slab.next(),
                None => return Err(FreeError::InvalidFree),
            }
        };

        let (class, cluster_index, local) =
            slab.locate(ptr.as_ptr()).ok_or(FreeError::InvalidFree)?;
        let slot = SlabRef::slot_index(class, cluster_index, local);

        let len = slab.run_length(slot);
        if len == 0 {
            // not a tracked run start: stray pointer, shard interior of a
            // run, or a repeated free after the entry was cleared
            return Err(FreeError::InvalidFree);
        }

        let cluster = slab.cluster(class, cluster_index);
        if !cluster.is_claimed(local, len) {
            return Err(FreeError::InvalidFree);
        }

        // clear the table entry before restoring the bits, so a torn state
        // reads as "untracked" rather than as a live run
        slab.set_run_length(slot, 0);
        cluster.release(local, len);
        slab.check_cluster(class, cluster_index);

        self.account_free(len * class.shard_size());

        Ok(())
    }

    fn head_slab(&self) -> Option<SlabRef> {
        if self.head.is_null() {
            None
        } else {
            Some(SlabRef(self.head))
        }
    }

    #[allow(unused_variables)]
    fn account_alloc(&mut self, shard_bytes: usize) {
        #[cfg(feature = "counters")]
        self.counters.account_alloc(shard_bytes);
    }

    #[allow(unused_variables)]
    fn account_free(&mut self, shard_bytes: usize) {
        #[cfg(feature = "counters")]
        self.counters.account_free(shard_bytes);
    }

    fn account_slab(&mut self) {
        #[cfg(feature = "counters")]
        self.counters.account_slab(slab::MAP_SIZE);
    }

    /// Wrap in [`Slatelock`], a mutex-locked wrapper struct using
    /// [`lock_api`], which provides the
    /// [`GlobalAlloc`](core::alloc::GlobalAlloc) implementation.
    ///
    /// # Examples
    /// ```
    /// # use slate::*;
    /// # use core::alloc::{GlobalAlloc, Layout};
    /// use spin::Mutex;
    /// let slate = Slate::new().lock::<Mutex<()>>();
    ///
    /// unsafe {
    ///     slate.alloc(Layout::from_size_align_unchecked(32, 4));
    /// }
    /// ```
    #[cfg(feature = "lock_api")]
    pub const fn lock<R: lock_api::RawMutex>(self) -> Slatelock<R> {
        Slatelock::new(self)
    }
}
