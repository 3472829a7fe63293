//! Slab geometry, layout, and creation.
//!
//! A slab is one fixed-size anonymous mapping. Its metadata (both size
//! classes' presence bitmaps, the run-length table, and the chain link) sits
//! at the base of the mapping; the shard data regions follow at the next page
//! boundary, small class first. Slabs are chained singly and append-only, and
//! are never unmapped for the lifetime of the process.

use core::mem::size_of;
use core::ptr::{addr_of_mut, null_mut};

use crate::bitmap::{Bitmap256, BITMAP_BITS};
use crate::cluster::Cluster;
use crate::AllocError;

/// Allocation unit of the small class.
pub(crate) const SMALL_SHARD_SIZE: usize = 48;
/// Allocation unit of the large class.
pub(crate) const LARGE_SHARD_SIZE: usize = 256;
/// Requests of this many bytes or more go to the large class.
pub(crate) const LARGE_THRESHOLD: usize = 512;

/// Shard slots governed by one cluster bitmap.
pub(crate) const SHARDS_PER_CLUSTER: usize = BITMAP_BITS;

/// Byte budget of the small-class shard region per slab.
pub(crate) const SMALL_REGION_SIZE: usize = 3 * 1024 * 1024;
/// Byte budget of the large-class shard region per slab.
pub(crate) const LARGE_REGION_SIZE: usize = 1024 * 1024;
/// Shard data carried by one slab.
pub(crate) const SLAB_DATA_SIZE: usize = SMALL_REGION_SIZE + LARGE_REGION_SIZE;

pub(crate) const SMALL_CLUSTERS: usize =
    SMALL_REGION_SIZE / (SHARDS_PER_CLUSTER * SMALL_SHARD_SIZE);
pub(crate) const LARGE_CLUSTERS: usize =
    LARGE_REGION_SIZE / (SHARDS_PER_CLUSTER * LARGE_SHARD_SIZE);

/// Shard slots per slab across both classes; small-class slots come first in
/// the run-length table.
pub(crate) const TOTAL_SLOTS: usize = (SMALL_CLUSTERS + LARGE_CLUSTERS) * SHARDS_PER_CLUSTER;

const PAGE_SIZE: usize = 4096;

/// Offset of the shard data regions from the mapping base.
pub(crate) const DATA_OFFSET: usize = (size_of::<SlabHeader>() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
/// Total size of one slab mapping.
pub(crate) const MAP_SIZE: usize = DATA_OFFSET + SLAB_DATA_SIZE;

// each region's byte budget must divide evenly into whole clusters
const _: () = assert!(SMALL_REGION_SIZE % (SHARDS_PER_CLUSTER * SMALL_SHARD_SIZE) == 0);
const _: () = assert!(LARGE_REGION_SIZE % (SHARDS_PER_CLUSTER * LARGE_SHARD_SIZE) == 0);
const _: () = assert!(DATA_OFFSET >= size_of::<SlabHeader>());
const _: () = assert!(MAP_SIZE % PAGE_SIZE == 0);
// a run length of up to SHARDS_PER_CLUSTER must fit a table entry
const _: () = assert!(SHARDS_PER_CLUSTER <= u16::MAX as usize);

/// The two allocation policy buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    pub(crate) fn of_size(size: usize) -> Self {
        if size < LARGE_THRESHOLD {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }

    pub(crate) const fn shard_size(self) -> usize {
        match self {
            SizeClass::Small => SMALL_SHARD_SIZE,
            SizeClass::Large => LARGE_SHARD_SIZE,
        }
    }

    pub(crate) const fn cluster_count(self) -> usize {
        match self {
            SizeClass::Small => SMALL_CLUSTERS,
            SizeClass::Large => LARGE_CLUSTERS,
        }
    }

    /// Offset of this class's shard region from the slab's data base.
    pub(crate) const fn region_offset(self) -> usize {
        match self {
            SizeClass::Small => 0,
            SizeClass::Large => SMALL_REGION_SIZE,
        }
    }

    /// Number of shards needed to hold `size` bytes, or `None` if that
    /// exceeds what a single cluster can hold. Zero-size requests round up
    /// to one shard.
    pub(crate) const fn shards_for(self, size: usize) -> Option<usize> {
        let shard = self.shard_size();
        if size > shard * SHARDS_PER_CLUSTER {
            return None;
        }

        let len = (size + shard - 1) / shard;
        if len == 0 {
            Some(1)
        } else {
            Some(len)
        }
    }

    /// First run-length table index belonging to this class.
    pub(crate) const fn slot_base(self) -> usize {
        match self {
            SizeClass::Small => 0,
            SizeClass::Large => SMALL_CLUSTERS * SHARDS_PER_CLUSTER,
        }
    }
}

/// Slab metadata, resident at the base of the mapping.
///
/// Only the bitmaps, the run-length table, and `next` ever mutate; the
/// mapping's size and location are fixed at creation.
#[repr(C)]
pub(crate) struct SlabHeader {
    small_maps: [Bitmap256; SMALL_CLUSTERS],
    large_maps: [Bitmap256; LARGE_CLUSTERS],
    /// Length of the run starting at each shard slot, 0 for non-starts.
    /// This is what tells `free` how many slots to release.
    run_lengths: [u16; TOTAL_SLOTS],
    next: *mut SlabHeader,
}

/// Pointer wrapper over a slab's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct SlabRef(pub(crate) *mut SlabHeader);

impl SlabRef {
    /// Map and initialize a fresh slab, every slot free.
    ///
    /// The mapping is anonymous, private, and read/write. Anonymous pages
    /// arrive zeroed, so the run-length table and the chain link need no
    /// explicit initialization; only the bitmaps are written. Shard data is
    /// left uninitialized as far as callers are concerned.
    pub(crate) fn create() -> Result<SlabRef, AllocError> {
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                MAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(AllocError::OutOfMemory);
        }

        let slab = SlabRef(ptr.cast());

        unsafe {
            for class in [SizeClass::Small, SizeClass::Large] {
                for index in 0..class.cluster_count() {
                    slab.cluster(class, index).init();
                }
            }
        }

        Ok(slab)
    }

    pub(crate) fn base(self) -> *mut u8 {
        self.0.cast()
    }

    /// Base of the shard data regions.
    pub(crate) fn data_base(self) -> *mut u8 {
        self.base().wrapping_add(DATA_OFFSET)
    }

    /// Whether `ptr` lies within this slab's shard data.
    pub(crate) fn contains(self, ptr: *mut u8) -> bool {
        let base = self.data_base() as usize;
        base <= ptr as usize && (ptr as usize) < base + SLAB_DATA_SIZE
    }

    /// # Safety
    /// `self.0` must point to a live slab header.
    pub(crate) unsafe fn next(self) -> Option<SlabRef> {
        let next = (*self.0).next;
        if next.is_null() {
            None
        } else {
            Some(SlabRef(next))
        }
    }

    /// Append `next` behind this slab. The chain is append-only, so the
    /// current link must be empty.
    ///
    /// # Safety
    /// `self.0` must point to a live slab header.
    pub(crate) unsafe fn set_next(self, next: SlabRef) {
        debug_assert!((*self.0).next.is_null());

        (*self.0).next = next.0;
    }

    /// # Safety
    /// `self.0` must point to a live slab header.
    pub(crate) unsafe fn cluster(self, class: SizeClass, index: usize) -> Cluster {
        debug_assert!(index < class.cluster_count());

        match class {
            SizeClass::Small => Cluster(addr_of_mut!((*self.0).small_maps[index])),
            SizeClass::Large => Cluster(addr_of_mut!((*self.0).large_maps[index])),
        }
    }

    /// First-fit probe across this slab's clusters of `class`, in index
    /// order. The matching cluster index travels with the local index; both
    /// are needed to derive the shard address.
    ///
    /// # Safety
    /// `self.0` must point to a live slab header.
    pub(crate) unsafe fn claim(self, class: SizeClass, len: usize) -> Option<(usize, usize)> {
        for index in 0..class.cluster_count() {
            if let Some(local) = self.cluster(class, index).try_claim(len) {
                return Some((index, local));
            }
        }

        None
    }

    /// Address of the shard at `(class, cluster, local)`.
    pub(crate) fn shard_ptr(self, class: SizeClass, cluster: usize, local: usize) -> *mut u8 {
        debug_assert!(cluster < class.cluster_count());
        debug_assert!(local < SHARDS_PER_CLUSTER);

        let slot = cluster * SHARDS_PER_CLUSTER + local;
        self.data_base().wrapping_add(class.region_offset() + slot * class.shard_size())
    }

    /// Map a pointer within this slab's data back to `(class, cluster,
    /// local)`. Addresses that don't land on a shard start return `None`.
    pub(crate) fn locate(self, ptr: *mut u8) -> Option<(SizeClass, usize, usize)> {
        debug_assert!(self.contains(ptr));

        let offset = ptr as usize - self.data_base() as usize;
        let (class, class_offset) = if offset < SMALL_REGION_SIZE {
            (SizeClass::Small, offset)
        } else {
            (SizeClass::Large, offset - SMALL_REGION_SIZE)
        };

        if class_offset % class.shard_size() != 0 {
            return None;
        }

        let slot = class_offset / class.shard_size();
        Some((class, slot / SHARDS_PER_CLUSTER, slot % SHARDS_PER_CLUSTER))
    }

    /// Run-length table index of `(class, cluster, local)`.
    pub(crate) fn slot_index(class: SizeClass, cluster: usize, local: usize) -> usize {
        class.slot_base() + cluster * SHARDS_PER_CLUSTER + local
    }

    /// # Safety
    /// `self.0` must point to a live slab header, `slot < TOTAL_SLOTS`.
    pub(crate) unsafe fn run_length(self, slot: usize) -> usize {
        (*self.0).run_lengths[slot] as usize
    }

    /// # Safety
    /// `self.0` must point to a live slab header, `slot < TOTAL_SLOTS`.
    pub(crate) unsafe fn set_run_length(self, slot: usize, len: usize) {
        debug_assert!(len <= SHARDS_PER_CLUSTER);

        (*self.0).run_lengths[slot] = len as u16;
    }

    /// Cross-check one cluster's bitmap against the run-length table: every
    /// tracked run is within bounds and fully claimed, and the tracked run
    /// lengths account for every claimed slot.
    ///
    /// # Safety
    /// `self.0` must point to a live slab header.
    #[cfg(any(debug_assertions, feature = "fuzzing"))]
    pub(crate) unsafe fn check_cluster(self, class: SizeClass, index: usize) {
        let map = self.cluster(class, index).0.read();

        let mut tracked = 0;
        for local in 0..SHARDS_PER_CLUSTER {
            let len = self.run_length(Self::slot_index(class, index, local));
            if len != 0 {
                assert!(local + len <= SHARDS_PER_CLUSTER, "run straddles a cluster boundary");
                for slot in local..local + len {
                    assert!(!map.get(slot), "tracked run has free slots");
                }
                tracked += len;
            }
        }

        assert!(
            tracked == SHARDS_PER_CLUSTER - map.count_ones(),
            "bitmap and run-length table disagree"
        );
    }

    #[cfg(not(any(debug_assertions, feature = "fuzzing")))]
    pub(crate) unsafe fn check_cluster(self, _: SizeClass, _: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry() {
        assert_eq!(SMALL_CLUSTERS, 256);
        assert_eq!(LARGE_CLUSTERS, 16);
        assert_eq!(TOTAL_SLOTS, 69632);
        assert_eq!(SLAB_DATA_SIZE, 4 * 1024 * 1024);

        // the header must fit below the data regions
        assert!(size_of::<SlabHeader>() <= DATA_OFFSET);
        assert_eq!(DATA_OFFSET % PAGE_SIZE, 0);
    }

    #[test]
    fn create_initializes_all_clusters_free() {
        let slab = SlabRef::create().unwrap();

        unsafe {
            for class in [SizeClass::Small, SizeClass::Large] {
                for index in 0..class.cluster_count() {
                    assert_eq!(slab.cluster(class, index).free_slots(), SHARDS_PER_CLUSTER);
                }
            }

            for slot in 0..TOTAL_SLOTS {
                assert_eq!(slab.run_length(slot), 0);
            }

            assert!(slab.next().is_none());
        }
    }

    #[test]
    fn shard_ptr_locate_round_trip() {
        let slab = SlabRef::create().unwrap();

        for (class, cluster, local) in [
            (SizeClass::Small, 0, 0),
            (SizeClass::Small, 0, 255),
            (SizeClass::Small, 1, 0),
            (SizeClass::Small, 137, 42),
            (SizeClass::Small, 255, 255),
            (SizeClass::Large, 0, 0),
            (SizeClass::Large, 7, 200),
            (SizeClass::Large, 15, 255),
        ] {
            let ptr = slab.shard_ptr(class, cluster, local);
            assert!(slab.contains(ptr));
            assert_eq!(slab.locate(ptr), Some((class, cluster, local)));
        }

        // distinct clusters must never alias, even at equal local indices
        assert_ne!(
            slab.shard_ptr(SizeClass::Small, 0, 3),
            slab.shard_ptr(SizeClass::Small, 1, 3)
        );
    }

    #[test]
    fn locate_rejects_shard_interiors() {
        let slab = SlabRef::create().unwrap();

        let ptr = slab.shard_ptr(SizeClass::Small, 2, 9);
        assert_eq!(slab.locate(ptr.wrapping_add(1)), None);
        assert_eq!(slab.locate(ptr.wrapping_add(SMALL_SHARD_SIZE - 1)), None);

        let ptr = slab.shard_ptr(SizeClass::Large, 3, 17);
        assert_eq!(slab.locate(ptr.wrapping_add(100)), None);
    }

    #[test]
    fn contains_is_bounded_by_the_data_region() {
        let slab = SlabRef::create().unwrap();

        assert!(!slab.contains(slab.base()));
        assert!(!slab.contains(slab.data_base().wrapping_sub(1)));
        assert!(slab.contains(slab.data_base()));
        assert!(slab.contains(slab.data_base().wrapping_add(SLAB_DATA_SIZE - 1)));
        assert!(!slab.contains(slab.data_base().wrapping_add(SLAB_DATA_SIZE)));
    }
}
