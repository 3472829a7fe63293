//! A cluster pairs one presence bitmap with 256 shard slots of data.
//!
//! The bitmap itself lives in the owning slab's metadata, so [`Cluster`] is a
//! copyable pointer wrapper; every operation reads the map out of slab memory,
//! transforms it with the [`bitmap`](crate::bitmap) primitives, and writes it
//! back. Clusters are evaluated in isolation: a run claimed here can never
//! straddle into a neighbouring cluster's slots.

use crate::bitmap::{Bitmap256, BITMAP_BITS};

/// Pointer wrapper over a cluster's presence bitmap in slab metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Cluster(pub(crate) *mut Bitmap256);

impl Cluster {
    /// Mark every slot of the cluster free.
    ///
    /// # Safety
    /// `self.0` must be valid for writes.
    pub(crate) unsafe fn init(self) {
        self.0.write(Bitmap256::FULL);
    }

    /// Claim the first run of `len` free slots, returning its local index.
    ///
    /// Returns `None` without modifying the bitmap if no run of `len`
    /// consecutive free slots exists in this cluster.
    ///
    /// # Safety
    /// `self.0` must be valid for reads and writes.
    pub(crate) unsafe fn try_claim(self, len: usize) -> Option<usize> {
        debug_assert!(1 <= len && len <= BITMAP_BITS);

        let mut map = self.0.read();
        let local = map.claim_run(len)?;
        self.0.write(map);

        debug_assert!(local + len <= BITMAP_BITS);

        Some(local)
    }

    /// Release the run of `len` slots starting at `local`.
    ///
    /// # Safety
    /// `self.0` must be valid for reads and writes, and the run must have
    /// been claimed and not yet released.
    pub(crate) unsafe fn release(self, local: usize, len: usize) {
        let mut map = self.0.read();
        map.release_run(local, len);
        self.0.write(map);
    }

    /// Whether all `len` slots starting at `local` are currently claimed.
    /// A free slot inside the span means the run is not live (double free).
    ///
    /// # Safety
    /// `self.0` must be valid for reads.
    pub(crate) unsafe fn is_claimed(self, local: usize, len: usize) -> bool {
        self.0.read().is_run_claimed(local, len)
    }

    /// Number of currently free slots.
    ///
    /// # Safety
    /// `self.0` must be valid for reads.
    #[allow(dead_code)] // exercised by slab tests
    pub(crate) unsafe fn free_slots(self) -> usize {
        self.0.read().count_ones()
    }
}
