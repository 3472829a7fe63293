//! Track allocation counters for Slate.

/// Allocation statistics, enabled by the `counters` feature.
///
/// Byte figures are shard-rounded: they measure what the allocator claimed,
/// not what the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Counters {
    /// Number of live allocations.
    pub allocation_count: usize,
    /// Total number of allocations ever made.
    pub total_allocation_count: u64,

    /// Sum of live allocations' shard-rounded sizes.
    pub allocated_bytes: usize,
    /// Sum of all allocations' shard-rounded sizes.
    pub total_allocated_bytes: u64,

    /// Number of slabs in the chain. Slabs are never unmapped, so this
    /// only grows.
    pub slab_count: usize,
    /// Sum of bytes mapped for slabs, metadata included.
    pub claimed_bytes: usize,
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            allocation_count: 0,
            total_allocation_count: 0,
            allocated_bytes: 0,
            total_allocated_bytes: 0,
            slab_count: 0,
            claimed_bytes: 0,
        }
    }

    /// Total shard-rounded bytes that have been freed again.
    pub const fn total_freed_bytes(&self) -> u64 {
        self.total_allocated_bytes - self.allocated_bytes as u64
    }

    /// Bytes mapped but not currently allocated (free shards plus metadata).
    pub const fn overhead_bytes(&self) -> usize {
        self.claimed_bytes - self.allocated_bytes
    }

    pub(crate) fn account_alloc(&mut self, shard_bytes: usize) {
        self.allocation_count += 1;
        self.allocated_bytes += shard_bytes;

        self.total_allocation_count += 1;
        self.total_allocated_bytes += shard_bytes as u64;
    }

    pub(crate) fn account_free(&mut self, shard_bytes: usize) {
        self.allocation_count -= 1;
        self.allocated_bytes -= shard_bytes;
    }

    pub(crate) fn account_slab(&mut self, map_bytes: usize) {
        self.slab_count += 1;
        self.claimed_bytes += map_bytes;
    }
}

impl crate::Slate {
    pub fn counters(&self) -> &Counters {
        &self.counters
    }
}
