//! # Tephra
//!
//! Tephra is a sparse, region-based heap layer for implementing VMs in Rust.
//! A heap is split into fixed-size aligned [regions](region::Region) owned by
//! one space at a time. Spaces allocate through a free-list allocator with a
//! bump window over the youngest region, and reclaim memory with a sweep pass
//! that may run on background threads while the mutator keeps allocating.
//!
//! The crate provides:
//! - [`SparseSpace`](sparse_space::SparseSpace): the allocate/expand/sweep
//!   protocol shared by all sparse spaces.
//! - [`OldSpace`](old_space::OldSpace): region transfer between spaces and
//!   collection-set selection for partial collections.
//! - [`ConcurrentSweeper`](sweeper::ConcurrentSweeper): background sweep
//!   workers with a blocking "finish outstanding work" operation.
//!
//! Object layout, marking, and evacuation are left to the embedder; the
//! external heap is reached through the [`HeapContext`](heap::HeapContext)
//! trait.

pub mod free_list;
pub mod heap;
pub mod mmap;
pub mod old_space;
pub mod provider;
pub mod region;
pub mod sparse_space;
pub mod sweeper;

#[cfg(test)]
mod tests;

/// Default size of one heap region.
pub const DEFAULT_REGION_SIZE: usize = 256 * 1024;
/// Allocation granule; also the granularity of the per-region mark bitmap.
pub const ALLOC_ALIGN: usize = 16;

/// Which sparse space a region currently belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SpaceKind {
    Old,
    NonMovable,
    Snapshot,
    Local,
}

impl SpaceKind {
    pub const COUNT: usize = 4;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            SpaceKind::Old => "old space",
            SpaceKind::NonMovable => "non-movable space",
            SpaceKind::Snapshot => "snapshot space",
            SpaceKind::Local => "local space",
        }
    }
}

/// Configuration for space constructors.
pub struct Config {
    /// Size of one region; must be a power of two.
    pub region_size: usize,
    /// Capacity ceiling of the old space.
    pub old_space_capacity: usize,
    /// Capacity ceiling of the non-movable space.
    pub nonmovable_capacity: usize,
    /// Capacity ceiling of the spawn-snapshot space.
    pub snapshot_capacity: usize,
    /// Capacity ceiling of a transient local space.
    pub local_capacity: usize,
    /// Number of background sweep worker threads.
    pub sweep_threads: usize,
    /// Run sweeping on background threads; when false every sweep is
    /// performed synchronously on the calling thread.
    pub concurrent_sweep: bool,
    /// Regions whose alive fraction is at or above this rate are never
    /// selected for evacuation.
    pub mostly_alive_rate: f64,
    /// Minimum number of regions for a collection set; selections smaller
    /// than this are not worth a partial collection and are dropped.
    pub min_cset_regions: usize,
    /// Alive-byte budget the cset selection walk accumulates against.
    pub evacuate_budget: usize,
    /// How many reclaimed mappings the region provider keeps for reuse.
    pub region_pool_capacity: usize,
    /// Enables verbose printing.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region_size: DEFAULT_REGION_SIZE,
            old_space_capacity: 64 * 1024 * 1024,
            nonmovable_capacity: 16 * 1024 * 1024,
            snapshot_capacity: 8 * 1024 * 1024,
            local_capacity: 32 * 1024 * 1024,
            sweep_threads: 4,
            concurrent_sweep: true,
            mostly_alive_rate: 0.8,
            min_cset_regions: 2,
            evacuate_budget: 512 * 1024,
            region_pool_capacity: 16,
            verbose: false,
        }
    }
}

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    align_down(addr + align - 1, align)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

pub(crate) struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub(crate) fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}
