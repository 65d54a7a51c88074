//! Free-object indexing and the per-space allocation front-end.

use hashbrown::HashMap;

use crate::{
    align_up,
    region::{Region, RegionId},
    ALLOC_ALIGN,
};

/// Gaps smaller than this are not worth indexing; they count as wasted bytes
/// on their region until the next sweep coalesces them away.
pub const MIN_FREE_ENTRY: usize = 32;

/// One reusable gap inside a region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FreeObject {
    pub address: usize,
    pub size: usize,
}

/// The free-object index of a single region, produced by sweeping it.
#[derive(Debug)]
pub struct FreeObjectSet {
    region: RegionId,
    entries: Vec<FreeObject>,
    available: usize,
}

impl FreeObjectSet {
    pub fn new(region: RegionId) -> Self {
        Self {
            region,
            entries: Vec::new(),
            available: 0,
        }
    }

    #[inline]
    pub fn region(&self) -> RegionId {
        self.region
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, object: FreeObject) {
        self.available += object.size;
        self.entries.push(object);
    }

    pub fn can_satisfy(&self, size: usize) -> bool {
        self.entries.iter().any(|e| e.size >= size)
    }

    /// Removes and returns the first entry large enough for `size`.
    fn take_fit(&mut self, size: usize) -> Option<FreeObject> {
        let at = self.entries.iter().position(|e| e.size >= size)?;
        let object = self.entries.swap_remove(at);
        self.available -= object.size;
        Some(object)
    }
}

/// Free-object indexes of every region a space owns, keyed by region.
pub struct FreeObjectList {
    sets: HashMap<RegionId, FreeObjectSet>,
    available: usize,
}

impl FreeObjectList {
    pub fn new() -> Self {
        Self {
            sets: HashMap::new(),
            available: 0,
        }
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }

    /// First-fit allocation. The tail of an oversized entry goes back on the
    /// list when it is still indexable; a smaller tail stays attached to the
    /// allocation.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        for set in self.sets.values_mut() {
            if let Some(object) = set.take_fit(size) {
                self.available -= object.size;
                let remainder = object.size - size;
                if remainder >= MIN_FREE_ENTRY {
                    set.add(FreeObject {
                        address: object.address + size,
                        size: remainder,
                    });
                    self.available += remainder;
                }
                return Some(object.address);
            }
        }
        None
    }

    pub fn free(&mut self, region: RegionId, address: usize, size: usize) {
        let set = self
            .sets
            .entry(region)
            .or_insert_with(|| FreeObjectSet::new(region));
        set.add(FreeObject { address, size });
        self.available += size;
    }

    pub fn add_set(&mut self, set: FreeObjectSet) {
        self.available += set.available();
        match self.sets.entry(set.region) {
            hashbrown::hash_map::Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                existing.available += set.available;
                existing.entries.extend(set.entries);
            }
            hashbrown::hash_map::Entry::Vacant(slot) => {
                slot.insert(set);
            }
        }
    }

    pub fn take_set(&mut self, region: RegionId) -> Option<FreeObjectSet> {
        let set = self.sets.remove(&region)?;
        self.available -= set.available();
        Some(set)
    }

    pub fn lookup_suitable(&self, size: usize) -> Option<RegionId> {
        self.sets
            .values()
            .find(|set| set.can_satisfy(size))
            .map(|set| set.region)
    }

    pub fn clear(&mut self) {
        self.sets.clear();
        self.available = 0;
    }
}

impl Default for FreeObjectList {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocation front-end of one sparse space: bump allocation over the
/// youngest region plus the free-object index across all owned regions.
pub struct FreeListAllocator {
    list: FreeObjectList,
    bump_top: usize,
    bump_end: usize,
    bump_region: Option<RegionId>,
    allocated: usize,
}

impl FreeListAllocator {
    pub fn new() -> Self {
        Self {
            list: FreeObjectList::new(),
            bump_top: 0,
            bump_end: 0,
            bump_region: None,
            allocated: 0,
        }
    }

    /// Returns the start of a fresh, pairwise-disjoint range of at least
    /// `size` bytes, or `None` when the space holds no fitting gap.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        let size = align_up(size, ALLOC_ALIGN);
        if let Some(address) = self.list.allocate(size) {
            self.allocated += size;
            return Some(address);
        }
        if self.bump_top + size <= self.bump_end {
            let address = self.bump_top;
            self.bump_top += size;
            self.allocated += size;
            return Some(address);
        }
        None
    }

    pub fn free(&mut self, region: RegionId, address: usize, size: usize) {
        if size >= MIN_FREE_ENTRY {
            self.list.free(region, address, size);
        }
    }

    /// Installs `region` as the bump window. The previous window's leftover
    /// is abandoned; it is unmarked memory and the next sweep reclaims it.
    pub fn add_free(&mut self, region: &Region) {
        self.fill_bump_pointer();
        self.bump_top = region.begin();
        self.bump_end = region.end();
        self.bump_region = Some(region.id());
    }

    /// Retires the current bump window without recycling the leftover.
    pub fn fill_bump_pointer(&mut self) {
        self.bump_top = 0;
        self.bump_end = 0;
        self.bump_region = None;
    }

    /// Converts the remaining bump range into an ordinary free entry, then
    /// retires the window. Used when a space's regions are merged away and
    /// the in-flight range must stay allocatable.
    pub fn free_bump_point(&mut self) {
        if let Some(region) = self.bump_region {
            let remaining = self.bump_end - self.bump_top;
            if remaining > 0 {
                self.free(region, self.bump_top, remaining);
            }
        }
        self.fill_bump_pointer();
    }

    /// Drops every free entry and the bump window; the space has no free
    /// capacity until sweeping produces some.
    pub fn rebuild_free_list(&mut self) {
        self.list.clear();
        self.fill_bump_pointer();
    }

    /// Feeds the free-object set parked on `region` into the index.
    pub fn collect_free_object_set(&mut self, region: &Region) {
        if let Some(set) = region.take_free_set() {
            self.list.add_set(set);
        }
    }

    /// Removes `region`'s entries from the index and parks them on the
    /// region for its next owner.
    pub fn detach_free_object_set(&mut self, region: &Region) {
        if self.bump_region == Some(region.id()) {
            self.fill_bump_pointer();
        }
        if let Some(set) = self.list.take_set(region.id()) {
            region.stash_free_set(set);
        }
    }

    pub fn match_free_object_set(&self, region: &Region, size: usize) -> bool {
        region.free_set_can_satisfy(align_up(size, ALLOC_ALIGN))
    }

    /// Which owned region could satisfy `size` from its indexed entries.
    pub fn lookup_suitable_free_region(&self, size: usize) -> Option<RegionId> {
        self.list.lookup_suitable(align_up(size, ALLOC_ALIGN))
    }

    #[inline]
    pub fn allocated_size(&self) -> usize {
        self.allocated
    }

    pub fn available(&self) -> usize {
        self.list.available() + (self.bump_end - self.bump_top)
    }
}

impl Default for FreeListAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mmap::Mmap, SpaceKind};

    fn test_region(id: u32, size: usize) -> Region {
        Region::new(
            RegionId(id),
            SpaceKind::Old,
            Mmap::new(size, size),
            size,
        )
    }

    #[test]
    fn list_splits_large_entries() {
        let mut list = FreeObjectList::new();
        list.free(RegionId(0), 0x1000, 256);

        let addr = list.allocate(64).unwrap();
        assert_eq!(addr, 0x1000);
        assert_eq!(list.available(), 192);

        // The tail entry is reusable.
        assert_eq!(list.allocate(192), Some(0x1040));
        assert_eq!(list.available(), 0);
    }

    #[test]
    fn list_keeps_small_tails_with_allocation() {
        let mut list = FreeObjectList::new();
        list.free(RegionId(0), 0x1000, 80);

        // 80 - 64 = 16 < MIN_FREE_ENTRY, so the tail is not reindexed.
        assert_eq!(list.allocate(64), Some(0x1000));
        assert_eq!(list.available(), 0);
        assert_eq!(list.allocate(16), None);
    }

    #[test]
    fn bump_allocation_is_disjoint() {
        let region = test_region(1, 4096);
        let mut allocator = FreeListAllocator::new();
        allocator.add_free(&region);

        let a = allocator.allocate(48).unwrap();
        let b = allocator.allocate(48).unwrap();
        assert_eq!(a, region.begin());
        assert_eq!(b, a + 48);
        assert_eq!(allocator.allocated_size(), 96);
    }

    #[test]
    fn free_bump_point_recycles_leftover() {
        let region = test_region(2, 4096);
        let mut allocator = FreeListAllocator::new();
        allocator.add_free(&region);
        allocator.allocate(1024).unwrap();

        allocator.free_bump_point();
        assert_eq!(allocator.available(), 4096 - 1024);
        // The recycled range is immediately allocatable through the index.
        assert_eq!(allocator.allocate(2048), Some(region.begin() + 1024));
    }

    #[test]
    fn detach_and_collect_round_trip() {
        let region = test_region(3, 4096);
        let mut set = FreeObjectSet::new(region.id());
        set.add(FreeObject {
            address: region.begin(),
            size: 512,
        });
        region.stash_free_set(set);

        let mut allocator = FreeListAllocator::new();
        allocator.collect_free_object_set(&region);
        assert_eq!(allocator.available(), 512);

        allocator.detach_free_object_set(&region);
        assert_eq!(allocator.available(), 0);
        assert!(region.free_set_can_satisfy(512));
        assert!(!region.free_set_can_satisfy(513));
    }

    #[test]
    fn lookup_reports_the_owning_region() {
        let mut allocator = FreeListAllocator::new();
        allocator.free(RegionId(7), 0x2000, 128);
        allocator.free(RegionId(9), 0x9000, 1024);

        assert_eq!(
            allocator.lookup_suitable_free_region(512),
            Some(RegionId(9))
        );
        assert_eq!(allocator.lookup_suitable_free_region(4096), None);
    }
}
