//! Region provider: hands out freshly mapped, aligned regions and recycles
//! the mappings of reclaimed ones.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    mmap::Mmap,
    region::{Region, RegionId},
    SpaceKind,
};

pub struct RegionProvider {
    region_size: usize,
    pool: Mutex<Vec<Mmap>>,
    pool_capacity: usize,
    next_id: AtomicU32,
}

impl RegionProvider {
    pub fn new(region_size: usize, pool_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            region_size,
            pool: Mutex::new(Vec::new()),
            pool_capacity,
            next_id: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// A fresh region for `kind`, aligned to the region size. Reuses a pooled
    /// mapping when one is available.
    pub fn allocate_aligned_region(&self, kind: SpaceKind) -> Arc<Region> {
        let map = self
            .pool
            .lock()
            .pop()
            .unwrap_or_else(|| Mmap::new(self.region_size, self.region_size));
        let id = RegionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(Region::new(id, kind, map, self.region_size))
    }

    /// Returns a region's memory. The caller must hold the only handle; the
    /// region's bookkeeping dies with it, the mapping may be reused.
    pub fn free_region(&self, region: Arc<Region>) {
        match Arc::try_unwrap(region) {
            Ok(region) => {
                let map = region.into_map();
                let mut pool = self.pool.lock();
                if pool.len() < self.pool_capacity {
                    map.dontneed(map.aligned_start(), self.region_size);
                    pool.push(map);
                }
            }
            Err(region) => {
                debug_assert!(false, "freed region still shared: {:?}", region.id());
            }
        }
    }

    pub fn pooled(&self) -> usize {
        self.pool.lock().len()
    }
}
