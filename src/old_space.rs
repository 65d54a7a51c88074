//! Old space: cross-space region transfer and partial-collection region
//! selection, layered on the sparse space core.

use std::sync::{atomic::AtomicUsize, Arc};

use atomic::Ordering;
use parking_lot::Mutex;

use crate::{
    align_up, formatted_size,
    heap::HeapContext,
    provider::RegionProvider,
    region::Region,
    sparse_space::{SparseSpace, SweepState},
    sweeper::ConcurrentSweeper,
    Config, SpaceKind, ALLOC_ALIGN,
};

/// Knobs of the collection-set selection walk.
#[derive(Clone, Copy, Debug)]
pub struct CsetPolicy {
    /// Regions at or above this alive fraction are not worth evacuating.
    pub mostly_alive_rate: f64,
    /// Candidate count below which no selection happens, and the floor the
    /// budget walk is clamped up to. The floor may push the selection past
    /// the nominal budget when the candidate list is short.
    pub min_regions: usize,
    /// Alive-byte budget the walk accumulates against.
    pub evacuate_budget: usize,
}

impl CsetPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mostly_alive_rate: config.mostly_alive_rate,
            min_regions: config.min_cset_regions,
            evacuate_budget: config.evacuate_budget,
        }
    }
}

/// The tenured space. Adds region borrowing for promotion, merging of a
/// local space's regions, and the select/revert/reclaim protocol around the
/// collection set.
pub struct OldSpace {
    space: Arc<SparseSpace>,
    cset: Mutex<Vec<Arc<Region>>>,
    policy: CsetPolicy,
    merge_size: AtomicUsize,
}

impl OldSpace {
    pub fn new(
        config: &Config,
        provider: Arc<RegionProvider>,
        sweeper: Arc<ConcurrentSweeper>,
        heap: Arc<dyn HeapContext>,
    ) -> Self {
        Self {
            space: SparseSpace::new(
                SpaceKind::Old,
                config.old_space_capacity,
                provider,
                sweeper,
                heap,
                config.verbose,
            ),
            cset: Mutex::new(Vec::new()),
            policy: CsetPolicy::from_config(config),
            merge_size: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<SparseSpace> {
        &self.space
    }

    /// Detaches a whole region whose free index can satisfy `size` and hands
    /// it to the caller as a newly-owned unit. Promotion uses this to get a
    /// region of its own instead of a sub-range.
    pub fn try_to_get_exclusive_region(&self, size: usize) -> Option<Arc<Region>> {
        let size = align_up(size, ALLOC_ALIGN);
        {
            let suitable = self.space.allocator.lock().lookup_suitable_free_region(size);
            if let Some(id) = suitable {
                if let Some(region) = self.space.region_by_id(id) {
                    self.space.detach_region(&region);
                    return Some(region);
                }
            }
        }
        if self.space.sweep_state() == SweepState::Sweeping {
            // Regions already swept but not yet filled into the allocator may
            // hold a fit. Everything else drained here is filled in as usual.
            let mut found = None;
            while let Ok(region) = self.space.swept_rx.try_recv() {
                region.set_swept(true);
                if found.is_none() && region.free_set_can_satisfy(size) {
                    self.space.detach_region(&region);
                    found = Some(region);
                } else {
                    self.space.allocator.lock().collect_free_object_set(&region);
                }
            }
            return found;
        }
        None
    }

    /// Adopts every region of a transient local space. The local space ends
    /// up empty; its live bytes and committed size move here. Exceeding the
    /// ceiling does not fail the merge: the overshoot allowance grows by the
    /// excess and the OOM decision is left to the external heap.
    pub fn merge(&self, local: &LocalSpace) {
        local.inner().allocator.lock().free_bump_point();

        let regions: Vec<_> = local.inner().regions.lock().drain(..).collect();
        for region in regions {
            local
                .inner()
                .committed
                .fetch_sub(region.size(), Ordering::Relaxed);
            local.inner().decrease_live(region.alive_bytes());
            local.inner().allocator.lock().detach_free_object_set(&region);
            self.merge_size
                .fetch_add(region.size(), Ordering::Relaxed);
            self.space.attach_region(region);
        }

        let ceiling = self.space.maximum_capacity() + self.space.overshoot();
        let committed =
            self.space.committed_size() + self.space.heap.huge_object_committed_size();
        if committed > ceiling {
            let excess = committed - ceiling;
            if self.space.verbose {
                eprintln!(
                    "[gc] old space merge overcommitted by {}",
                    formatted_size(excess)
                );
            }
            self.space.heap.should_throw_oom_error(true);
            self.space.increase_overshoot(excess);
        }
    }

    /// Committed bytes adopted by merges since the last reset; the external
    /// heap reports this in its OOM message.
    pub fn merge_size(&self) -> usize {
        self.merge_size.load(Ordering::Relaxed)
    }

    pub fn reset_merge_size(&self) {
        self.merge_size.store(0, Ordering::Relaxed);
    }

    fn mostly_alive_threshold(&self, region: &Region) -> usize {
        (region.size() as f64 * self.policy.mostly_alive_rate) as usize
    }

    /// Picks the regions worth evacuating in the next partial collection.
    /// Only runs on a fully swept space; on success the selected regions are
    /// detached, flagged, and the sweep state returns to `NoSweep` so the
    /// next cycle sweeps the remaining regions from scratch.
    pub fn select_cset(&self) {
        if self.space.sweep_state() != SweepState::Swept {
            return;
        }

        let mut candidates: Vec<Arc<Region>> = Vec::new();
        self.space.enumerate_regions(|region| {
            if region.alive_bytes() < self.mostly_alive_threshold(region) {
                candidates.push(region.clone());
            }
        });
        // Too little reclaimable material to pay for a partial collection.
        if candidates.len() < self.policy.min_regions {
            return;
        }

        candidates.sort_unstable_by_key(|r| r.alive_bytes());

        let mut budget = self.policy.evacuate_budget;
        let mut selected = 0;
        for region in &candidates {
            let alive = region.alive_bytes();
            if alive > budget {
                break;
            }
            budget -= alive;
            selected += 1;
        }
        let selected = selected.max(self.policy.min_regions).min(candidates.len());
        candidates.truncate(selected);

        let mut cset = self.cset.lock();
        debug_assert!(cset.is_empty());
        let mut alive_total = 0;
        for region in candidates {
            self.space.detach_region(&region);
            region.set_in_cset(true);
            alive_total += region.alive_bytes();
            cset.push(region);
        }
        if self.space.verbose {
            eprintln!(
                "[gc] old space cset: {} regions, {} alive to evacuate",
                cset.len(),
                formatted_size(alive_total)
            );
        }
        self.space
            .sweep_state
            .store(SweepState::NoSweep, Ordering::Release);
    }

    /// The regions currently selected for evacuation, in selection order.
    pub fn collect_set(&self) -> Vec<Arc<Region>> {
        self.cset.lock().clone()
    }

    pub fn cset_len(&self) -> usize {
        self.cset.lock().len()
    }

    /// Aborts an in-flight partial collection: every selected region is
    /// re-attached exactly as it was detached.
    pub fn revert_cset(&self) {
        let regions: Vec<_> = self.cset.lock().drain(..).collect();
        for region in regions {
            region.set_in_cset(false);
            self.space.attach_region(region);
        }
    }

    /// Called after the evacuator has copied every live object out of the
    /// selected regions: their GC bookkeeping dies and the raw memory goes
    /// back to the provider.
    pub fn reclaim_cset(&self) {
        let regions: Vec<_> = self.cset.lock().drain(..).collect();
        for region in regions {
            region.rset().clear_all();
            region.clear_marks();
            region.take_free_set();
            region.set_in_cset(false);
            self.space.provider.free_region(region);
        }
    }
}

impl std::ops::Deref for OldSpace {
    type Target = SparseSpace;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.space
    }
}

/// A transient space buffering promoted objects until its regions are merged
/// into the old space. Never swept; disposable after the merge.
pub struct LocalSpace {
    space: Arc<SparseSpace>,
}

impl LocalSpace {
    pub fn new(
        config: &Config,
        provider: Arc<RegionProvider>,
        sweeper: Arc<ConcurrentSweeper>,
        heap: Arc<dyn HeapContext>,
    ) -> Self {
        Self {
            space: SparseSpace::new(
                SpaceKind::Local,
                config.local_capacity,
                provider,
                sweeper,
                heap,
                config.verbose,
            ),
        }
    }

    pub fn inner(&self) -> &Arc<SparseSpace> {
        &self.space
    }

    /// Promotion never triggers a collection from inside the local space.
    pub fn allocate(&self, size: usize) -> Option<usize> {
        self.space.allocate(size, false)
    }

    /// Adopts a region obtained elsewhere, typically through
    /// [`OldSpace::try_to_get_exclusive_region`].
    pub fn add_region(&self, region: Arc<Region>) {
        self.space.attach_region(region);
    }
}

impl std::ops::Deref for LocalSpace {
    type Target = SparseSpace;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.space
    }
}
