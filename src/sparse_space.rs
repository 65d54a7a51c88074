//! The sparse space core: an ordered set of regions, a free-list allocator,
//! and the sweep state machine shared by every region-based space.

use std::sync::{atomic::AtomicUsize, Arc};

use atomic::{Atomic, Ordering};
use parking_lot::Mutex;

use crate::{
    align_up,
    free_list::{FreeListAllocator, FreeObjectSet, MIN_FREE_ENTRY},
    heap::{GcKind, HeapContext},
    provider::RegionProvider,
    region::Region,
    sweeper::ConcurrentSweeper,
    Config, SpaceKind, ALLOC_ALIGN,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweepState {
    NoSweep,
    Sweeping,
    Swept,
}

/// A non-contiguous allocation arena composed of zero or more regions.
///
/// All cross-thread handoff goes through two queues: `sweeping_list` holds
/// regions waiting to be swept (sorted once, before any sweep task starts),
/// and the swept channel carries regions whose free-object index is ready to
/// be fed back into the allocator. A region popped from `sweeping_list` is
/// owned by that thread until it reappears on the swept channel; no two
/// threads ever touch the same region's free index concurrently.
pub struct SparseSpace {
    kind: SpaceKind,
    pub(crate) provider: Arc<RegionProvider>,
    pub(crate) sweeper: Arc<ConcurrentSweeper>,
    pub(crate) heap: Arc<dyn HeapContext>,
    pub(crate) regions: Mutex<Vec<Arc<Region>>>,
    pub(crate) allocator: Mutex<FreeListAllocator>,
    pub(crate) sweep_state: Atomic<SweepState>,
    sweeping_list: Mutex<Vec<Arc<Region>>>,
    swept_tx: flume::Sender<Arc<Region>>,
    pub(crate) swept_rx: flume::Receiver<Arc<Region>>,
    live_object_size: AtomicUsize,
    allocated_since_sweep: AtomicUsize,
    pub(crate) committed: AtomicUsize,
    maximum_capacity: usize,
    overshoot: AtomicUsize,
    pub(crate) verbose: bool,
}

impl SparseSpace {
    pub fn new(
        kind: SpaceKind,
        maximum_capacity: usize,
        provider: Arc<RegionProvider>,
        sweeper: Arc<ConcurrentSweeper>,
        heap: Arc<dyn HeapContext>,
        verbose: bool,
    ) -> Arc<Self> {
        let (swept_tx, swept_rx) = flume::unbounded();
        Arc::new(Self {
            kind,
            provider,
            sweeper,
            heap,
            regions: Mutex::new(Vec::new()),
            allocator: Mutex::new(FreeListAllocator::new()),
            sweep_state: Atomic::new(SweepState::NoSweep),
            sweeping_list: Mutex::new(Vec::new()),
            swept_tx,
            swept_rx,
            live_object_size: AtomicUsize::new(0),
            allocated_since_sweep: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            maximum_capacity,
            overshoot: AtomicUsize::new(0),
            verbose,
        })
    }

    #[inline]
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[inline]
    pub fn sweep_state(&self) -> SweepState {
        self.sweep_state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn committed_size(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn maximum_capacity(&self) -> usize {
        self.maximum_capacity
    }

    #[inline]
    pub fn overshoot(&self) -> usize {
        self.overshoot.load(Ordering::Relaxed)
    }

    pub fn increase_overshoot(&self, bytes: usize) {
        self.overshoot
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// Live bytes as of the last completed sweep pass. Drifts below the true
    /// value between sweeps; bump fills are only counted at the next pass.
    #[inline]
    pub fn live_object_size(&self) -> usize {
        self.live_object_size
            .load(Ordering::Relaxed)
    }

    pub(crate) fn increase_live(&self, bytes: usize) {
        self.live_object_size
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn decrease_live(&self, bytes: usize) {
        self.live_object_size
            .fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Live bytes plus everything allocated since the last sweep pass.
    pub fn heap_object_size(&self) -> usize {
        self.live_object_size()
            + self
                .allocated_since_sweep
                .load(Ordering::Relaxed)
    }

    /// Cumulative bytes handed out by the allocator.
    pub fn total_allocated_size(&self) -> usize {
        self.allocator.lock().allocated_size()
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn enumerate_regions(&self, mut f: impl FnMut(&Arc<Region>)) {
        for region in self.regions.lock().iter() {
            f(region);
        }
    }

    pub(crate) fn region_by_id(&self, id: crate::region::RegionId) -> Option<Arc<Region>> {
        self.regions.lock().iter().find(|r| r.id() == id).cloned()
    }

    fn note_allocation(&self, size: usize) {
        self.allocated_since_sweep
            .fetch_add(size, Ordering::Relaxed);
    }

    /// Allocates `size` bytes, or returns `None` once every fallback is
    /// exhausted. `None` is the only OOM signal this layer produces; turning
    /// it into an error is the caller's business.
    pub fn allocate(&self, size: usize, allow_gc: bool) -> Option<usize> {
        let size = align_up(size, ALLOC_ALIGN);
        if let Some(address) = self.allocator.lock().allocate(size) {
            self.note_allocation(size);
            return Some(address);
        }
        if self.sweep_state() == SweepState::Sweeping {
            if let Some(address) = self.allocate_after_sweeping_completed(size) {
                self.note_allocation(size);
                return Some(address);
            }
        }
        if allow_gc {
            self.heap.check_and_trigger_old_gc();
        }
        if self.expand() {
            if let Some(address) = self.allocator.lock().allocate(size) {
                self.note_allocation(size);
                return Some(address);
            }
        }
        if allow_gc {
            self.heap.collect_garbage(GcKind::Full);
            // The recursion cannot trigger another collection.
            return self.allocate(size, false);
        }
        None
    }

    /// Grows the space by one region. Refuses past the capacity ceiling plus
    /// the current overshoot allowance.
    pub fn expand(&self) -> bool {
        if self.committed_size() >= self.maximum_capacity + self.overshoot() {
            return false;
        }
        let region = self.provider.allocate_aligned_region(self.kind);
        self.committed
            .fetch_add(region.size(), Ordering::Relaxed);
        self.allocator.lock().add_free(&region);
        self.regions.lock().push(region);
        true
    }

    /// Registers an already-owned region (transfer or promotion buffer) with
    /// this space, moving its alive-byte contribution and parked free index.
    pub(crate) fn attach_region(&self, region: Arc<Region>) {
        region.set_kind(self.kind);
        self.committed
            .fetch_add(region.size(), Ordering::Relaxed);
        self.increase_live(region.alive_bytes());
        self.allocator.lock().collect_free_object_set(&region);
        self.regions.lock().push(region);
    }

    /// Removes `region` from this space. Its free-object index is parked on
    /// the region for the next owner; its alive bytes leave the counter.
    pub(crate) fn detach_region(&self, region: &Arc<Region>) -> bool {
        {
            let mut regions = self.regions.lock();
            match regions.iter().position(|r| r.id() == region.id()) {
                Some(at) => {
                    regions.remove(at);
                }
                None => return false,
            }
        }
        self.committed
            .fetch_sub(region.size(), Ordering::Relaxed);
        self.decrease_live(region.alive_bytes());
        self.allocator.lock().detach_free_object_set(region);
        true
    }

    /// Space-wide teardown: every region goes back to the provider and all
    /// accounting is zeroed. Not a per-cycle reset.
    pub fn reset(&self) {
        self.allocator.lock().rebuild_free_list();
        self.sweeping_list.lock().clear();
        while self.swept_rx.try_recv().is_ok() {}
        for region in self.regions.lock().drain(..) {
            self.provider.free_region(region);
        }
        self.committed.store(0, Ordering::Relaxed);
        self.live_object_size
            .store(0, Ordering::Relaxed);
        self.allocated_since_sweep
            .store(0, Ordering::Relaxed);
        self.overshoot.store(0, Ordering::Relaxed);
        self.sweep_state.store(SweepState::NoSweep, Ordering::Release);
    }

    // --- sweep state machine ---

    /// Synchronous entry of a sweep pass. Recomputes exact live accounting,
    /// snapshots remembered sets, queues every region, and empties the
    /// allocator; runs before any sweep task is posted.
    pub fn prepare_sweeping(&self) {
        debug_assert_ne!(self.sweep_state(), SweepState::Sweeping);
        self.live_object_size
            .store(0, Ordering::Relaxed);
        self.allocated_since_sweep
            .store(0, Ordering::Relaxed);

        let mut list = self.sweeping_list.lock();
        debug_assert!(list.is_empty());
        for region in self.regions.lock().iter() {
            if region.is_in_cset() {
                continue;
            }
            let alive = region.update_alive_bytes();
            self.increase_live(alive);
            region.reset_wasted();
            region.set_swept(false);
            region.rset().snapshot();
            list.push(region.clone());
        }
        // Most-alive regions first: tasks pop from the back, so the emptiest
        // regions are swept, and reusable, first.
        list.sort_unstable_by(|a, b| b.alive_bytes().cmp(&a.alive_bytes()));
        drop(list);

        self.allocator.lock().rebuild_free_list();
        self.sweep_state.store(SweepState::Sweeping, Ordering::Release);
    }

    /// Sweeps one queued region, if any; returns whether it did. Background
    /// tasks publish the result on the swept channel; the mutator path merges
    /// it straight into the allocator.
    pub fn async_sweep(&self, is_main: bool) -> bool {
        let region = self.sweeping_list.lock().pop();
        let region = match region {
            Some(region) => region,
            None => return false,
        };
        let set = self.free_region(&region);
        if is_main {
            region.set_swept(true);
            region.stash_free_set(set);
            self.allocator.lock().collect_free_object_set(&region);
        } else {
            region.stash_free_set(set);
            // The receiver half lives as long as the space; send cannot fail.
            let _ = self.swept_tx.send(region);
        }
        true
    }

    /// Drains the swept channel into the allocator. Returns whether any
    /// region was filled in.
    pub fn try_fill_swept_region(&self) -> bool {
        let mut filled = false;
        while let Ok(region) = self.swept_rx.try_recv() {
            region.set_swept(true);
            self.allocator.lock().collect_free_object_set(&region);
            filled = true;
        }
        filled
    }

    /// Final catch-up drain; unconditionally ends the pass.
    pub fn finish_fill_swept_region(&self) -> bool {
        let filled = self.try_fill_swept_region();
        self.sweep_state.store(SweepState::Swept, Ordering::Release);
        filled
    }

    /// The only blocking point of the protocol: drain opportunistically, and
    /// if that does not cover `size`, wait for every outstanding sweep task
    /// of this space, finish the pass, and allocate from whatever it freed.
    fn allocate_after_sweeping_completed(&self, size: usize) -> Option<usize> {
        debug_assert_eq!(self.sweep_state(), SweepState::Sweeping);
        if self.try_fill_swept_region() {
            if let Some(address) = self.allocator.lock().allocate(size) {
                return Some(address);
            }
        }
        self.sweeper.ensure_task_finished(self.kind);
        self.finish_fill_swept_region();
        self.allocator.lock().allocate(size)
    }

    /// Fully synchronous sweep, used when concurrent sweeping is disabled.
    /// Performs the same per-region reclamation as the async path but runs
    /// to completion on the calling thread; the space never enters the
    /// `Sweeping` state.
    pub fn sweep(&self) {
        self.live_object_size
            .store(0, Ordering::Relaxed);
        self.allocated_since_sweep
            .store(0, Ordering::Relaxed);
        self.allocator.lock().rebuild_free_list();

        let regions: Vec<_> = self.regions.lock().clone();
        for region in regions {
            if region.is_in_cset() {
                continue;
            }
            self.increase_live(region.update_alive_bytes());
            region.reset_wasted();
            region.rset().snapshot();
            let set = self.free_region(&region);
            region.set_swept(true);
            region.stash_free_set(set);
            self.allocator.lock().collect_free_object_set(&region);
        }
        self.sweep_state.store(SweepState::Swept, Ordering::Release);
    }

    /// Coalesces the gaps between live objects of one region into a
    /// free-object set. Cannot fail: a fully dead region yields its whole
    /// extent, a fully live one yields nothing.
    fn free_region(&self, region: &Region) -> FreeObjectSet {
        let mut set = FreeObjectSet::new(region.id());
        let mut cursor = region.begin();
        region.visit_live_ranges(|start, end| {
            self.free_live_range(region, cursor, start, &mut set);
            cursor = end;
        });
        self.free_live_range(region, cursor, region.end(), &mut set);
        set
    }

    fn free_live_range(
        &self,
        region: &Region,
        begin: usize,
        end: usize,
        set: &mut FreeObjectSet,
    ) {
        if end <= begin {
            return;
        }
        region.rset().clear_range(begin, end);
        let size = end - begin;
        if size < MIN_FREE_ENTRY {
            region.increase_wasted(size);
            return;
        }
        set.add(crate::free_list::FreeObject {
            address: begin,
            size,
        });
    }
}

impl std::fmt::Debug for SparseSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} regions, committed {}, live {}",
            self.kind.name(),
            self.region_count(),
            crate::formatted_size(self.committed_size()),
            crate::formatted_size(self.live_object_size())
        )
    }
}

/// Sparse space for objects the collector must never move. Same protocol,
/// never part of a collection set.
pub struct NonMovableSpace {
    space: Arc<SparseSpace>,
}

impl NonMovableSpace {
    pub fn new(
        config: &Config,
        provider: Arc<RegionProvider>,
        sweeper: Arc<ConcurrentSweeper>,
        heap: Arc<dyn HeapContext>,
    ) -> Self {
        Self {
            space: SparseSpace::new(
                SpaceKind::NonMovable,
                config.nonmovable_capacity,
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
}

impl std::ops::Deref for NonMovableSpace {
    type Target = SparseSpace;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.space
    }
}

/// Sparse space holding the spawn-time heap snapshot. Allocation never
/// triggers a collection; the snapshot is written once and then shared.
pub struct SnapshotSpace {
    space: Arc<SparseSpace>,
}

impl SnapshotSpace {
    pub fn new(
        config: &Config,
        provider: Arc<RegionProvider>,
        sweeper: Arc<ConcurrentSweeper>,
        heap: Arc<dyn HeapContext>,
    ) -> Self {
        Self {
            space: SparseSpace::new(
                SpaceKind::Snapshot,
                config.snapshot_capacity,
                provider,
                sweeper,
                heap,
                config.verbose,
            ),
        }
    }

    pub fn allocate(&self, size: usize) -> Option<usize> {
        self.space.allocate(size, false)
    }

    pub fn inner(&self) -> &Arc<SparseSpace> {
        &self.space
    }
}

impl std::ops::Deref for SnapshotSpace {
    type Target = SparseSpace;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.space
    }
}
