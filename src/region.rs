//! Heap regions: fixed-size, aligned slabs and their GC bookkeeping.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use atomic::Atomic;
use parking_lot::Mutex;

use crate::{align_up, free_list::FreeObjectSet, mmap::Mmap, SpaceKind, ALLOC_ALIGN};

/// Identity of a region, stable across ownership transfers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RegionId(pub u32);

const WORD_BITS: usize = usize::BITS as usize;

/// One bit per [`ALLOC_ALIGN`] granule. The external marker sets bits for
/// every granule a live object covers; sweep walks the gaps between runs of
/// set bits.
pub struct MarkBitmap {
    begin: usize,
    bits: usize,
    words: Box<[AtomicUsize]>,
}

impl MarkBitmap {
    pub fn new(begin: usize, extent: usize) -> Self {
        let bits = extent / ALLOC_ALIGN;
        let words = (0..(bits + WORD_BITS - 1) / WORD_BITS)
            .map(|_| AtomicUsize::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { begin, bits, words }
    }

    #[inline]
    fn bit_of(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.begin);
        (addr - self.begin) / ALLOC_ALIGN
    }

    #[inline]
    fn test_bit(&self, bit: usize) -> bool {
        self.words[bit / WORD_BITS].load(Ordering::Relaxed) & (1 << (bit % WORD_BITS)) != 0
    }

    /// Mark `size` bytes at `addr` live. May be called from several marker
    /// threads at once.
    pub fn mark(&self, addr: usize, size: usize) {
        let first = self.bit_of(addr);
        let count = align_up(size, ALLOC_ALIGN) / ALLOC_ALIGN;
        for bit in first..(first + count).min(self.bits) {
            self.words[bit / WORD_BITS].fetch_or(1 << (bit % WORD_BITS), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn test(&self, addr: usize) -> bool {
        self.test_bit(self.bit_of(addr))
    }

    /// Bytes covered by marked granules.
    pub fn live_bytes(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum::<usize>()
            * ALLOC_ALIGN
    }

    /// Calls `f(start, end)` for every maximal run of marked granules, in
    /// address order.
    pub fn visit_live_ranges(&self, mut f: impl FnMut(usize, usize)) {
        let mut bit = 0;
        while bit < self.bits {
            if self.test_bit(bit) {
                let run = bit;
                while bit < self.bits && self.test_bit(bit) {
                    bit += 1;
                }
                f(
                    self.begin + run * ALLOC_ALIGN,
                    self.begin + bit * ALLOC_ALIGN,
                );
            } else {
                bit += 1;
            }
        }
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }
}

/// Cross-region reference slots recorded by the embedder's write barrier.
///
/// Sweeping must not race with the mutator recording new slots, so a sweep
/// pass works off a snapshot taken while the world is stopped in
/// `prepare_sweeping`.
pub struct RememberedSet {
    slots: Mutex<Vec<usize>>,
    frozen: Mutex<Vec<usize>>,
}

impl RememberedSet {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            frozen: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, slot: usize) {
        self.slots.lock().push(slot);
    }

    /// Freezes the current slot set for concurrent readers.
    pub fn snapshot(&self) {
        *self.frozen.lock() = self.slots.lock().clone();
    }

    pub fn frozen_slots(&self) -> Vec<usize> {
        self.frozen.lock().clone()
    }

    /// Drops every recorded slot inside `[begin, end)`; the range has been
    /// reclaimed and its slots can no longer hold references.
    pub fn clear_range(&self, begin: usize, end: usize) {
        self.frozen.lock().retain(|&s| s < begin || s >= end);
        self.slots.lock().retain(|&s| s < begin || s >= end);
    }

    pub fn clear_all(&self) {
        self.frozen.lock().clear();
        self.slots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl Default for RememberedSet {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-size, aligned slab of heap memory. Owned by exactly one space at
/// a time; transfers go through detach/attach on the owning spaces so the
/// alive-byte contribution moves with the region.
pub struct Region {
    id: RegionId,
    kind: Atomic<SpaceKind>,
    map: Mmap,
    begin: usize,
    end: usize,
    alive_bytes: AtomicUsize,
    wasted: AtomicUsize,
    in_cset: AtomicBool,
    swept: AtomicBool,
    mark_bits: MarkBitmap,
    rset: RememberedSet,
    // Free-object index parked here while the region is in transit between
    // spaces or waiting in the swept queue.
    free_set: Mutex<Option<FreeObjectSet>>,
}

impl Region {
    pub fn new(id: RegionId, kind: SpaceKind, map: Mmap, size: usize) -> Self {
        let begin = map.aligned_start() as usize;
        let end = begin + size;
        Self {
            id,
            kind: Atomic::new(kind),
            map,
            begin,
            end,
            alive_bytes: AtomicUsize::new(0),
            wasted: AtomicUsize::new(0),
            in_cset: AtomicBool::new(false),
            swept: AtomicBool::new(false),
            mark_bits: MarkBitmap::new(begin, size),
            rset: RememberedSet::new(),
            free_set: Mutex::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> RegionId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> SpaceKind {
        self.kind.load(atomic::Ordering::Relaxed)
    }

    #[inline]
    pub fn set_kind(&self, kind: SpaceKind) {
        self.kind.store(kind, atomic::Ordering::Relaxed);
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn in_range(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }

    /// Marker entry point: record `size` live bytes at `addr`.
    pub fn mark_live(&self, addr: usize, size: usize) {
        debug_assert!(self.in_range(addr));
        self.mark_bits.mark(addr, size);
    }

    /// Recomputes the alive-byte count from the mark bitmap and stores it.
    pub fn update_alive_bytes(&self) -> usize {
        let alive = self.mark_bits.live_bytes();
        self.alive_bytes.store(alive, Ordering::Relaxed);
        alive
    }

    #[inline]
    pub fn alive_bytes(&self) -> usize {
        self.alive_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn wasted(&self) -> usize {
        self.wasted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn increase_wasted(&self, bytes: usize) {
        self.wasted.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn reset_wasted(&self) {
        self.wasted.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_in_cset(&self) -> bool {
        self.in_cset.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_in_cset(&self, value: bool) {
        self.in_cset.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_swept(&self) -> bool {
        self.swept.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_swept(&self, value: bool) {
        self.swept.store(value, Ordering::Release);
    }

    pub fn visit_live_ranges(&self, f: impl FnMut(usize, usize)) {
        self.mark_bits.visit_live_ranges(f);
    }

    pub fn clear_marks(&self) {
        self.mark_bits.clear();
    }

    pub fn rset(&self) -> &RememberedSet {
        &self.rset
    }

    pub fn stash_free_set(&self, set: FreeObjectSet) {
        debug_assert_eq!(set.region(), self.id);
        *self.free_set.lock() = Some(set);
    }

    pub fn take_free_set(&self) -> Option<FreeObjectSet> {
        self.free_set.lock().take()
    }

    pub fn free_set_can_satisfy(&self, size: usize) -> bool {
        self.free_set
            .lock()
            .as_ref()
            .map_or(false, |set| set.can_satisfy(size))
    }

    /// Tears the region down to its raw mapping for recycling.
    pub fn into_map(self) -> Mmap {
        self.map
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Region({:?} {:#x}->{:#x} alive {} wasted {})",
            self.id,
            self.begin,
            self.end,
            self.alive_bytes(),
            self.wasted()
        )
    }
}
