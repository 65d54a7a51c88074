//! The surface through which spaces reach the rest of the collector.
//!
//! Spaces never own the GC policy: when allocation pressure builds they ask
//! the embedding heap to consider a collection, and when a merge overcommits
//! they flag the pending OOM and let the heap decide whether it becomes a
//! user-visible error.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcKind {
    /// Trace and sweep the whole heap.
    Full,
    /// Evacuate only the current collection set.
    Partial,
}

/// Collector-driver callbacks, constructor-injected into every space.
pub trait HeapContext: Send + Sync {
    /// Opportunistic check; the heap may or may not start a collection.
    fn check_and_trigger_old_gc(&self);

    /// Synchronous collection request. On return the heap has finished
    /// whatever reclamation it was willing to do.
    fn collect_garbage(&self, kind: GcKind);

    /// Records that an operation overcommitted and an OOM error should be
    /// raised once it is safe to allocate the error object.
    fn should_throw_oom_error(&self, pending: bool);

    /// Committed bytes of the huge-object space, counted against the old
    /// space ceiling during merges.
    fn huge_object_committed_size(&self) -> usize;
}
