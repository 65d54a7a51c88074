//! Background sweep workers and the blocking "finish outstanding work"
//! operation the mutator relies on for forward progress.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::{sparse_space::SparseSpace, SpaceKind};

struct SweepTask {
    space: Arc<SparseSpace>,
}

struct Pending {
    counts: Mutex<[usize; SpaceKind::COUNT]>,
    cv: Condvar,
}

impl Pending {
    fn start(&self, kind: SpaceKind) {
        self.counts.lock()[kind.index()] += 1;
    }

    fn finish(&self, kind: SpaceKind) {
        let mut counts = self.counts.lock();
        counts[kind.index()] -= 1;
        if counts[kind.index()] == 0 {
            self.cv.notify_all();
        }
    }

    fn wait(&self, kind: SpaceKind) {
        let mut counts = self.counts.lock();
        while counts[kind.index()] > 0 {
            self.cv.wait(&mut counts);
        }
    }
}

/// Runs sweep work on a fixed set of background threads. Sweep tasks never
/// block on the mutator; the mutator blocks only in
/// [`ensure_task_finished`](Self::ensure_task_finished).
pub struct ConcurrentSweeper {
    sender: Mutex<Option<flume::Sender<SweepTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<Pending>,
    concurrent: bool,
}

impl ConcurrentSweeper {
    pub fn new(threads: usize, concurrent: bool) -> Arc<Self> {
        let (tx, rx) = flume::unbounded::<SweepTask>();
        let pending = Arc::new(Pending {
            counts: Mutex::new([0; SpaceKind::COUNT]),
            cv: Condvar::new(),
        });
        let workers = (0..threads.max(1))
            .map(|_| {
                let rx = rx.clone();
                let pending = pending.clone();
                std::thread::spawn(move || {
                    while let Ok(task) = rx.recv() {
                        while task.space.async_sweep(false) {}
                        pending.finish(task.space.kind());
                    }
                })
            })
            .collect();
        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            pending,
            concurrent,
        })
    }

    #[inline]
    pub fn concurrent(&self) -> bool {
        self.concurrent
    }

    /// Starts a sweep pass over `space`. With concurrency enabled this
    /// prepares the pass synchronously and posts the region work to the
    /// background workers; otherwise the whole sweep runs here and now.
    pub fn sweep(&self, space: &Arc<SparseSpace>) {
        if !self.concurrent {
            space.sweep();
            return;
        }
        space.prepare_sweeping();
        self.pending.start(space.kind());
        let posted = {
            let sender = self.sender.lock();
            sender
                .as_ref()
                .map_or(false, |tx| tx.send(SweepTask { space: space.clone() }).is_ok())
        };
        if !posted {
            // Shutting down: fall back to the mutator path.
            while space.async_sweep(true) {}
            space.finish_fill_swept_region();
            self.pending.finish(space.kind());
        }
    }

    /// Blocks until every posted sweep task for `kind` has drained its
    /// space's sweeping list.
    pub fn ensure_task_finished(&self, kind: SpaceKind) {
        if self.concurrent {
            self.pending.wait(kind);
        }
    }

    pub fn ensure_all_task_finished(&self) {
        if !self.concurrent {
            return;
        }
        self.pending.wait(SpaceKind::Old);
        self.pending.wait(SpaceKind::NonMovable);
        self.pending.wait(SpaceKind::Snapshot);
        self.pending.wait(SpaceKind::Local);
    }
}

impl Drop for ConcurrentSweeper {
    fn drop(&mut self) {
        *self.sender.get_mut() = None;
        for worker in self.workers.get_mut().drain(..) {
            let _ = worker.join();
        }
    }
}
