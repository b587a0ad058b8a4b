//! Worker threads: drain path queues one batch at a time and invoke the
//! handler.
//!
//! Each worker owns an activation channel. An activation token is a path
//! reference; a path has at most one token in flight (the `scheduled` flag),
//! so no two workers ever drain the same path concurrently, which also makes
//! ownership migration atomic with respect to dequeuing. A worker processes
//! exactly one batch per token and then re-queues the path to its *current*
//! owner, giving round-robin fairness across ready paths and letting
//! scheduler reassignments take effect at the next batch boundary.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use crossbeam_utils::CachePadded;
use tracing::error;

use crate::backpressure::MemoryController;
use crate::error::DropReason;
use crate::handler::{Area, Dest, Event, EventProperty, HandleResult, Handler, Path};
use crate::path::PathCell;

/// How long an idle worker waits for an activation before re-checking the
/// shutdown flag.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Hot counters for one worker, padded to avoid false sharing between
/// neighbouring workers' cache lines.
#[derive(Default)]
pub(crate) struct WorkerStats {
    pub events: CachePadded<AtomicU64>,
    pub batches: CachePadded<AtomicU64>,
    pub busy_ns: CachePadded<AtomicU64>,
}

/// Diagnostic view of one worker.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    /// Worker index.
    pub worker_id: usize,
    /// Paths currently routed to this worker.
    pub owned_paths: usize,
    /// Events delivered to the handler since start.
    pub events_handled: u64,
    /// Handler invocations since start.
    pub batches_handled: u64,
    /// Cumulative time spent inside the handler.
    pub busy: Duration,
}

pub(crate) struct Worker<A: Area, P: Path, T: Event, D: Dest, H: Handler<A, P, T, D>> {
    id: usize,
    handler: Arc<H>,
    activations: Receiver<Arc<PathCell<A, P, T, D>>>,
    /// Activation senders for every worker, indexed by worker id, used to
    /// re-queue a path to whichever worker currently owns it.
    peers: Arc<Vec<Sender<Arc<PathCell<A, P, T, D>>>>>,
    controller: Option<Arc<MemoryController<A, P, T, D>>>,
    batch_count: usize,
    shutdown: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    epoch: Instant,
}

impl<A: Area, P: Path, T: Event, D: Dest, H: Handler<A, P, T, D>> Worker<A, P, T, D, H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        handler: Arc<H>,
        activations: Receiver<Arc<PathCell<A, P, T, D>>>,
        peers: Arc<Vec<Sender<Arc<PathCell<A, P, T, D>>>>>,
        controller: Option<Arc<MemoryController<A, P, T, D>>>,
        batch_count: usize,
        shutdown: Arc<AtomicBool>,
        stats: Arc<WorkerStats>,
        epoch: Instant,
    ) -> Self {
        Self {
            id,
            handler,
            activations,
            peers,
            controller,
            batch_count,
            shutdown,
            stats,
            epoch,
        }
    }

    /// Main loop: wait for activations until shutdown. The in-flight batch at
    /// shutdown time always completes; queued remainders are drained by the
    /// closing thread.
    pub fn run(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.activations.recv_timeout(IDLE_POLL) {
                Ok(cell) => self.process(cell),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Handle one batch for an activated path, then park, re-queue or release
    /// it depending on the outcome and the queue state.
    fn process(&self, cell: Arc<PathCell<A, P, T, D>>) {
        let mut batch = Vec::with_capacity(self.batch_count);
        let meta = {
            let mut queue = cell.queue.lock();
            if queue.removed || queue.awaiting {
                queue.scheduled = false;
                return;
            }
            match queue.take_batch(self.batch_count, &mut batch) {
                Some(meta) => {
                    cell.sync_pending(&queue);
                    meta
                }
                None => {
                    queue.scheduled = false;
                    return;
                }
            }
        };

        let started = Instant::now();
        let outcome =
            catch_unwind(AssertUnwindSafe(|| self.handler.handle(&cell.dest, &mut batch)));
        let busy = started.elapsed();

        self.stats.events.fetch_add(meta.len as u64, Ordering::Relaxed);
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .busy_ns
            .fetch_add(busy.as_nanos() as u64, Ordering::Relaxed);
        cell.recent_events.fetch_add(meta.len as u64, Ordering::Relaxed);
        cell.last_handle_at_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        cell.handled_timestamp
            .fetch_max(meta.max_timestamp, Ordering::Relaxed);

        // The handler owns the batch now, whether it finished synchronously
        // or parked the path; either way the bytes leave the area budget.
        if let Some(controller) = &self.controller {
            controller.release(&cell, meta.bytes);
        }

        let park = match outcome {
            Ok(HandleResult::Done) => false,
            Ok(HandleResult::Await) => true,
            Err(_) => {
                error!(worker = self.id, path = ?cell.id, "handler panicked, dropping batch");
                if meta.event_type.property != EventProperty::PeriodicSignal {
                    for event in batch.drain(..) {
                        self.handler.on_drop(event, DropReason::HandlerPanic);
                    }
                }
                false
            }
        };

        let renotify = {
            let mut queue = cell.queue.lock();
            if park {
                if queue.wake_pending {
                    // The completion signal beat the handler's return; the
                    // path never actually parks.
                    queue.wake_pending = false;
                } else {
                    queue.awaiting = true;
                }
            } else {
                // A wake token pairs with the batch that was in flight when
                // it arrived; it must not cancel a later park.
                queue.wake_pending = false;
            }
            if queue.removed || queue.awaiting || queue.is_empty() {
                queue.scheduled = false;
                false
            } else {
                true
            }
        };
        if renotify {
            let owner = cell.owner_worker.load(Ordering::Relaxed);
            let _ = self.peers[owner].send(cell);
        }
    }
}
