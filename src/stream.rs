//! The dynamic stream itself: construction, lifecycle, admission routing and
//! the channel surface producers and consumers interact with.
//!
//! ## Architecture
//!
//! ```text
//! EventSender (producers) → ingress channel
//!          ↓
//! Router: path lookup, signal coalescing, pause and budget checks
//!          ↓
//! per-path queue → owning worker's activation channel
//!          ↓
//! Worker: one typed batch per activation → Handler::handle
//!          ↓
//! MemoryController: release bytes → Feedback (pause/resume) → upstream
//!
//! WakeSender (host) → wake channel → Router (unpark awaited paths)
//! ```
//!
//! One router thread performs admission (path lookup, signal coalescing,
//! pause and budget checks) and hands activation tokens to the owning
//! worker's channel. Workers drain one typed batch per token. A scheduler
//! thread periodically rebalances path ownership across workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::backpressure::{AreaSnapshot, FEEDBACK_CHANNEL_CAPACITY, Feedback, MemoryController};
use crate::config::{AreaSettings, StreamConfig};
use crate::error::{DropReason, StreamError};
use crate::handler::{Area, Dest, Event, EventProperty, Handler, Path};
use crate::path::{EventEnvelope, PathCell};
use crate::scheduler::Scheduler;
use crate::worker::{Worker, WorkerSnapshot, WorkerStats};

/// Producer handle for the ingress channel. Cloneable; sends block only when
/// the stream was configured with a bounded ingress capacity and the router
/// has fallen that far behind.
pub struct EventSender<T> {
    tx: Sender<T>,
    closed: Arc<AtomicBool>,
    drop_hook: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
            drop_hook: Arc::clone(&self.drop_hook),
        }
    }
}

impl<T> EventSender<T> {
    /// Send an event into the stream.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Closed`] after `close()`; the event is reported
    /// through the handler's `on_drop` with [`DropReason::ShutdownDrain`]
    /// first (periodic signals excepted), so producers never leak events
    /// silently.
    pub fn send(&self, event: T) -> Result<(), StreamError> {
        if self.closed.load(Ordering::Acquire) {
            (self.drop_hook)(event);
            return Err(StreamError::Closed);
        }
        match self.tx.send(event) {
            Ok(()) => Ok(()),
            Err(err) => {
                (self.drop_hook)(err.into_inner());
                Err(StreamError::Closed)
            }
        }
    }
}

/// Producer handle for wake tokens: signals that a path's last awaited batch
/// has completed and the path may pull events again. Cloneable; a no-op after
/// close.
pub struct WakeSender<P> {
    tx: Sender<P>,
    closed: Arc<AtomicBool>,
}

impl<P> Clone for WakeSender<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<P> WakeSender<P> {
    pub fn wake(&self, path: P) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.tx.send(path);
        }
    }
}

/// Diagnostic view of one path.
#[derive(Debug, Clone)]
pub struct PathSnapshot<A, P> {
    pub path: P,
    pub area: A,
    pub owner_worker: usize,
    pub pending_bytes: usize,
    pub paused: bool,
    /// Pause state the upstream last reported via `Handler::is_paused`;
    /// divergence from `paused` means a corrective feedback is owed.
    pub upstream_paused: bool,
    /// Milliseconds since stream start at the last completed batch; 0 when
    /// nothing was handled yet.
    pub last_handle_at_ms: u64,
    /// Largest event timestamp delivered to the handler.
    pub handled_timestamp: u64,
}

/// Point-in-time view of the whole stream, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct StreamSnapshot<A, P> {
    pub workers: Vec<WorkerSnapshot>,
    pub areas: Vec<AreaSnapshot<A>>,
    pub paths: Vec<PathSnapshot<A, P>>,
}

enum ControlMessage {
    Shutdown,
}

/// Channel endpoints handed to the background threads on `start()`.
struct PendingChannels<A: Area, P: Path, T: Event, D: Dest> {
    worker_rxs: Vec<Receiver<Arc<PathCell<A, P, T, D>>>>,
    wake_rx: Receiver<P>,
    control_rx: Receiver<ControlMessage>,
    scheduler_shutdown_rx: Receiver<()>,
}

/// A dynamic per-path event stream scheduler.
///
/// Events from the same path are handled strictly in admission order, never
/// concurrently; events from different paths are handled in parallel across
/// the worker pool. With memory control enabled, per-area pending bytes are
/// bounded and pause/resume feedback flows to upstream producers.
///
/// ## Example
///
/// ```ignore
/// let stream = DynamicStream::new(MyHandler, StreamConfig::default());
/// stream.start();
/// stream.add_path(path_id, dest)?;
///
/// let sender = stream.event_sender();
/// sender.send(event)?;
///
/// stream.close();
/// ```
pub struct DynamicStream<A: Area, P: Path, T: Event, D: Dest, H: Handler<A, P, T, D>> {
    handler: Arc<H>,
    config: StreamConfig,
    paths: Arc<DashMap<P, Arc<PathCell<A, P, T, D>>>>,
    controller: Option<Arc<MemoryController<A, P, T, D>>>,
    worker_txs: Arc<Vec<Sender<Arc<PathCell<A, P, T, D>>>>>,
    worker_stats: Arc<Vec<Arc<WorkerStats>>>,
    in_tx: Sender<T>,
    /// Kept so the closing thread can drain the residual ingress backlog.
    in_rx: Receiver<T>,
    wake_tx: Sender<P>,
    control_tx: Sender<ControlMessage>,
    scheduler_shutdown_tx: Sender<()>,
    feedback_rx: Option<Receiver<Feedback<A, P, D>>>,
    drop_hook: Arc<dyn Fn(T) + Send + Sync>,
    worker_shutdown: Arc<AtomicBool>,
    epoch: Instant,
    next_owner: AtomicUsize,
    started: AtomicBool,
    closed: Arc<AtomicBool>,
    pending: Mutex<Option<PendingChannels<A, P, T, D>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<A: Area, P: Path, T: Event, D: Dest, H: Handler<A, P, T, D>> DynamicStream<A, P, T, D, H> {
    /// Build a stream. No threads run until [`start`](Self::start).
    pub fn new(handler: H, config: StreamConfig) -> Self {
        let config = config.normalized();
        let handler = Arc::new(handler);
        let paths: Arc<DashMap<P, Arc<PathCell<A, P, T, D>>>> = Arc::new(DashMap::new());

        let (in_tx, in_rx) = match config.in_channel_capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        let (wake_tx, wake_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let (scheduler_shutdown_tx, scheduler_shutdown_rx) = bounded(1);

        let mut worker_txs = Vec::with_capacity(config.worker_count);
        let mut worker_rxs = Vec::with_capacity(config.worker_count);
        for _ in 0..config.worker_count {
            let (tx, rx) = unbounded();
            worker_txs.push(tx);
            worker_rxs.push(rx);
        }

        let (controller, feedback_rx) = if config.enable_memory_control {
            let (feedback_tx, feedback_rx) = bounded(FEEDBACK_CHANNEL_CAPACITY);
            (
                Some(Arc::new(MemoryController::new(
                    Arc::clone(&paths),
                    feedback_tx,
                ))),
                Some(feedback_rx),
            )
        } else {
            (None, None)
        };

        let worker_stats: Arc<Vec<Arc<WorkerStats>>> = Arc::new(
            (0..config.worker_count)
                .map(|_| Arc::new(WorkerStats::default()))
                .collect(),
        );

        let drop_hook: Arc<dyn Fn(T) + Send + Sync> = {
            let handler = Arc::clone(&handler);
            Arc::new(move |event: T| {
                if handler.event_type(&event).property != EventProperty::PeriodicSignal {
                    handler.on_drop(event, DropReason::ShutdownDrain);
                }
            })
        };

        Self {
            handler,
            config,
            paths,
            controller,
            worker_txs: Arc::new(worker_txs),
            worker_stats,
            in_tx,
            in_rx,
            wake_tx,
            control_tx,
            scheduler_shutdown_tx,
            feedback_rx,
            drop_hook,
            worker_shutdown: Arc::new(AtomicBool::new(false)),
            epoch: Instant::now(),
            next_owner: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            pending: Mutex::new(Some(PendingChannels {
                worker_rxs,
                wake_rx,
                control_rx,
                scheduler_shutdown_rx,
            })),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the router, workers and scheduler. Idempotent; must precede
    /// event ingestion.
    pub fn start(&self) {
        if self.closed.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        info!(
            workers = self.config.worker_count,
            batch_count = self.config.batch_count,
            memory_control = self.config.enable_memory_control,
            "starting dynamic stream"
        );

        let mut threads = Vec::with_capacity(self.config.worker_count + 2);

        let router = Router {
            handler: Arc::clone(&self.handler),
            paths: Arc::clone(&self.paths),
            controller: self.controller.clone(),
            worker_txs: Arc::clone(&self.worker_txs),
            in_rx: self.in_rx.clone(),
            wake_rx: pending.wake_rx,
            control_rx: pending.control_rx,
        };
        threads.push(
            thread::Builder::new()
                .name("dynstream-router".into())
                .spawn(move || router.run())
                .expect("failed to spawn router thread"),
        );

        for (id, activations) in pending.worker_rxs.into_iter().enumerate() {
            let worker = Worker::new(
                id,
                Arc::clone(&self.handler),
                activations,
                Arc::clone(&self.worker_txs),
                self.controller.clone(),
                self.config.batch_count,
                Arc::clone(&self.worker_shutdown),
                Arc::clone(&self.worker_stats[id]),
                self.epoch,
            );
            threads.push(
                thread::Builder::new()
                    .name(format!("dynstream-worker-{id}"))
                    .spawn(move || worker.run())
                    .expect("failed to spawn worker thread"),
            );
        }

        let scheduler = Scheduler::new(
            Arc::clone(&self.paths),
            self.controller.clone(),
            Arc::clone(&self.worker_stats),
            self.config.report_interval,
            self.config.scheduler_interval,
            pending.scheduler_shutdown_rx,
        );
        threads.push(
            thread::Builder::new()
                .name("dynstream-scheduler".into())
                .spawn(move || scheduler.run())
                .expect("failed to spawn scheduler thread"),
        );

        *self.threads.lock() = threads;
    }

    /// Stop the stream. Idempotent and terminal: admission stops (subsequent
    /// sends drop through `on_drop`), in-flight handler calls finish, every
    /// queued event is reported through `on_drop` with
    /// [`DropReason::ShutdownDrain`] (signals excepted), then the background
    /// threads exit.
    ///
    /// Must not be called from inside a handler.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing dynamic stream");
        let _ = self.control_tx.send(ControlMessage::Shutdown);
        let _ = self.scheduler_shutdown_tx.try_send(());
        self.worker_shutdown.store(true, Ordering::SeqCst);

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }

        while let Ok(event) = self.in_rx.try_recv() {
            (self.drop_hook)(event);
        }

        let cells: Vec<Arc<PathCell<A, P, T, D>>> =
            self.paths.iter().map(|e| Arc::clone(e.value())).collect();
        self.paths.clear();
        for cell in cells {
            let drained = {
                let mut queue = cell.queue.lock();
                queue.removed = true;
                let drained = queue.drain_all();
                cell.sync_pending(&queue);
                drained
            };
            let bytes: usize = drained.iter().map(|e| e.size).sum();
            for envelope in drained {
                if envelope.event_type.property != EventProperty::PeriodicSignal {
                    self.handler
                        .on_drop(envelope.event, DropReason::ShutdownDrain);
                }
            }
            if let Some(controller) = &self.controller {
                controller.release(&cell, bytes);
                controller.deregister_path(&cell);
            }
        }
    }

    /// Producer handle for the ingress channel.
    #[must_use]
    pub fn event_sender(&self) -> EventSender<T> {
        EventSender {
            tx: self.in_tx.clone(),
            closed: Arc::clone(&self.closed),
            drop_hook: Arc::clone(&self.drop_hook),
        }
    }

    /// Producer handle for wake tokens.
    #[must_use]
    pub fn wake_sender(&self) -> WakeSender<P> {
        WakeSender {
            tx: self.wake_tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Consumer side of the pause/resume feedback channel, or `None` when
    /// memory control is disabled.
    #[must_use]
    pub fn feedback_receiver(&self) -> Option<Receiver<Feedback<A, P, D>>> {
        self.feedback_rx.clone()
    }

    /// Register a path. Events for unregistered paths are dropped at
    /// admission.
    ///
    /// # Errors
    ///
    /// [`StreamError::Duplicate`] if the path exists, [`StreamError::Closed`]
    /// after close.
    pub fn add_path(&self, path: P, dest: D) -> Result<(), StreamError> {
        self.add_path_inner(path, dest, None)
    }

    /// Register a path and set its area's settings in one call. The settings
    /// apply immediately (unlike [`set_area_settings`](Self::set_area_settings),
    /// which waits for the scheduler tick).
    ///
    /// # Errors
    ///
    /// Same as [`add_path`](Self::add_path).
    pub fn add_path_with_settings(
        &self,
        path: P,
        dest: D,
        settings: AreaSettings,
    ) -> Result<(), StreamError> {
        self.add_path_inner(path, dest, Some(settings))
    }

    fn add_path_inner(
        &self,
        path: P,
        dest: D,
        settings: Option<AreaSettings>,
    ) -> Result<(), StreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        let area = self.handler.area(&path, &dest);
        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed) % self.config.worker_count;
        let cell = Arc::new(PathCell::new(path.clone(), area, dest, owner));
        match self.paths.entry(path) {
            Entry::Occupied(_) => return Err(StreamError::Duplicate),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&cell));
            }
        }
        if let Some(controller) = &self.controller {
            controller.register_path(&cell, settings);
        }
        debug!(path = ?cell.id, worker = owner, "added path");
        Ok(())
    }

    /// Remove a path immediately: queued events drop through
    /// `on_drop(PathRemoved)` (signals excepted) and area accounting is
    /// decremented. A batch already inside the handler finishes normally.
    ///
    /// # Errors
    ///
    /// [`StreamError::NotExist`] for unknown paths, [`StreamError::Closed`]
    /// after close.
    pub fn remove_path(&self, path: &P) -> Result<(), StreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        let Some((_, cell)) = self.paths.remove(path) else {
            return Err(StreamError::NotExist);
        };
        let drained = {
            let mut queue = cell.queue.lock();
            queue.removed = true;
            let drained = queue.drain_all();
            cell.sync_pending(&queue);
            drained
        };
        let bytes: usize = drained.iter().map(|e| e.size).sum();
        for envelope in drained {
            if envelope.event_type.property != EventProperty::PeriodicSignal {
                self.handler
                    .on_drop(envelope.event, DropReason::PathRemoved);
            }
        }
        if let Some(controller) = &self.controller {
            controller.release(&cell, bytes);
            controller.deregister_path(&cell);
        }
        debug!(path = ?cell.id, "removed path");
        Ok(())
    }

    /// Update an area's settings. A no-op for areas without registered paths;
    /// otherwise takes effect on the next scheduler tick.
    pub fn set_area_settings(&self, area: &A, settings: AreaSettings) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(controller) = &self.controller {
            controller.set_area_settings(area, settings);
        }
    }

    /// Point-in-time diagnostics across workers, areas and paths.
    #[must_use]
    pub fn snapshot(&self) -> StreamSnapshot<A, P> {
        let worker_count = self.config.worker_count;
        let mut owned = vec![0usize; worker_count];
        let mut paths = Vec::with_capacity(self.paths.len());
        for entry in self.paths.iter() {
            let owner = entry
                .owner_worker
                .load(Ordering::Relaxed)
                .min(worker_count - 1);
            owned[owner] += 1;
            paths.push(PathSnapshot {
                path: entry.id.clone(),
                area: entry.area.clone(),
                owner_worker: owner,
                pending_bytes: entry.pending_bytes.load(Ordering::Relaxed),
                paused: entry.paused.load(Ordering::Relaxed),
                upstream_paused: entry.upstream_paused.load(Ordering::Relaxed),
                last_handle_at_ms: entry.last_handle_at_ms.load(Ordering::Relaxed),
                handled_timestamp: entry.handled_timestamp.load(Ordering::Relaxed),
            });
        }
        let workers = self
            .worker_stats
            .iter()
            .enumerate()
            .map(|(worker_id, stats)| WorkerSnapshot {
                worker_id,
                owned_paths: owned[worker_id],
                events_handled: stats.events.load(Ordering::Relaxed),
                batches_handled: stats.batches.load(Ordering::Relaxed),
                busy: Duration::from_nanos(stats.busy_ns.load(Ordering::Relaxed)),
            })
            .collect();
        let areas = self
            .controller
            .as_ref()
            .map(|c| c.snapshot())
            .unwrap_or_default();
        StreamSnapshot {
            workers,
            areas,
            paths,
        }
    }
}

impl<A: Area, P: Path, T: Event, D: Dest, H: Handler<A, P, T, D>> Drop
    for DynamicStream<A, P, T, D, H>
{
    fn drop(&mut self) {
        self.close();
        // Events that raced a concurrent send past the close-time drain.
        while let Ok(event) = self.in_rx.try_recv() {
            (self.drop_hook)(event);
        }
    }
}

/// The single admission thread: consumes the ingress and wake channels and
/// feeds the workers' activation channels.
struct Router<A: Area, P: Path, T: Event, D: Dest, H: Handler<A, P, T, D>> {
    handler: Arc<H>,
    paths: Arc<DashMap<P, Arc<PathCell<A, P, T, D>>>>,
    controller: Option<Arc<MemoryController<A, P, T, D>>>,
    worker_txs: Arc<Vec<Sender<Arc<PathCell<A, P, T, D>>>>>,
    in_rx: Receiver<T>,
    wake_rx: Receiver<P>,
    control_rx: Receiver<ControlMessage>,
}

impl<A: Area, P: Path, T: Event, D: Dest, H: Handler<A, P, T, D>> Router<A, P, T, D, H> {
    fn run(&self) {
        loop {
            crossbeam_channel::select! {
                recv(self.control_rx) -> message => match message {
                    Ok(ControlMessage::Shutdown) | Err(_) => break,
                },
                recv(self.in_rx) -> event => match event {
                    Ok(event) => self.admit(event),
                    Err(_) => break,
                },
                recv(self.wake_rx) -> path => {
                    if let Ok(path) = path {
                        self.wake(&path);
                    }
                }
            }
        }
    }

    /// Admission for one event: path lookup, upstream-state observation,
    /// pause and budget checks, signal coalescing, enqueue and activation.
    /// Every handler accessor is invoked exactly once per event.
    fn admit(&self, event: T) {
        let event_type = self.handler.event_type(&event);
        let is_signal = event_type.property == EventProperty::PeriodicSignal;
        let path = self.handler.path(&event);
        let Some(cell) = self.paths.get(&path).map(|r| Arc::clone(&r)) else {
            if !is_signal {
                self.handler.on_drop(event, DropReason::PathUnknown);
            }
            return;
        };
        let size = self.handler.size(&event);
        let timestamp = self.handler.timestamp(&event);

        if let Some(controller) = &self.controller {
            controller.observe_upstream(&cell, self.handler.is_paused(&event));
        }

        if is_signal {
            // Signals bypass both the pause gate and the budget: memory
            // control relies on them flowing even while the path is paused.
            if let Some(controller) = &self.controller {
                controller.charge(&cell, size, true);
            }
        } else {
            if cell.paused.load(Ordering::SeqCst) {
                self.handler.on_drop(event, DropReason::PathPaused);
                return;
            }
            if let Some(controller) = &self.controller
                && !controller.charge(&cell, size, false)
            {
                self.handler.on_drop(event, DropReason::AreaFull);
                controller.engage_pause(&cell, size);
                return;
            }
        }

        let mut queue = cell.queue.lock();
        if queue.removed {
            drop(queue);
            if let Some(controller) = &self.controller {
                controller.release(&cell, size);
            }
            if !is_signal {
                self.handler.on_drop(event, DropReason::PathRemoved);
            }
            return;
        }
        let superseded = queue.push(EventEnvelope {
            event,
            size,
            event_type,
            timestamp,
        });
        cell.sync_pending(&queue);
        let notify = if !queue.scheduled && !queue.awaiting {
            queue.scheduled = true;
            true
        } else {
            false
        };
        drop(queue);

        if let Some(envelope) = superseded {
            // The older signal vanishes silently by contract; only its
            // accounting is returned.
            if let Some(controller) = &self.controller {
                controller.release(&cell, envelope.size);
            }
        }
        if notify {
            let owner = cell.owner_worker.load(Ordering::Relaxed);
            let _ = self.worker_txs[owner].send(cell);
        }
    }

    /// A wake token: unpark the path, or remember the token if the handler
    /// has not returned from the awaited batch yet.
    fn wake(&self, path: &P) {
        let Some(cell) = self.paths.get(path).map(|r| Arc::clone(&r)) else {
            return;
        };
        let notify = {
            let mut queue = cell.queue.lock();
            if queue.removed {
                false
            } else if queue.awaiting {
                queue.awaiting = false;
                if !queue.is_empty() && !queue.scheduled {
                    queue.scheduled = true;
                    true
                } else {
                    false
                }
            } else if queue.scheduled {
                queue.wake_pending = true;
                false
            } else {
                false
            }
        };
        if notify {
            let owner = cell.owner_worker.load(Ordering::Relaxed);
            let _ = self.worker_txs[owner].send(cell);
        }
    }
}
