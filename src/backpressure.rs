//! Area-level memory accounting and pause/resume feedback.
//!
//! Paths are grouped into areas; each area carries a pending-byte budget.
//! Admission charges the budget, batch completion releases it. When a
//! saturated area causes drops, the largest-pending member paths are paused
//! until the projected usage fits again; once usage falls to the low-water
//! mark (half the budget) every paused member resumes. Both transitions are
//! edge-triggered feedback records for the upstream producer.
//!
//! The member set mutex doubles as the transition guard: pause and resume
//! selection re-check the totals under it, so concurrent threshold crossings
//! cannot double-pause or double-resume a path.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam_channel::Sender;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::AreaSettings;
use crate::handler::{Area, Dest, Event, Path};
use crate::path::PathCell;

/// Capacity of the feedback channel. Records are dropped rather than ever
/// blocking a worker; the `is_paused` mismatch re-sync recovers lost ones.
pub(crate) const FEEDBACK_CHANNEL_CAPACITY: usize = 1024;

/// A pause or resume notification for one path, addressed to the upstream
/// producer feeding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback<A, P, D> {
    /// Area whose budget drove the transition.
    pub area: A,
    /// Path to pause or resume.
    pub path: P,
    /// Destination registered with the path.
    pub dest: D,
    /// `true` to pause the upstream, `false` to resume it.
    pub pause: bool,
}

/// Diagnostic view of one area.
#[derive(Debug, Clone)]
pub struct AreaSnapshot<A> {
    /// Area identifier.
    pub area: A,
    /// Aggregate pending bytes across member paths (including in-flight
    /// batches not yet released).
    pub pending_bytes: usize,
    /// Current budget.
    pub max_pending_bytes: usize,
    /// Registered member paths.
    pub member_paths: usize,
    /// Members currently paused by memory control.
    pub paused_paths: usize,
}

pub(crate) struct AreaState<P: Path> {
    settings: Mutex<AreaSettings>,
    pending_update: Mutex<Option<AreaSettings>>,
    /// Cached `settings.max_pending_bytes` for lock-free admission checks.
    max_pending: AtomicUsize,
    total_pending: AtomicUsize,
    paused_paths: AtomicUsize,
    members: Mutex<HashSet<P>>,
}

impl<P: Path> AreaState<P> {
    fn new(settings: AreaSettings) -> Self {
        Self {
            max_pending: AtomicUsize::new(settings.max_pending_bytes),
            settings: Mutex::new(settings),
            pending_update: Mutex::new(None),
            total_pending: AtomicUsize::new(0),
            paused_paths: AtomicUsize::new(0),
            members: Mutex::new(HashSet::new()),
        }
    }
}

/// Tracks every area of one stream and owns the feedback channel sender.
pub(crate) struct MemoryController<A: Area, P: Path, T: Event, D: Dest> {
    areas: DashMap<A, Arc<AreaState<P>>>,
    paths: Arc<DashMap<P, Arc<PathCell<A, P, T, D>>>>,
    feedback_tx: Sender<Feedback<A, P, D>>,
}

impl<A: Area, P: Path, T: Event, D: Dest> MemoryController<A, P, T, D> {
    pub fn new(
        paths: Arc<DashMap<P, Arc<PathCell<A, P, T, D>>>>,
        feedback_tx: Sender<Feedback<A, P, D>>,
    ) -> Self {
        Self {
            areas: DashMap::new(),
            paths,
            feedback_tx,
        }
    }

    /// Register a path with its area, creating the area on first use.
    /// Settings supplied at registration apply immediately; later updates go
    /// through [`set_area_settings`](Self::set_area_settings) and wait for
    /// the scheduler tick.
    pub fn register_path(&self, cell: &PathCell<A, P, T, D>, settings: Option<AreaSettings>) {
        let entry = self
            .areas
            .entry(cell.area.clone())
            .or_insert_with(|| Arc::new(AreaState::new(AreaSettings::default())));
        if let Some(settings) = settings {
            let settings = settings.normalized();
            *entry.settings.lock() = settings;
            entry
                .max_pending
                .store(settings.max_pending_bytes, Ordering::Relaxed);
        }
        // Holding the map entry here keeps area garbage collection from
        // racing the membership insert.
        entry.members.lock().insert(cell.id.clone());
    }

    /// Drop a path from its area; the area itself is garbage-collected when
    /// its last member leaves. The caller releases queued bytes separately.
    pub fn deregister_path(&self, cell: &PathCell<A, P, T, D>) {
        let Some(state) = self.areas.get(&cell.area).map(|r| Arc::clone(&r)) else {
            return;
        };
        let empty = {
            let mut members = state.members.lock();
            members.remove(&cell.id);
            if cell.paused.swap(false, Ordering::SeqCst) {
                state.paused_paths.fetch_sub(1, Ordering::Relaxed);
            }
            members.is_empty()
        };
        if empty {
            self.areas
                .remove_if(&cell.area, |_, s| s.members.lock().is_empty());
        }
    }

    /// Charge `size` bytes against the path's area. With `force` the charge
    /// always succeeds (periodic signals must flow even past the budget);
    /// otherwise the charge fails when it would exceed the budget and the
    /// caller drops the event.
    pub fn charge(&self, cell: &PathCell<A, P, T, D>, size: usize, force: bool) -> bool {
        let Some(state) = self.areas.get(&cell.area) else {
            return true;
        };
        if force {
            state.total_pending.fetch_add(size, Ordering::SeqCst);
            return true;
        }
        let max = state.max_pending.load(Ordering::Relaxed);
        state
            .total_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total + size <= max).then_some(total + size)
            })
            .is_ok()
    }

    /// Release bytes previously charged and resume the area's paused paths if
    /// usage fell to the low-water mark.
    pub fn release(&self, cell: &PathCell<A, P, T, D>, bytes: usize) {
        if bytes > 0 {
            if let Some(state) = self.areas.get(&cell.area) {
                let _ = state
                    .total_pending
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                        Some(total.saturating_sub(bytes))
                    });
            }
        }
        self.maybe_resume(&cell.area);
    }

    /// Pause the largest-pending member paths of a saturated area until the
    /// projected unpaused usage plus the rejected event would fit the budget.
    /// Invoked after a failed charge, so at least the top contributor pauses.
    pub fn engage_pause(&self, cell: &PathCell<A, P, T, D>, incoming_size: usize) {
        let Some(state) = self.areas.get(&cell.area).map(|r| Arc::clone(&r)) else {
            return;
        };
        let members = state.members.lock();
        let max = state.max_pending.load(Ordering::Relaxed);
        let mut projected = state.total_pending.load(Ordering::SeqCst);
        if projected + incoming_size <= max {
            // A concurrent drain already relieved the pressure.
            return;
        }

        let mut candidates: Vec<Arc<PathCell<A, P, T, D>>> = members
            .iter()
            .filter_map(|p| self.paths.get(p).map(|r| Arc::clone(&r)))
            .filter(|c| !c.paused.load(Ordering::SeqCst))
            .collect();
        candidates.sort_by_key(|c| Reverse(c.pending_bytes.load(Ordering::Relaxed)));

        for candidate in candidates {
            if projected + incoming_size <= max {
                break;
            }
            if !candidate.paused.swap(true, Ordering::SeqCst) {
                state.paused_paths.fetch_add(1, Ordering::Relaxed);
                projected =
                    projected.saturating_sub(candidate.pending_bytes.load(Ordering::Relaxed));
                debug!(path = ?candidate.id, area = ?candidate.area, "pausing path: area over budget");
                self.emit(&state, &candidate, true, true);
            }
        }
    }

    /// Resume every paused member, in ascending pending order, once the area
    /// falls to the low-water mark (half the budget).
    fn maybe_resume(&self, area: &A) {
        let Some(state) = self.areas.get(area).map(|r| Arc::clone(&r)) else {
            return;
        };
        if state.paused_paths.load(Ordering::Relaxed) == 0 {
            return;
        }
        let low_water = state.max_pending.load(Ordering::Relaxed) / 2;
        if state.total_pending.load(Ordering::SeqCst) > low_water {
            return;
        }

        let members = state.members.lock();
        if state.total_pending.load(Ordering::SeqCst) > low_water {
            return;
        }
        let mut paused: Vec<Arc<PathCell<A, P, T, D>>> = members
            .iter()
            .filter_map(|p| self.paths.get(p).map(|r| Arc::clone(&r)))
            .filter(|c| c.paused.load(Ordering::SeqCst))
            .collect();
        paused.sort_by_key(|c| c.pending_bytes.load(Ordering::Relaxed));

        for candidate in paused {
            if candidate.paused.swap(false, Ordering::SeqCst) {
                state.paused_paths.fetch_sub(1, Ordering::Relaxed);
                debug!(path = ?candidate.id, area = ?candidate.area, "resuming path: area under low water");
                self.emit(&state, &candidate, false, true);
            }
        }
    }

    /// Record the upstream's pause belief for a path and schedule a
    /// corrective feedback when it disagrees with the local state.
    pub fn observe_upstream(&self, cell: &PathCell<A, P, T, D>, upstream_paused: bool) {
        cell.upstream_paused.store(upstream_paused, Ordering::Relaxed);
        let local = cell.paused.load(Ordering::SeqCst);
        if upstream_paused != local
            && let Some(state) = self.areas.get(&cell.area)
        {
            self.emit(&state, cell, local, false);
        }
    }

    /// Stage a settings update; [`apply_pending_updates`] makes it effective.
    /// No-op for areas without registered paths.
    ///
    /// [`apply_pending_updates`]: Self::apply_pending_updates
    pub fn set_area_settings(&self, area: &A, settings: AreaSettings) {
        if let Some(state) = self.areas.get(area) {
            *state.pending_update.lock() = Some(settings.normalized());
        }
    }

    /// Apply staged settings updates. Called from the scheduler tick.
    /// Shrinking a budget below current usage only pressures new admissions;
    /// nothing already queued is dropped.
    pub fn apply_pending_updates(&self) {
        for entry in self.areas.iter() {
            if let Some(settings) = entry.pending_update.lock().take() {
                entry
                    .max_pending
                    .store(settings.max_pending_bytes, Ordering::Relaxed);
                *entry.settings.lock() = settings;
                debug!(area = ?entry.key(), max_pending_bytes = settings.max_pending_bytes,
                    "applied area settings");
            }
        }
    }

    pub fn snapshot(&self) -> Vec<AreaSnapshot<A>> {
        self.areas
            .iter()
            .map(|entry| AreaSnapshot {
                area: entry.key().clone(),
                pending_bytes: entry.total_pending.load(Ordering::Relaxed),
                max_pending_bytes: entry.max_pending.load(Ordering::Relaxed),
                member_paths: entry.members.lock().len(),
                paused_paths: entry.paused_paths.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Send a feedback record. Edge transitions always go out; mismatch
    /// re-syncs respect the per-path rate limit.
    fn emit(&self, state: &AreaState<P>, cell: &PathCell<A, P, T, D>, pause: bool, edge: bool) {
        let Some(interval) = state.settings.lock().feedback_interval else {
            return;
        };
        {
            let mut last = cell.last_feedback_at.lock();
            if !edge
                && let Some(at) = *last
                && at.elapsed() < interval
            {
                return;
            }
            *last = Some(Instant::now());
        }
        if self
            .feedback_tx
            .try_send(Feedback {
                area: cell.area.clone(),
                path: cell.id.clone(),
                dest: cell.dest.clone(),
                pause,
            })
            .is_err()
        {
            trace!(path = ?cell.id, "feedback channel full, dropping record");
        }
    }
}
