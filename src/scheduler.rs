//! Periodic load reporting and path rebalancing across workers.
//!
//! The scheduler thread wakes every `report_interval` to sample per-worker
//! busy-time deltas, and every `scheduler_interval` it applies staged area
//! settings and evaluates imbalance. When the busiest worker's window load
//! exceeds the least busy worker's by [`REBALANCE_RATIO`], paths migrate from
//! the former to the latter, heaviest first, never overshooting half the
//! gap. Migration only retargets `owner_worker`; the activation-token
//! exclusivity in the worker module makes the handoff atomic at the next
//! batch boundary, so no events are reordered or lost.

use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use dashmap::DashMap;
use tracing::debug;

use crate::backpressure::MemoryController;
use crate::handler::{Area, Dest, Event, Path};
use crate::path::PathCell;
use crate::worker::WorkerStats;

/// Busiest-to-least-busy load ratio beyond which a migration pass runs.
const REBALANCE_RATIO: f64 = 1.3;
/// Events the busiest worker must have handled in the window before
/// imbalance is acted on; below this the signal is noise.
const MIN_WINDOW_EVENTS: u64 = 32;

pub(crate) struct Scheduler<A: Area, P: Path, T: Event, D: Dest> {
    paths: Arc<DashMap<P, Arc<PathCell<A, P, T, D>>>>,
    controller: Option<Arc<MemoryController<A, P, T, D>>>,
    worker_stats: Arc<Vec<Arc<WorkerStats>>>,
    report_interval: Duration,
    scheduler_interval: Duration,
    shutdown_rx: Receiver<()>,
}

impl<A: Area, P: Path, T: Event, D: Dest> Scheduler<A, P, T, D> {
    pub fn new(
        paths: Arc<DashMap<P, Arc<PathCell<A, P, T, D>>>>,
        controller: Option<Arc<MemoryController<A, P, T, D>>>,
        worker_stats: Arc<Vec<Arc<WorkerStats>>>,
        report_interval: Duration,
        scheduler_interval: Duration,
        shutdown_rx: Receiver<()>,
    ) -> Self {
        Self {
            paths,
            controller,
            worker_stats,
            report_interval,
            scheduler_interval,
            shutdown_rx,
        }
    }

    pub fn run(&self) {
        let worker_count = self.worker_stats.len();
        let mut last_busy = vec![0u64; worker_count];
        let mut window_busy = vec![0u64; worker_count];
        let mut last_rebalance = Instant::now();

        loop {
            match self.shutdown_rx.recv_timeout(self.report_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            for (i, stats) in self.worker_stats.iter().enumerate() {
                let busy = stats.busy_ns.load(Ordering::Relaxed);
                window_busy[i] += busy - last_busy[i];
                last_busy[i] = busy;
            }

            if last_rebalance.elapsed() >= self.scheduler_interval {
                if let Some(controller) = &self.controller {
                    controller.apply_pending_updates();
                }
                self.rebalance(&window_busy);
                window_busy.fill(0);
                last_rebalance = Instant::now();
            }
        }
    }

    /// One rebalance pass over the current window. Busy time decides whether
    /// the pool is imbalanced; per-path event counters decide which paths to
    /// move and how far.
    fn rebalance(&self, window_busy: &[u64]) {
        let worker_count = window_busy.len();
        if worker_count < 2 {
            return;
        }

        let mut owned: Vec<Vec<(u64, Arc<PathCell<A, P, T, D>>)>> =
            vec![Vec::new(); worker_count];
        let mut events_per_worker = vec![0u64; worker_count];
        for entry in self.paths.iter() {
            let cell = Arc::clone(entry.value());
            let events = cell.recent_events.swap(0, Ordering::Relaxed);
            let worker = cell
                .owner_worker
                .load(Ordering::Relaxed)
                .min(worker_count - 1);
            events_per_worker[worker] += events;
            owned[worker].push((events, cell));
        }

        let busiest = match (0..worker_count).max_by_key(|&i| window_busy[i]) {
            Some(i) => i,
            None => return,
        };
        let least = match (0..worker_count).min_by_key(|&i| window_busy[i]) {
            Some(i) => i,
            None => return,
        };
        if busiest == least || events_per_worker[busiest] < MIN_WINDOW_EVENTS {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        if (window_busy[busiest] as f64) <= (window_busy[least] as f64) * REBALANCE_RATIO {
            return;
        }

        let gap = events_per_worker[busiest].saturating_sub(events_per_worker[least]);
        let mut budget = gap / 2;
        if budget == 0 {
            return;
        }

        let mut candidates = std::mem::take(&mut owned[busiest]);
        candidates.sort_by_key(|(events, _)| Reverse(*events));
        let mut moved = 0usize;
        for (events, cell) in candidates {
            if budget == 0 {
                break;
            }
            if events == 0 || events > budget {
                continue;
            }
            cell.owner_worker.store(least, Ordering::Relaxed);
            budget -= events;
            moved += 1;
        }
        if moved > 0 {
            debug!(
                from = busiest,
                to = least,
                moved,
                window_busy_ns = window_busy[busiest],
                "rebalanced paths"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    type Cell = PathCell<u8, u64, u32, ()>;

    fn scheduler(
        paths: Arc<DashMap<u64, Arc<Cell>>>,
        worker_count: usize,
    ) -> Scheduler<u8, u64, u32, ()> {
        let stats = Arc::new(
            (0..worker_count)
                .map(|_| Arc::new(WorkerStats::default()))
                .collect::<Vec<_>>(),
        );
        let (_tx, rx) = unbounded();
        Scheduler::new(
            paths,
            None,
            stats,
            Duration::from_millis(10),
            Duration::from_millis(20),
            rx,
        )
    }

    fn path_with_load(paths: &DashMap<u64, Arc<Cell>>, id: u64, owner: usize, events: u64) {
        let cell = Arc::new(Cell::new(id, 0, (), owner));
        cell.recent_events.store(events, Ordering::Relaxed);
        paths.insert(id, cell);
    }

    fn owners(paths: &DashMap<u64, Arc<Cell>>) -> Vec<(u64, usize)> {
        let mut v: Vec<_> = paths
            .iter()
            .map(|e| (*e.key(), e.owner_worker.load(Ordering::Relaxed)))
            .collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn test_imbalance_moves_paths_to_idle_worker() {
        let paths = Arc::new(DashMap::new());
        for id in 0..4 {
            path_with_load(&paths, id, 0, 100);
        }
        let s = scheduler(Arc::clone(&paths), 2);

        s.rebalance(&[1_000_000, 0]);
        let moved = owners(&paths).iter().filter(|(_, o)| *o == 1).count();
        // Gap is 400 events; half of it is covered by two 100-event paths.
        assert_eq!(moved, 2);
    }

    #[test]
    fn test_balanced_pool_stays_put() {
        let paths = Arc::new(DashMap::new());
        path_with_load(&paths, 1, 0, 100);
        path_with_load(&paths, 2, 1, 100);
        let s = scheduler(Arc::clone(&paths), 2);

        s.rebalance(&[1_000_000, 900_000]);
        assert_eq!(owners(&paths), vec![(1, 0), (2, 1)]);
    }

    #[test]
    fn test_quiet_window_is_ignored() {
        let paths = Arc::new(DashMap::new());
        path_with_load(&paths, 1, 0, MIN_WINDOW_EVENTS / 2);
        let s = scheduler(Arc::clone(&paths), 2);

        s.rebalance(&[1_000_000, 0]);
        assert_eq!(owners(&paths), vec![(1, 0)]);
    }

    #[test]
    fn test_dominant_path_does_not_flip_flop() {
        let paths = Arc::new(DashMap::new());
        // One path produces the entire load; moving it would only invert the
        // imbalance, so it must stay.
        path_with_load(&paths, 1, 0, 1000);
        let s = scheduler(Arc::clone(&paths), 2);

        s.rebalance(&[1_000_000, 0]);
        assert_eq!(owners(&paths), vec![(1, 0)]);
    }
}
