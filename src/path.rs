//! Per-path state: the FIFO event queue with signal coalescing and typed
//! batch extraction, plus the shared cell workers and the router coordinate
//! through.
//!
//! Locking discipline: everything inside [`PathQueue`], including the
//! `scheduled`/`awaiting` flags, is only touched under the queue mutex, so
//! an activation token can never be lost or duplicated. The atomic fields on
//! [`PathCell`] are mirrors and counters that other components read without
//! taking the lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::handler::{Area, Dest, Event, EventProperty, EventType, Path, Timestamp};

/// An admitted event together with the handler-derived metadata the stream
/// needs, computed exactly once at admission.
pub(crate) struct EventEnvelope<T> {
    pub event: T,
    pub size: usize,
    pub event_type: EventType,
    pub timestamp: Timestamp,
}

/// Summary of one extracted batch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchMeta {
    pub len: usize,
    pub bytes: usize,
    pub event_type: EventType,
    pub max_timestamp: Timestamp,
}

/// The mutex-guarded portion of a path.
pub(crate) struct PathQueue<T> {
    events: VecDeque<EventEnvelope<T>>,
    /// Sum of the sizes of the queued envelopes.
    pub pending_bytes: usize,
    /// An activation token for this path is in some worker's channel, or the
    /// path is currently being drained by a worker.
    pub scheduled: bool,
    /// The last handled batch returned `Await`; no pulls until a wake.
    pub awaiting: bool,
    /// A wake arrived before the handler returned `Await`; consume it instead
    /// of parking.
    pub wake_pending: bool,
    /// The path was removed; queued and future events are dropped.
    pub removed: bool,
}

impl<T> PathQueue<T> {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            pending_bytes: 0,
            scheduled: false,
            awaiting: false,
            wake_pending: false,
            removed: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Append an envelope. For a `PeriodicSignal`, a queued signal of the same
    /// data group is superseded: it is removed and returned so the caller can
    /// release its accounting, and the new signal takes the tail position.
    pub fn push(&mut self, envelope: EventEnvelope<T>) -> Option<EventEnvelope<T>> {
        let superseded = if envelope.event_type.property == EventProperty::PeriodicSignal {
            self.remove_signal(envelope.event_type.data_group)
        } else {
            None
        };
        self.pending_bytes += envelope.size;
        self.events.push_back(envelope);
        superseded
    }

    fn remove_signal(&mut self, data_group: u64) -> Option<EventEnvelope<T>> {
        let index = self.events.iter().position(|e| {
            e.event_type.property == EventProperty::PeriodicSignal
                && e.event_type.data_group == data_group
        })?;
        let envelope = self.events.remove(index)?;
        self.pending_bytes -= envelope.size;
        Some(envelope)
    }

    /// Pull the head run of same-typed events, at most `max` of them, into
    /// `buf`. A `NonBatchable` head caps the run at one event. Returns `None`
    /// on an empty queue.
    pub fn take_batch(&mut self, max: usize, buf: &mut Vec<T>) -> Option<BatchMeta> {
        let head_type = self.events.front()?.event_type;
        let limit = if head_type.property == EventProperty::NonBatchable {
            1
        } else {
            max.max(1)
        };

        let mut meta = BatchMeta {
            len: 0,
            bytes: 0,
            event_type: head_type,
            max_timestamp: 0,
        };
        while meta.len < limit
            && self
                .events
                .front()
                .is_some_and(|next| next.event_type == head_type)
        {
            let Some(envelope) = self.events.pop_front() else {
                break;
            };
            meta.len += 1;
            meta.bytes += envelope.size;
            meta.max_timestamp = meta.max_timestamp.max(envelope.timestamp);
            self.pending_bytes -= envelope.size;
            buf.push(envelope.event);
        }
        Some(meta)
    }

    /// Remove and return everything, zeroing the pending-byte count.
    pub fn drain_all(&mut self) -> Vec<EventEnvelope<T>> {
        self.pending_bytes = 0;
        self.events.drain(..).collect()
    }
}

/// Shared per-path state. One cell exists per registered path, held in the
/// stream's path registry and referenced by activation tokens.
pub(crate) struct PathCell<A: Area, P: Path, T: Event, D: Dest> {
    pub id: P,
    pub area: A,
    pub dest: D,
    pub queue: Mutex<PathQueue<T>>,
    /// Lock-free mirror of `queue.pending_bytes`, read by pause selection.
    pub pending_bytes: AtomicUsize,
    /// Local memory-control pause state.
    pub paused: AtomicBool,
    /// Last upstream pause state observed via `Handler::is_paused`.
    pub upstream_paused: AtomicBool,
    /// Index of the worker whose activation channel this path routes to.
    pub owner_worker: AtomicUsize,
    /// Milliseconds since stream start at the last completed batch.
    pub last_handle_at_ms: AtomicU64,
    /// Largest event timestamp delivered to the handler so far.
    pub handled_timestamp: AtomicU64,
    /// Events delivered since the scheduler's last rebalance pass.
    pub recent_events: AtomicU64,
    /// Rate-limit clock for re-synchronization feedback.
    pub last_feedback_at: Mutex<Option<Instant>>,
}

impl<A: Area, P: Path, T: Event, D: Dest> PathCell<A, P, T, D> {
    pub fn new(id: P, area: A, dest: D, owner_worker: usize) -> Self {
        Self {
            id,
            area,
            dest,
            queue: Mutex::new(PathQueue::new()),
            pending_bytes: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            upstream_paused: AtomicBool::new(false),
            owner_worker: AtomicUsize::new(owner_worker),
            last_handle_at_ms: AtomicU64::new(0),
            handled_timestamp: AtomicU64::new(0),
            recent_events: AtomicU64::new(0),
            last_feedback_at: Mutex::new(None),
        }
    }

    /// Refresh the lock-free pending-byte mirror from the locked queue.
    pub fn sync_pending(&self, queue: &PathQueue<T>) {
        self.pending_bytes.store(queue.pending_bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(event: u32, size: usize, ty: EventType) -> EventEnvelope<u32> {
        EventEnvelope {
            event,
            size,
            event_type: ty,
            timestamp: u64::from(event),
        }
    }

    fn data(group: u64) -> EventType {
        EventType {
            data_group: group,
            property: EventProperty::BatchableData,
        }
    }

    fn signal(group: u64) -> EventType {
        EventType {
            data_group: group,
            property: EventProperty::PeriodicSignal,
        }
    }

    #[test]
    fn test_fifo_and_pending_bytes() {
        let mut q = PathQueue::new();
        q.push(envelope(1, 10, data(0)));
        q.push(envelope(2, 20, data(0)));
        assert_eq!(q.pending_bytes, 30);

        let mut buf = Vec::new();
        let meta = q.take_batch(8, &mut buf).unwrap();
        assert_eq!(buf, vec![1, 2]);
        assert_eq!(meta.len, 2);
        assert_eq!(meta.bytes, 30);
        assert_eq!(meta.max_timestamp, 2);
        assert_eq!(q.pending_bytes, 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_signal_coalescing_keeps_latest() {
        let mut q = PathQueue::new();
        q.push(envelope(1, 4, signal(7)));
        q.push(envelope(2, 8, data(0)));
        let superseded = q.push(envelope(3, 4, signal(7)));
        assert_eq!(superseded.map(|e| e.event), Some(1));
        assert_eq!(q.pending_bytes, 12);

        // Different data group is untouched.
        assert!(q.push(envelope(4, 4, signal(9))).is_none());
        assert_eq!(q.pending_bytes, 16);

        let mut buf = Vec::new();
        let mut order = Vec::new();
        while q.take_batch(1, &mut buf).is_some() {
            order.append(&mut buf);
        }
        assert_eq!(order, vec![2, 3, 4]);
    }

    #[test]
    fn test_batch_breaks_at_type_boundary() {
        let mut q = PathQueue::new();
        for (event, group) in [(1, 0), (2, 0), (3, 0), (4, 1), (5, 1), (6, 0)] {
            q.push(envelope(event, 1, data(group)));
        }

        let mut buf = Vec::new();
        assert_eq!(q.take_batch(16, &mut buf).unwrap().len, 3);
        assert_eq!(buf, vec![1, 2, 3]);

        buf.clear();
        assert_eq!(q.take_batch(16, &mut buf).unwrap().len, 2);
        assert_eq!(buf, vec![4, 5]);

        buf.clear();
        assert_eq!(q.take_batch(16, &mut buf).unwrap().len, 1);
        assert_eq!(buf, vec![6]);
        assert!(q.take_batch(16, &mut buf).is_none());
    }

    #[test]
    fn test_non_batchable_goes_alone() {
        let ty = EventType {
            data_group: 0,
            property: EventProperty::NonBatchable,
        };
        let mut q = PathQueue::new();
        q.push(envelope(1, 1, ty));
        q.push(envelope(2, 1, ty));

        let mut buf = Vec::new();
        assert_eq!(q.take_batch(16, &mut buf).unwrap().len, 1);
        assert_eq!(buf, vec![1]);
    }

    #[test]
    fn test_drain_all_resets_accounting() {
        let mut q = PathQueue::new();
        q.push(envelope(1, 5, data(0)));
        q.push(envelope(2, 5, data(0)));
        let drained = q.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(q.pending_bytes, 0);
        assert!(q.is_empty());
    }
}
