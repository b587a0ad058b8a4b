//! End-to-end scenarios exercising the public stream surface: ordering,
//! batching, await/wake, memory control and lifecycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use parking_lot::Mutex;

use dynstream::{
    AreaSettings, DropReason, DynamicStream, EventProperty, EventType, HandleResult, Handler,
    StreamConfig, Timestamp,
};

#[derive(Clone, Debug, PartialEq, Eq)]
struct Ev {
    path: u64,
    value: u64,
    size: usize,
    group: u64,
    property: EventProperty,
}

fn ev(path: u64, value: u64) -> Ev {
    Ev {
        path,
        value,
        size: 0,
        group: 0,
        property: EventProperty::BatchableData,
    }
}

fn sized(path: u64, value: u64, size: usize) -> Ev {
    Ev { size, ..ev(path, value) }
}

fn grouped(path: u64, value: u64, group: u64) -> Ev {
    Ev {
        group,
        size: 1,
        ..ev(path, value)
    }
}

fn signal(path: u64, value: u64, group: u64, size: usize) -> Ev {
    Ev {
        path,
        value,
        size,
        group,
        property: EventProperty::PeriodicSignal,
    }
}

struct RecordedBatch {
    thread: ThreadId,
    path: u64,
    values: Vec<u64>,
}

/// Shared test handler: records batches and drops, can park the path after
/// the first batch (`await_first`) and can stall every batch on a gate
/// channel.
#[derive(Default)]
struct Probe {
    batches: Mutex<Vec<RecordedBatch>>,
    handled: AtomicUsize,
    dropped: Mutex<Vec<(u64, DropReason)>>,
    await_first: AtomicBool,
    gate: Option<Receiver<()>>,
}

impl Probe {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn parked_first() -> Arc<Self> {
        Arc::new(Self {
            await_first: AtomicBool::new(true),
            ..Self::default()
        })
    }

    fn gated(gate: Receiver<()>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    fn values_for(&self, path: u64) -> Vec<u64> {
        self.batches
            .lock()
            .iter()
            .filter(|b| b.path == path)
            .flat_map(|b| b.values.iter().copied())
            .collect()
    }
}

impl Handler<u8, u64, Ev, u64> for Arc<Probe> {
    fn path(&self, event: &Ev) -> u64 {
        event.path
    }

    fn handle(&self, _dest: &u64, events: &mut Vec<Ev>) -> HandleResult {
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        self.batches.lock().push(RecordedBatch {
            thread: std::thread::current().id(),
            path: events[0].path,
            values: events.iter().map(|e| e.value).collect(),
        });
        self.handled.fetch_add(events.len(), Ordering::SeqCst);
        if self.await_first.swap(false, Ordering::SeqCst) {
            events.clear();
            return HandleResult::Await;
        }
        HandleResult::Done
    }

    fn size(&self, event: &Ev) -> usize {
        event.size
    }

    fn event_type(&self, event: &Ev) -> EventType {
        EventType {
            data_group: event.group,
            property: event.property,
        }
    }

    fn timestamp(&self, event: &Ev) -> Timestamp {
        event.value
    }

    fn on_drop(&self, event: Ev, reason: DropReason) {
        self.dropped.lock().push((event.value, reason));
    }
}

/// Opt-in log capture: `RUST_LOG=dynstream=debug cargo test` shows pause,
/// resume and rebalance transitions.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Long scheduler interval keeps path-to-worker assignment stable for the
/// duration of a test.
fn stable_config(worker_count: usize, batch_count: usize) -> StreamConfig {
    StreamConfig {
        worker_count,
        batch_count,
        scheduler_interval: Duration::from_secs(60),
        ..StreamConfig::default()
    }
}

#[test]
fn serial_per_path_parallel_cross_path() {
    let probe = Probe::new();
    let stream = DynamicStream::new(Arc::clone(&probe), stable_config(2, 4));
    stream.start();
    stream.add_path(0, 0).unwrap();
    stream.add_path(1, 1).unwrap();

    let sender = stream.event_sender();
    for value in 0..1000 {
        sender.send(ev(0, value)).unwrap();
        sender.send(ev(1, value)).unwrap();
    }
    assert!(wait_until(|| probe.handled() == 2000));
    stream.close();

    let expected: Vec<u64> = (0..1000).collect();
    assert_eq!(probe.values_for(0), expected);
    assert_eq!(probe.values_for(1), expected);

    let batches = probe.batches.lock();
    let threads_a: HashSet<ThreadId> =
        batches.iter().filter(|b| b.path == 0).map(|b| b.thread).collect();
    let threads_b: HashSet<ThreadId> =
        batches.iter().filter(|b| b.path == 1).map(|b| b.thread).collect();
    let cross_thread = threads_a
        .iter()
        .any(|a| threads_b.iter().any(|b| a != b));
    assert!(cross_thread, "paths never ran on distinct worker threads");
}

#[test]
fn batching_respects_the_configured_bound() {
    let probe = Probe::parked_first();
    let stream = DynamicStream::new(Arc::clone(&probe), stable_config(1, 8));
    stream.start();
    stream.add_path(7, 0).unwrap();

    let sender = stream.event_sender();
    // Primer batch parks the path so the real workload queues up in full.
    sender.send(ev(7, 999)).unwrap();
    assert!(wait_until(|| probe.handled() == 1));
    for value in 0..100 {
        sender.send(sized(7, value, 1)).unwrap();
    }
    assert!(wait_until(|| {
        stream.snapshot().paths.iter().any(|p| p.pending_bytes == 100)
    }));

    stream.wake_sender().wake(7);
    assert!(wait_until(|| probe.handled() == 101));
    stream.close();

    let batches = probe.batches.lock();
    let workload: Vec<&RecordedBatch> = batches.iter().skip(1).collect();
    assert!(
        workload.len() <= 13,
        "expected at most ceil(100/8) = 13 calls, saw {}",
        workload.len()
    );
    assert!(workload.iter().all(|b| b.values.len() <= 8));
    let concatenated: Vec<u64> = workload.iter().flat_map(|b| b.values.clone()).collect();
    assert_eq!(concatenated, (0..100).collect::<Vec<u64>>());
}

#[test]
fn batches_break_at_type_boundaries() {
    let probe = Probe::parked_first();
    let stream = DynamicStream::new(Arc::clone(&probe), stable_config(1, 16));
    stream.start();
    stream.add_path(3, 0).unwrap();

    let sender = stream.event_sender();
    sender.send(ev(3, 999)).unwrap();
    assert!(wait_until(|| probe.handled() == 1));

    // X X X Y Y X by data group.
    for (value, group) in [(0, 1), (1, 1), (2, 1), (3, 2), (4, 2), (5, 1)] {
        sender.send(grouped(3, value, group)).unwrap();
    }
    assert!(wait_until(|| {
        stream.snapshot().paths.iter().any(|p| p.pending_bytes == 6)
    }));
    stream.wake_sender().wake(3);
    assert!(wait_until(|| probe.handled() == 7));
    stream.close();

    let batches = probe.batches.lock();
    let workload: Vec<Vec<u64>> = batches.iter().skip(1).map(|b| b.values.clone()).collect();
    assert_eq!(workload, vec![vec![0, 1, 2], vec![3, 4], vec![5]]);
}

#[test]
fn awaiting_path_stays_parked_until_wake() {
    let probe = Probe::parked_first();
    let stream = DynamicStream::new(Arc::clone(&probe), stable_config(2, 1));
    stream.start();
    stream.add_path(0, 0).unwrap();
    stream.add_path(1, 1).unwrap();

    let sender = stream.event_sender();
    for value in 0..3 {
        sender.send(ev(0, value)).unwrap();
    }
    assert!(wait_until(|| probe.handled() == 1));

    // Queued events must not move while the path awaits.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(probe.handled(), 1);

    // Other paths are unaffected by the parked one.
    sender.send(ev(1, 100)).unwrap();
    assert!(wait_until(|| probe.handled() == 2));

    stream.wake_sender().wake(0);
    assert!(wait_until(|| probe.handled() == 4));
    stream.close();

    assert_eq!(probe.values_for(0), vec![0, 1, 2]);
}

#[test]
fn area_overflow_pauses_then_resumes_with_feedback() {
    init_tracing();
    let (gate_tx, gate_rx) = unbounded();
    let probe = Probe::gated(gate_rx);
    let stream = DynamicStream::new(
        Arc::clone(&probe),
        StreamConfig {
            worker_count: 1,
            batch_count: 1,
            enable_memory_control: true,
            scheduler_interval: Duration::from_secs(60),
            ..StreamConfig::default()
        },
    );
    stream.start();
    stream
        .add_path_with_settings(
            7,
            0,
            AreaSettings {
                max_pending_bytes: 1000,
                feedback_interval: Some(Duration::from_secs(1)),
            },
        )
        .unwrap();
    let feedback = stream.feedback_receiver().expect("memory control is on");

    let sender = stream.event_sender();
    for value in 1..=12 {
        sender.send(sized(7, value, 100)).unwrap();
    }

    // 10 events fit the budget; the 11th overflows the area and the 12th
    // hits the now-paused path.
    assert!(wait_until(|| probe.dropped.lock().len() == 2));
    {
        let dropped = probe.dropped.lock();
        assert_eq!(dropped[0], (11, DropReason::AreaFull));
        assert_eq!(dropped[1], (12, DropReason::PathPaused));
    }
    let record = feedback
        .recv_timeout(Duration::from_secs(5))
        .expect("pause feedback");
    assert!(record.pause);
    assert_eq!(record.path, 7);

    // Draining six events crosses the low-water mark (500 of 1000).
    for _ in 0..6 {
        gate_tx.send(()).unwrap();
    }
    assert!(wait_until(|| probe.handled() == 6));
    let record = feedback
        .recv_timeout(Duration::from_secs(5))
        .expect("resume feedback");
    assert!(!record.pause);
    assert_eq!(record.path, 7);
    assert!(feedback.try_recv().is_err(), "feedback is edge-triggered");

    drop(gate_tx);
    stream.close();
}

#[test]
fn periodic_signals_flow_and_coalesce_while_paused() {
    init_tracing();
    let (gate_tx, gate_rx) = unbounded();
    let probe = Probe::gated(gate_rx);
    let stream = DynamicStream::new(
        Arc::clone(&probe),
        StreamConfig {
            worker_count: 1,
            batch_count: 1,
            enable_memory_control: true,
            scheduler_interval: Duration::from_secs(60),
            ..StreamConfig::default()
        },
    );
    stream.start();
    stream
        .add_path_with_settings(
            7,
            0,
            AreaSettings {
                max_pending_bytes: 1000,
                feedback_interval: Some(Duration::from_secs(1)),
            },
        )
        .unwrap();

    let sender = stream.event_sender();
    for value in 1..=11 {
        sender.send(sized(7, value, 100)).unwrap();
    }
    assert!(wait_until(|| probe.dropped.lock().len() == 1));
    assert!(wait_until(|| {
        stream.snapshot().paths.iter().any(|p| p.paused)
    }));

    // Signals are admitted past both the pause gate and the budget; the
    // newer one silently supersedes the queued one. Distinct sizes make each
    // admission observable in the area accounting.
    sender.send(signal(7, 201, 5, 8)).unwrap();
    assert!(wait_until(|| {
        stream.snapshot().areas.iter().any(|a| a.pending_bytes == 1008)
    }));
    sender.send(signal(7, 202, 5, 16)).unwrap();
    assert!(wait_until(|| {
        stream.snapshot().areas.iter().any(|a| a.pending_bytes == 1016)
    }));

    drop(gate_tx);
    // 10 data events + exactly one surviving signal.
    assert!(wait_until(|| probe.handled() == 11));
    stream.close();

    let values = probe.values_for(7);
    assert!(values.contains(&202), "latest signal must be delivered");
    assert!(!values.contains(&201), "superseded signal must not be delivered");
    let dropped = probe.dropped.lock();
    assert!(
        dropped.iter().all(|(value, _)| *value != 201 && *value != 202),
        "signals never reach on_drop"
    );
}

#[test]
fn add_and_remove_path_errors() {
    let probe = Probe::new();
    let stream = DynamicStream::new(Arc::clone(&probe), stable_config(1, 1));
    stream.start();

    stream.add_path(1, 0).unwrap();
    assert_eq!(
        stream.add_path(1, 0),
        Err(dynstream::StreamError::Duplicate)
    );
    assert_eq!(
        stream.remove_path(&9),
        Err(dynstream::StreamError::NotExist)
    );
    stream.remove_path(&1).unwrap();
    // Re-adding after removal is allowed.
    stream.add_path(1, 0).unwrap();
    stream.close();

    assert_eq!(stream.add_path(2, 0), Err(dynstream::StreamError::Closed));
    assert_eq!(
        stream.remove_path(&1),
        Err(dynstream::StreamError::Closed)
    );
}

#[test]
fn removing_a_path_drops_its_queue() {
    let probe = Probe::parked_first();
    let stream = DynamicStream::new(Arc::clone(&probe), stable_config(1, 1));
    stream.start();
    stream.add_path(4, 0).unwrap();

    let sender = stream.event_sender();
    for value in 0..3 {
        sender.send(sized(4, value, 1)).unwrap();
    }
    // First event was handled and parked the path; wait for the other two to
    // be queued behind it before removing.
    assert!(wait_until(|| probe.handled() == 1));
    assert!(wait_until(|| {
        stream.snapshot().paths.iter().any(|p| p.pending_bytes == 2)
    }));

    stream.remove_path(&4).unwrap();
    {
        let dropped = probe.dropped.lock();
        assert_eq!(dropped.len(), 2);
        assert!(dropped.iter().all(|(_, r)| *r == DropReason::PathRemoved));
    }

    // Events for the removed path drop at admission.
    sender.send(ev(4, 9)).unwrap();
    assert!(wait_until(|| probe.dropped.lock().len() == 3));
    assert_eq!(probe.dropped.lock()[2], (9, DropReason::PathUnknown));
    stream.close();
}

#[test]
fn close_drains_queues_and_rejects_senders() {
    let probe = Probe::parked_first();
    let stream = DynamicStream::new(Arc::clone(&probe), stable_config(1, 1));
    stream.start();
    stream.add_path(2, 0).unwrap();

    let sender = stream.event_sender();
    for value in 0..3 {
        sender.send(ev(2, value)).unwrap();
    }
    assert!(wait_until(|| probe.handled() == 1));

    stream.close();
    // Idempotent.
    stream.close();

    {
        let dropped = probe.dropped.lock();
        assert_eq!(dropped.len(), 2);
        assert!(dropped.iter().all(|(_, r)| *r == DropReason::ShutdownDrain));
    }

    // Post-close sends fail and still report the event.
    assert_eq!(sender.send(ev(2, 9)), Err(dynstream::StreamError::Closed));
    assert_eq!(probe.dropped.lock().len(), 3);
    assert_eq!(probe.dropped.lock()[2], (9, DropReason::ShutdownDrain));
}

#[test]
fn bounded_ingress_blocks_producers_until_the_router_drains() {
    let probe = Probe::new();
    let stream = DynamicStream::new(
        Arc::clone(&probe),
        StreamConfig {
            worker_count: 1,
            in_channel_capacity: Some(2),
            ..StreamConfig::default()
        },
    );

    // The stream is not started, so nothing consumes the ingress channel.
    let sender = stream.event_sender();
    let unblocked = Arc::new(AtomicBool::new(false));
    let producer = {
        let unblocked = Arc::clone(&unblocked);
        std::thread::spawn(move || {
            for value in 0..3 {
                sender.send(ev(1, value)).unwrap();
            }
            unblocked.store(true, Ordering::SeqCst);
        })
    };

    // Two events fit, the third send must block on the full channel.
    std::thread::sleep(Duration::from_millis(50));
    assert!(!unblocked.load(Ordering::SeqCst));

    stream.add_path(1, 0).unwrap();
    stream.start();
    assert!(wait_until(|| unblocked.load(Ordering::SeqCst)));
    producer.join().unwrap();
    assert!(wait_until(|| probe.handled() == 3));
    stream.close();
}

#[test]
fn start_is_idempotent() {
    let probe = Probe::new();
    let stream = DynamicStream::new(Arc::clone(&probe), stable_config(2, 1));
    stream.start();
    stream.start();
    stream.add_path(1, 0).unwrap();

    let sender = stream.event_sender();
    sender.send(ev(1, 0)).unwrap();
    assert!(wait_until(|| probe.handled() == 1));
    stream.close();
}

#[test]
fn snapshot_reflects_workers_and_areas() {
    let probe = Probe::new();
    let stream = DynamicStream::new(
        Arc::clone(&probe),
        StreamConfig {
            worker_count: 2,
            enable_memory_control: true,
            scheduler_interval: Duration::from_secs(60),
            ..StreamConfig::default()
        },
    );
    stream.start();
    stream.add_path(1, 0).unwrap();
    stream.add_path(2, 0).unwrap();

    let sender = stream.event_sender();
    for value in 0..10 {
        sender.send(ev(1, value)).unwrap();
    }
    assert!(wait_until(|| probe.handled() == 10));

    let snapshot = stream.snapshot();
    assert_eq!(snapshot.workers.len(), 2);
    assert_eq!(snapshot.paths.len(), 2);
    assert_eq!(snapshot.areas.len(), 1, "both paths share the default area");
    assert_eq!(
        snapshot.workers.iter().map(|w| w.events_handled).sum::<u64>(),
        10
    );
    assert_eq!(
        snapshot.paths.iter().map(|p| p.handled_timestamp).max(),
        Some(9)
    );
    stream.close();
}
