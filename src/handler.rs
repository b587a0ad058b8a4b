//! The handler contract: the host-supplied callbacks that give the stream its
//! domain semantics.
//!
//! The stream itself never inspects an event. Everything it needs (which
//! path an event belongs to, how large it is, how it may be batched) is
//! asked of the [`Handler`] exactly once per event at admission time. The
//! only required methods are [`Handler::path`] and [`Handler::handle`]; the
//! rest have conservative defaults that disable the corresponding feature.

use std::fmt::Debug;
use std::hash::Hash;

use crate::error::DropReason;

/// Marker for area identifiers: a group of paths sharing a memory budget.
///
/// `Default` supplies the zero-area used when the handler does not override
/// [`Handler::area`], putting every path in a single shared area.
pub trait Area: Clone + Default + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Default + Eq + Hash + Debug + Send + Sync + 'static> Area for T {}

/// Marker for path identifiers: the unit of ordering.
pub trait Path: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> Path for T {}

/// Marker for events. Opaque to the stream.
pub trait Event: Send + 'static {}
impl<T: Send + 'static> Event for T {}

/// Marker for destinations, carried alongside a path and handed back to the
/// handler with every batch. Cloned into feedback records.
pub trait Dest: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> Dest for T {}

/// The timestamp an event carries, e.g. the commit timestamp of a change.
///
/// Within a path, events are expected to arrive with non-decreasing
/// timestamps; the stream does not verify or enforce this. Zero (the default)
/// means arrival order.
pub type Timestamp = u64;

/// How the stream treats an event during admission and batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventProperty {
    /// Data-carrying events that may be handled in batches.
    #[default]
    BatchableData,
    /// Periodic signal events: they carry no payload of their own, only the
    /// fact that something happened. Newer signals of the same data group
    /// supersede queued older ones, and they are admitted even when the path
    /// is paused so memory-control signalling keeps flowing.
    PeriodicSignal,
    /// Events that must be handled strictly one at a time.
    NonBatchable,
}

/// Grouping key for batch formation.
///
/// Only consecutive events with the same `EventType` (both fields equal) are
/// handed to the handler in one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventType {
    /// Handler-defined group; events from different groups never share a
    /// batch.
    pub data_group: u64,
    /// Admission and batching behaviour.
    pub property: EventProperty,
}

/// Outcome of a [`Handler::handle`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// The batch is fully processed; the path is immediately eligible for its
    /// next batch.
    Done,
    /// The handler took ownership of the batch and will finish it
    /// asynchronously. The path stays parked until its identifier is sent on
    /// the wake channel.
    Await,
}

/// The callbacks a host supplies to drive a dynamic stream.
///
/// All methods are invoked by stream workers: possibly concurrently across
/// paths, never concurrently for the same path. `handle` must not block on
/// external I/O: the scheduling model assumes CPU-bound work, and a blocking
/// handler delays every other path sharing the same worker (without
/// corrupting ordering). Asynchronous work returns [`HandleResult::Await`]
/// and signals completion through the wake channel instead.
///
/// ## Example
///
/// ```ignore
/// struct Sink;
///
/// impl Handler<(), u64, Record, String> for Sink {
///     fn path(&self, event: &Record) -> u64 {
///         event.table_id
///     }
///
///     fn handle(&self, dest: &String, events: &mut Vec<Record>) -> HandleResult {
///         for event in events.iter() {
///             apply(dest, event);
///         }
///         HandleResult::Done
///     }
///
///     fn size(&self, event: &Record) -> usize {
///         event.payload.len()
///     }
/// }
/// ```
pub trait Handler<A: Area, P: Path, T: Event, D: Dest>: Send + Sync + 'static {
    /// The path the event belongs to. Called once per event.
    fn path(&self, event: &T) -> P;

    /// Process a non-empty batch of events for one path.
    ///
    /// The batch arrives in a mutable buffer. A handler that completes
    /// synchronously may simply read the events and return
    /// [`HandleResult::Done`]; whatever remains in the buffer is released by
    /// the stream without further callbacks. A handler returning
    /// [`HandleResult::Await`] must take ownership of the events it defers
    /// (`drain` or `mem::take`) before returning.
    ///
    /// If this method panics, the panic is contained: the remaining buffer
    /// contents are reported through [`on_drop`](Self::on_drop) with
    /// [`DropReason::HandlerPanic`] and the worker moves on.
    fn handle(&self, dest: &D, events: &mut Vec<T>) -> HandleResult;

    /// Memory charged for the event, in bytes. Called once per event.
    ///
    /// The default of 0 effectively disables memory control: areas never
    /// accumulate pending bytes.
    fn size(&self, _event: &T) -> usize {
        0
    }

    /// Whether the upstream producer currently believes this path is paused.
    ///
    /// Memory control compares this against the local pause state and emits a
    /// corrective feedback when they disagree, so upstreams that missed a
    /// signal eventually resynchronize.
    fn is_paused(&self, _event: &T) -> bool {
        false
    }

    /// The area of a path. Called once per path, at registration.
    ///
    /// The default places every path in `A::default()`.
    fn area(&self, _path: &P, _dest: &D) -> A {
        A::default()
    }

    /// The timestamp the event carries. Called once per event.
    fn timestamp(&self, _event: &T) -> Timestamp {
        0
    }

    /// The batching type of the event. Called once per event.
    fn event_type(&self, _event: &T) -> EventType {
        EventType::default()
    }

    /// Called when an event is discarded instead of delivered.
    ///
    /// Never invoked for [`EventProperty::PeriodicSignal`] events: superseded
    /// or drained signals disappear silently by contract.
    fn on_drop(&self, _event: T, _reason: DropReason) {}
}
