//! Error and drop-reason types for the dynamic stream.

use thiserror::Error;

/// Errors returned by the mutating operations of a dynamic stream.
///
/// The set is deliberately small: everything else that can go wrong with an
/// individual event is reported through [`Handler::on_drop`] with a
/// [`DropReason`] instead of surfacing as a `Result`.
///
/// [`Handler::on_drop`]: crate::Handler::on_drop
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The path is already registered; remove it first or ignore the error.
    #[error("path already exists")]
    Duplicate,
    /// The path is not registered.
    #[error("path does not exist")]
    NotExist,
    /// The stream has been closed; no mutating call can succeed anymore.
    #[error("stream is closed")]
    Closed,
}

/// Why an event was discarded instead of being delivered to the handler.
///
/// Passed to [`Handler::on_drop`]. `PeriodicSignal` events are exempt from
/// the drop callback entirely, whatever the reason.
///
/// [`Handler::on_drop`]: crate::Handler::on_drop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// No path was registered for the event at admission time.
    PathUnknown,
    /// The path was removed while the event was queued or in flight.
    PathRemoved,
    /// The path is paused by memory control.
    PathPaused,
    /// Admitting the event would overflow the area memory budget.
    AreaFull,
    /// The handler panicked while processing the batch containing the event.
    HandlerPanic,
    /// The stream was closed with the event still queued or undelivered.
    ShutdownDrain,
}
