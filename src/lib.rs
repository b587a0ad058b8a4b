//! Dynamic per-path event stream scheduling.
//!
//! A [`DynamicStream`] multiplexes many logical event streams ("paths") onto
//! a bounded pool of worker threads:
//!
//! - Events from the same path are handled sequentially, in admission order,
//!   never concurrently.
//! - Events from different paths are handled in parallel.
//! - Consecutive events of the same [`EventType`] are batched, up to a
//!   configurable bound.
//! - Paths are grouped into areas with a shared pending-byte budget; with
//!   memory control enabled, overflowing admissions are dropped, the
//!   heaviest paths are paused, and pause/resume [`Feedback`] flows back to
//!   upstream producers.
//! - A handler may finish a batch asynchronously by returning
//!   [`HandleResult::Await`] and waking the path later through the
//!   [`WakeSender`].
//! - A periodic scheduler rebalances path ownership across workers by
//!   observed load.
//!
//! The stream is fully generic over the host's area, path, event and
//! destination types; all domain knowledge lives in the host-implemented
//! [`Handler`]. Handlers are assumed CPU-bound: a handler that blocks delays
//! the other paths sharing its worker, though ordering is never violated.
//!
//! There is no global state; every stream instance is self-contained.

pub mod backpressure;
pub mod config;
pub mod error;
pub mod handler;
mod path;
mod properties;
mod scheduler;
mod stream;
mod worker;

pub use backpressure::{AreaSnapshot, Feedback};
pub use config::{
    AreaSettings, DEFAULT_FEEDBACK_INTERVAL, DEFAULT_MAX_PENDING_BYTES, DEFAULT_REPORT_INTERVAL,
    DEFAULT_SCHEDULER_INTERVAL, StreamConfig,
};
pub use error::{DropReason, StreamError};
pub use handler::{
    Area, Dest, Event, EventProperty, EventType, HandleResult, Handler, Path, Timestamp,
};
pub use stream::{DynamicStream, EventSender, PathSnapshot, StreamSnapshot, WakeSender};
pub use worker::WorkerSnapshot;
