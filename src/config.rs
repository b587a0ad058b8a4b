//! Stream and area configuration with normalization of out-of-range values.

use std::time::Duration;

/// Default rebalance cadence.
pub const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(1);
/// Default load-report cadence.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(500);
/// Default per-area pending-byte budget: 128 MiB.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 128 << 20;
/// Default per-area feedback rate limit.
pub const DEFAULT_FEEDBACK_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for a dynamic stream.
///
/// All fields have usable defaults; zero values are normalized at
/// construction rather than rejected.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// How often the scheduler evaluates worker load and migrates paths.
    pub scheduler_interval: Duration,
    /// How often worker load statistics are sampled for the scheduler.
    pub report_interval: Duration,
    /// Number of worker threads. 0 means one per logical CPU.
    pub worker_count: usize,
    /// Maximum events per handler invocation. Values ≤ 1 disable batching.
    pub batch_count: usize,
    /// Enables area memory accounting, overflow drops and pause/resume
    /// feedback. Off by default.
    pub enable_memory_control: bool,
    /// Capacity of the ingress channel. `None` means unbounded; with a bound,
    /// producers block once the router falls behind by this many events.
    pub in_channel_capacity: Option<usize>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            scheduler_interval: DEFAULT_SCHEDULER_INTERVAL,
            report_interval: DEFAULT_REPORT_INTERVAL,
            worker_count: 0,
            batch_count: 1,
            enable_memory_control: false,
            in_channel_capacity: None,
        }
    }
}

impl StreamConfig {
    /// Replace zero values with their effective defaults.
    #[must_use]
    pub(crate) fn normalized(mut self) -> Self {
        if self.worker_count == 0 {
            self.worker_count = std::thread::available_parallelism().map_or(1, usize::from);
        }
        if self.batch_count == 0 {
            self.batch_count = 1;
        }
        if self.scheduler_interval.is_zero() {
            self.scheduler_interval = DEFAULT_SCHEDULER_INTERVAL;
        }
        if self.report_interval.is_zero() {
            self.report_interval = DEFAULT_REPORT_INTERVAL;
        }
        self
    }
}

/// Per-area memory-control settings.
///
/// Supplied either at path registration or later through
/// `set_area_settings`; late updates take effect on the next scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaSettings {
    /// Budget for the aggregate pending bytes of the area's paths. 0
    /// normalizes to [`DEFAULT_MAX_PENDING_BYTES`].
    pub max_pending_bytes: usize,
    /// Minimum spacing of re-synchronization feedback per (area, path).
    /// `None` disables feedback for the area entirely.
    pub feedback_interval: Option<Duration>,
}

impl Default for AreaSettings {
    fn default() -> Self {
        Self {
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            feedback_interval: Some(DEFAULT_FEEDBACK_INTERVAL),
        }
    }
}

impl AreaSettings {
    #[must_use]
    pub(crate) fn normalized(mut self) -> Self {
        if self.max_pending_bytes == 0 {
            self.max_pending_bytes = DEFAULT_MAX_PENDING_BYTES;
        }
        self
    }
}
