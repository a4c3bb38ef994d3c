use std::time::Duration;

/// Default emulator command-channel port.
pub const DEFAULT_PORT: u16 = 55355;

/// Default per-request transport timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(64);

/// Default monitor tick interval (≈60 Hz).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(16);

/// Default cadence of the freeze write-back pass.
pub const DEFAULT_WRITE_BACK_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum spacing between connection probes while the emulator is down.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Default per-subscriber event queue capacity.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

/// Default property-evaluation worker pool size.
pub const DEFAULT_WORKER_POOL: usize = 5;

/// Default per-property history ring capacity.
pub const DEFAULT_HISTORY_SIZE: usize = 64;

/// Default batch request queue capacity.
pub const DEFAULT_BATCH_QUEUE: usize = 32;

/// Default whole-batch timeout.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport failures are logged on the first occurrence and then once per
/// this many consecutive failures.
pub const FAILURE_LOG_CADENCE: u64 = 64;

/// Bound on per-property retained validation events.
pub const RECENT_EVENT_CAP: usize = 8;
