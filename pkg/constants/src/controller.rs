//! Reconciliation timing constants.

/// How often a set controller runs a pass without any incoming event.
/// Drives backoff retries and stall detection.
pub const RESYNC_INTERVAL_SECS: u64 = 10;

/// An `Ordered` pass blocked on the same ordinal for longer than this
/// raises a `StalledOrdering` condition.
pub const STALL_THRESHOLD_SECS: u64 = 300;

/// First retry delay for claim provisioning, instance restarts and deletes.
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound for the exponential retry delay.
pub const BACKOFF_MAX_SECS: u64 = 300;

/// Number of transitions kept in a set's in-memory journal.
pub const TRANSITION_JOURNAL_CAPACITY: usize = 1024;

/// Buffer size of a set controller's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Largest replica count a manifest may request.
pub const MAX_REPLICAS: i32 = 10_000;
