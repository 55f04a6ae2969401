//! State store key layout.

/// Desired state: `/registry/orderedsets/<ns>/<name>`.
pub const ORDERED_SET_PREFIX: &str = "/registry/orderedsets/";

/// One record per `(set, ordinal)`: `/registry/replicas/<ns>/<set>/<ordinal>`.
pub const REPLICA_PREFIX: &str = "/registry/replicas/";

/// One record per volume binding: `/registry/volumebindings/<ns>/<set>/<ordinal>`.
/// Never deleted by the controller.
pub const VOLUME_BINDING_PREFIX: &str = "/registry/volumebindings/";

/// Capacity of the in-memory watch event ring buffer.
pub const EVENT_LOG_CAPACITY: usize = 1024;
