//! DNS naming constants.

/// Namespace used when a manifest does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Cluster DNS suffix appended to `<name>.<service>.<namespace>`.
pub const CLUSTER_DOMAIN: &str = "svc.cluster.local";
