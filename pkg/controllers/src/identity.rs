//! Deterministic names for replicas, claims and DNS records.
//!
//! Everything here is a pure function of stable inputs, so a replica keeps
//! its identity no matter how often its instance is replaced.

use pkg_constants::network::CLUSTER_DOMAIN;

/// `<set>-<ordinal>`
pub fn replica_name(set_name: &str, ordinal: u32) -> String {
    format!("{}-{}", set_name, ordinal)
}

/// `<replica>.<service>.<namespace>.svc.cluster.local`
pub fn dns_label(replica_name: &str, service_name: &str, namespace: &str) -> String {
    format!(
        "{}.{}.{}.{}",
        replica_name, service_name, namespace, CLUSTER_DOMAIN
    )
}

/// Aggregate record resolving to every ready replica of the service.
pub fn service_fqdn(service_name: &str, namespace: &str) -> String {
    format!("{}.{}.{}", service_name, namespace, CLUSTER_DOMAIN)
}

/// `<template>-<set>-<ordinal>`
pub fn claim_name(template_name: &str, set_name: &str, ordinal: u32) -> String {
    format!("{}-{}", template_name, replica_name(set_name, ordinal))
}

/// Inverse of [`replica_name`]. Rejects names of other sets, including sets
/// whose name merely shares the prefix (`web` vs `web-1-0`).
pub fn parse_ordinal(set_name: &str, replica_name: &str) -> Option<u32> {
    let suffix = replica_name.strip_prefix(set_name)?.strip_prefix('-')?;
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if suffix.len() > 1 && suffix.starts_with('0') {
        return None;
    }
    suffix.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_deterministic() {
        assert_eq!(replica_name("web", 0), "web-0");
        assert_eq!(replica_name("web", 12), "web-12");
        assert_eq!(claim_name("data", "web", 2), "data-web-2");
        assert_eq!(
            dns_label("web-2", "nginx", "default"),
            "web-2.nginx.default.svc.cluster.local"
        );
        assert_eq!(
            service_fqdn("nginx", "default"),
            "nginx.default.svc.cluster.local"
        );
    }

    #[test]
    fn names_do_not_collide() {
        let names: HashSet<String> = (0..1000).map(|i| replica_name("db", i)).collect();
        assert_eq!(names.len(), 1000);
    }

    #[test]
    fn parse_ordinal_inverts_replica_name() {
        for ordinal in [0, 1, 9, 10, 4_000_000_000] {
            assert_eq!(
                parse_ordinal("web", &replica_name("web", ordinal)),
                Some(ordinal)
            );
        }
        assert_eq!(parse_ordinal("web", "web"), None);
        assert_eq!(parse_ordinal("web", "web-"), None);
        assert_eq!(parse_ordinal("web", "web-01"), None);
        assert_eq!(parse_ordinal("web", "web-1-0"), None);
        assert_eq!(parse_ordinal("web", "db-0"), None);
        assert_eq!(parse_ordinal("web-1", "web-1-0"), Some(0));
    }
}
