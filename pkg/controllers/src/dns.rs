//! Per-replica and aggregate DNS records for the headless service.
//!
//! The registrar is a side-effect sink: it tracks what it believes is
//! published and emits the minimal backend calls to match the ready set.
//! It never influences scheduling.

use std::collections::BTreeMap;
use tracing::debug;

use crate::identity::{dns_label, service_fqdn};
use crate::replica::Replica;
use pkg_types::dns::DnsRecord;

/// Backend call the driver must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsAction {
    Upsert { fqdn: String, address: String },
    /// Aggregate record resolving to every listed address.
    UpsertSet { fqdn: String, addresses: Vec<String> },
    Delete { fqdn: String },
}

pub struct DnsRegistrar {
    service_name: String,
    namespace: String,
    records: BTreeMap<u32, DnsRecord>,
    /// Addresses currently published under the service name, sorted.
    aggregate: Vec<String>,
}

impl DnsRegistrar {
    pub fn new(service_name: &str, namespace: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            namespace: namespace.to_string(),
            records: BTreeMap::new(),
            aggregate: Vec::new(),
        }
    }

    pub fn service_fqdn(&self) -> String {
        service_fqdn(&self.service_name, &self.namespace)
    }

    /// Publish the record of a ready replica. No-op if it is already
    /// published with the same address, or if the replica is not ready.
    pub fn publish(&mut self, replica: &Replica) -> Vec<DnsAction> {
        let Some(address) = replica.address.as_ref().filter(|_| replica.is_ready()) else {
            return Vec::new();
        };
        let record = DnsRecord {
            fqdn: dns_label(&replica.name, &self.service_name, &self.namespace),
            target: address.clone(),
        };
        if self.records.get(&replica.ordinal) == Some(&record) {
            return Vec::new();
        }
        debug!("DNS publish {} -> {}", record.fqdn, record.target);
        let mut actions = vec![DnsAction::Upsert {
            fqdn: record.fqdn.clone(),
            address: record.target.clone(),
        }];
        self.records.insert(replica.ordinal, record);
        actions.extend(self.refresh_aggregate());
        actions
    }

    /// Remove the record of `ordinal`, if published.
    pub fn retract(&mut self, ordinal: u32) -> Vec<DnsAction> {
        let Some(record) = self.records.remove(&ordinal) else {
            return Vec::new();
        };
        debug!("DNS retract {}", record.fqdn);
        let mut actions = vec![DnsAction::Delete { fqdn: record.fqdn }];
        actions.extend(self.refresh_aggregate());
        actions
    }

    /// Bring the published set in line with the ready replicas.
    pub fn sync<'a>(&mut self, replicas: impl IntoIterator<Item = &'a Replica>) -> Vec<DnsAction> {
        let mut actions = Vec::new();
        let mut ready = Vec::new();
        for replica in replicas {
            if replica.is_ready() && replica.address.is_some() {
                ready.push(replica.ordinal);
                actions.extend(self.publish(replica));
            }
        }
        let stale: Vec<u32> = self
            .records
            .keys()
            .copied()
            .filter(|o| !ready.contains(o))
            .collect();
        for ordinal in stale {
            actions.extend(self.retract(ordinal));
        }
        actions
    }

    /// Switch to a different service name. Every published record is
    /// deleted; the next sync republishes under the new name.
    pub fn rename_service(&mut self, service_name: &str) -> Vec<DnsAction> {
        if service_name == self.service_name {
            return Vec::new();
        }
        let mut actions: Vec<DnsAction> = std::mem::take(&mut self.records)
            .into_values()
            .map(|r| DnsAction::Delete { fqdn: r.fqdn })
            .collect();
        if !self.aggregate.is_empty() {
            actions.push(DnsAction::Delete {
                fqdn: self.service_fqdn(),
            });
            self.aggregate.clear();
        }
        self.service_name = service_name.to_string();
        actions
    }

    /// Drop a record whose backend call failed so the next sync re-issues it.
    pub fn forget(&mut self, fqdn: &str) {
        if fqdn == self.service_fqdn() {
            self.aggregate.clear();
            return;
        }
        self.records.retain(|_, r| r.fqdn != fqdn);
    }

    pub fn records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.records.values()
    }

    /// Addresses the aggregate service record resolves to.
    pub fn aggregate(&self) -> &[String] {
        &self.aggregate
    }

    fn refresh_aggregate(&mut self) -> Option<DnsAction> {
        let mut addresses: Vec<String> = self.records.values().map(|r| r.target.clone()).collect();
        addresses.sort();
        addresses.dedup();
        if addresses == self.aggregate {
            return None;
        }
        let fqdn = self.service_fqdn();
        self.aggregate = addresses.clone();
        if addresses.is_empty() {
            Some(DnsAction::Delete { fqdn })
        } else {
            Some(DnsAction::UpsertSet { fqdn, addresses })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_types::orderedset::ReplicaPhase;

    fn ready_replica(ordinal: u32, address: &str) -> Replica {
        let mut r = Replica::new("web", ordinal, Utc::now());
        r.phase = ReplicaPhase::Ready;
        r.observed_ready = true;
        r.address = Some(address.to_string());
        r
    }

    #[test]
    fn test_publish_is_idempotent() {
        let mut dns = DnsRegistrar::new("nginx", "default");
        let r0 = ready_replica(0, "10.0.0.1");

        let actions = dns.publish(&r0);
        assert_eq!(
            actions,
            vec![
                DnsAction::Upsert {
                    fqdn: "web-0.nginx.default.svc.cluster.local".into(),
                    address: "10.0.0.1".into()
                },
                DnsAction::UpsertSet {
                    fqdn: "nginx.default.svc.cluster.local".into(),
                    addresses: vec!["10.0.0.1".into()]
                },
            ]
        );
        assert!(dns.publish(&r0).is_empty());
    }

    #[test]
    fn test_not_ready_is_not_published() {
        let mut dns = DnsRegistrar::new("nginx", "default");
        let mut r0 = ready_replica(0, "10.0.0.1");
        r0.observed_ready = false;
        assert!(dns.publish(&r0).is_empty());
        assert_eq!(dns.records().count(), 0);
    }

    #[test]
    fn test_aggregate_tracks_union() {
        let mut dns = DnsRegistrar::new("nginx", "default");
        dns.publish(&ready_replica(1, "10.0.0.2"));
        dns.publish(&ready_replica(0, "10.0.0.1"));
        assert_eq!(dns.aggregate(), &["10.0.0.1", "10.0.0.2"]);

        let actions = dns.retract(1);
        assert_eq!(
            actions[1],
            DnsAction::UpsertSet {
                fqdn: "nginx.default.svc.cluster.local".into(),
                addresses: vec!["10.0.0.1".into()]
            }
        );

        let actions = dns.retract(0);
        assert_eq!(
            actions[1],
            DnsAction::Delete {
                fqdn: "nginx.default.svc.cluster.local".into()
            }
        );
        assert!(dns.retract(0).is_empty());
    }

    #[test]
    fn test_sync_matches_ready_set() {
        let mut dns = DnsRegistrar::new("nginx", "default");
        let r0 = ready_replica(0, "10.0.0.1");
        let mut r1 = ready_replica(1, "10.0.0.2");
        dns.sync([&r0, &r1]);
        assert_eq!(dns.records().count(), 2);

        r1.observed_ready = false;
        let actions = dns.sync([&r0, &r1]);
        assert!(actions.contains(&DnsAction::Delete {
            fqdn: "web-1.nginx.default.svc.cluster.local".into()
        }));
        let fqdns: Vec<&str> = dns.records().map(|r| r.fqdn.as_str()).collect();
        assert_eq!(fqdns, vec!["web-0.nginx.default.svc.cluster.local"]);

        assert!(dns.sync([&r0, &r1]).is_empty());
    }

    #[test]
    fn test_rename_and_forget() {
        let mut dns = DnsRegistrar::new("nginx", "default");
        let r0 = ready_replica(0, "10.0.0.1");
        dns.publish(&r0);

        let actions = dns.rename_service("web");
        assert_eq!(actions.len(), 2);
        assert_eq!(dns.records().count(), 0);

        dns.sync([&r0]);
        dns.forget("web-0.web.default.svc.cluster.local");
        let actions = dns.sync([&r0]);
        assert_eq!(
            actions,
            vec![DnsAction::Upsert {
                fqdn: "web-0.web.default.svc.cluster.local".into(),
                address: "10.0.0.1".into()
            }]
        );
    }
}
