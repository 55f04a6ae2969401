use serde::{Deserialize, Serialize};

/// A published DNS A record for one ready replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsRecord {
    /// `<replica>.<service>.<namespace>.svc.cluster.local`
    pub fqdn: String,
    /// Pod address the record resolves to
    pub target: String,
}
