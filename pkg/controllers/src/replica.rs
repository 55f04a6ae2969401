//! Per-ordinal replica lifecycle.
//!
//! ```text
//! Pending ──▶ Creating ──▶ Ready ──▶ Terminating ──▶ Gone
//!    │           │  │        │            ▲            │
//!    │           │  └────────┼──▶ Failed ─┘            │
//!    │           └───────────┴───────────▶┘            │
//!    └──────────────────────────────────▶ Gone ──▶ Pending
//! ```
//!
//! The phase is the only source of truth for where a slot is in its
//! lifecycle; readiness flapping of a Ready instance is tracked separately
//! in `observed_ready`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, ControllerResult};
use crate::identity::replica_name;
use pkg_types::orderedset::ReplicaPhase;

/// One ordinal slot of a set. Survives any number of instance replacements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Replica {
    pub ordinal: u32,
    pub name: String,
    pub phase: ReplicaPhase,
    /// Claim bound to this ordinal, once the binder has one.
    #[serde(default)]
    pub volume_claim_ref: Option<String>,
    /// UID of the instance currently backing this ordinal.
    #[serde(default)]
    pub pod_ref: Option<String>,
    /// Address reported by the runtime for the current instance.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub observed_ready: bool,
    /// Template revision the current instance was created from.
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub restart_count: u32,
    /// Earliest time the next restart or delete retry may be issued.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    /// Most recent startup failure; cleared once the ordinal is ready again.
    #[serde(default)]
    pub last_failure: Option<String>,
    pub last_transition: DateTime<Utc>,
}

/// A recorded phase change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub ordinal: u32,
    pub from: ReplicaPhase,
    pub to: ReplicaPhase,
    pub at: DateTime<Utc>,
}

/// Whether the state machine allows moving from `from` to `to`.
pub fn can_transition(from: &ReplicaPhase, to: &ReplicaPhase) -> bool {
    use ReplicaPhase::*;
    matches!(
        (from, to),
        (Pending, Creating)
            | (Pending, Gone)
            | (Creating, Ready)
            | (Creating, Failed(_))
            | (Creating, Terminating(_))
            | (Ready, Terminating(_))
            | (Ready, Failed(_))
            | (Failed(_), Terminating(_))
            | (Terminating(_), Gone)
            | (Gone, Pending)
    )
}

impl Replica {
    /// A fresh slot in `Pending`.
    pub fn new(set_name: &str, ordinal: u32, now: DateTime<Utc>) -> Self {
        Self {
            ordinal,
            name: replica_name(set_name, ordinal),
            phase: ReplicaPhase::Pending,
            volume_claim_ref: None,
            pod_ref: None,
            address: None,
            observed_ready: false,
            revision: None,
            restart_count: 0,
            retry_at: None,
            last_failure: None,
            last_transition: now,
        }
    }

    /// Ready for ordering and DNS purposes.
    pub fn is_ready(&self) -> bool {
        self.phase == ReplicaPhase::Ready && self.observed_ready
    }

    /// Whether an instance may exist in the runtime for this slot.
    pub fn has_instance(&self) -> bool {
        self.pod_ref.is_some()
            && !matches!(self.phase, ReplicaPhase::Pending | ReplicaPhase::Gone)
    }

    /// Move to `to`, or fail without changing anything.
    ///
    /// Leaving `Ready` clears `observed_ready`; entering `Gone` forgets the
    /// instance. The claim reference is kept: it belongs to the ordinal.
    pub fn transition(
        &mut self,
        to: ReplicaPhase,
        now: DateTime<Utc>,
    ) -> ControllerResult<Transition> {
        if !can_transition(&self.phase, &to) {
            return Err(ControllerError::InvalidTransition {
                ordinal: self.ordinal,
                from: self.phase.name(),
                to: to.name(),
            });
        }
        let from = std::mem::replace(&mut self.phase, to.clone());
        if from == ReplicaPhase::Ready {
            self.observed_ready = false;
        }
        match &self.phase {
            ReplicaPhase::Gone => {
                self.pod_ref = None;
                self.address = None;
                self.observed_ready = false;
                self.retry_at = None;
            }
            ReplicaPhase::Creating => {
                self.retry_at = None;
            }
            _ => {}
        }
        self.last_transition = now;
        Ok(Transition {
            ordinal: self.ordinal,
            from,
            to,
            at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::orderedset::TerminationCause;

    #[test]
    fn test_full_lifecycle() {
        let now = Utc::now();
        let mut replica = Replica::new("web", 1, now);
        assert_eq!(replica.name, "web-1");
        assert_eq!(replica.phase, ReplicaPhase::Pending);

        replica.pod_ref = Some("uid-1".to_string());
        replica.transition(ReplicaPhase::Creating, now).unwrap();
        replica.transition(ReplicaPhase::Ready, now).unwrap();
        replica.observed_ready = true;
        assert!(replica.is_ready());

        let t = replica
            .transition(ReplicaPhase::Terminating(TerminationCause::External), now)
            .unwrap();
        assert_eq!(t.from, ReplicaPhase::Ready);
        assert!(!replica.observed_ready);
        assert!(replica.has_instance());

        replica.transition(ReplicaPhase::Gone, now).unwrap();
        assert!(replica.pod_ref.is_none());
        assert!(!replica.has_instance());

        replica.transition(ReplicaPhase::Pending, now).unwrap();
        assert_eq!(replica.name, "web-1");
        assert_eq!(replica.ordinal, 1);
    }

    #[test]
    fn test_claim_ref_survives_gone() {
        let now = Utc::now();
        let mut replica = Replica::new("db", 0, now);
        replica.volume_claim_ref = Some("data-db-0".to_string());
        replica.transition(ReplicaPhase::Creating, now).unwrap();
        replica
            .transition(ReplicaPhase::Terminating(TerminationCause::ScaleDown), now)
            .unwrap();
        replica.transition(ReplicaPhase::Gone, now).unwrap();
        assert_eq!(replica.volume_claim_ref.as_deref(), Some("data-db-0"));
    }

    #[test]
    fn test_rejected_transitions() {
        let now = Utc::now();
        let mut replica = Replica::new("web", 0, now);
        let err = replica.transition(ReplicaPhase::Ready, now).unwrap_err();
        assert!(matches!(
            err,
            ControllerError::InvalidTransition {
                from: "Pending",
                to: "Ready",
                ..
            }
        ));
        assert_eq!(replica.phase, ReplicaPhase::Pending);

        assert!(!can_transition(&ReplicaPhase::Gone, &ReplicaPhase::Creating));
        assert!(!can_transition(
            &ReplicaPhase::Failed("x".into()),
            &ReplicaPhase::Pending
        ));
        assert!(!can_transition(
            &ReplicaPhase::Terminating(TerminationCause::Update),
            &ReplicaPhase::Ready
        ));
        assert!(can_transition(
            &ReplicaPhase::Creating,
            &ReplicaPhase::Failed("crash".into())
        ));
    }
}
