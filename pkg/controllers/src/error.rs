//! Error types for the ordered replica set controller.

/// Result type alias using [`ControllerError`].
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors raised by the reconciler core and its collaborators.
///
/// Per-ordinal failures of external systems (provisioning, startup) are not
/// errors: they are recorded as conditions on the set and retried.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Desired state rejected at the boundary; nothing was applied.
    #[error("invalid spec for {set}: {reason}")]
    InvalidSpec {
        /// Set the manifest was meant for.
        set: String,
        /// Validation message.
        reason: String,
    },

    /// A replica phase change the state machine does not allow.
    #[error("replica {ordinal}: invalid transition from {from} to {to}")]
    InvalidTransition {
        ordinal: u32,
        from: &'static str,
        to: &'static str,
    },

    /// Attaching a claim that is still attached to another instance.
    #[error("claim {claim} is attached to {holder}, refusing to attach to {requester}")]
    VolumeInUse {
        claim: String,
        holder: String,
        requester: String,
    },

    /// The ordinal has no slot (replica or binding) in this set.
    #[error("unknown ordinal {0}")]
    UnknownOrdinal(u32),
}

impl ControllerError {
    /// Create an invalid spec error.
    #[must_use]
    pub fn invalid_spec(set: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            set: set.into(),
            reason: reason.into(),
        }
    }
}
