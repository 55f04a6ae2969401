//! Ordered replica set controller.
//!
//! [`reconciler::SetReconciler`] holds the per-set state machine and decides
//! what to do next; [`controller::SetController`] runs it against the
//! runtime, provisioner and DNS backends, and [`manager::OrderedSetManager`]
//! starts one controller per set stored under `/registry/orderedsets/`.

pub mod backoff;
pub mod binder;
pub mod checkpoint;
pub mod controller;
pub mod desired;
pub mod dns;
pub mod error;
pub mod identity;
pub mod interfaces;
pub mod manager;
pub mod memory;
pub mod reconciler;
pub mod replica;

pub use controller::{Backends, ControllerOptions, SetController, SetHandle};
pub use error::{ControllerError, ControllerResult};
pub use interfaces::{DnsBackend, RuntimeDriver, SpecSource, VolumeProvisioner};
pub use manager::{OrderedSetManager, SetRegistry, StoreSpecSource, apply_set, delete_set};
pub use reconciler::{ReconcilerConfig, SetReconciler};
