//! Data model for ordered replica sets: desired state manifests, pod and
//! volume templates, volume bindings, DNS records and configuration files.

pub mod config;
pub mod dns;
pub mod orderedset;
pub mod pod;
pub mod validate;
pub mod volume;
