use anyhow::{Result, bail};

use crate::orderedset::OrderedSet;
use pkg_constants::controller::MAX_REPLICAS;

/// Longest set name whose replica names (`<name>-<ordinal>`) still fit a
/// 63-character DNS label for any `u32` ordinal.
pub const MAX_SET_NAME_LEN: usize = 63 - 11;

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Validate an OrderedSet manifest before it becomes desired state.
/// A rejected manifest must have no effect on the running set.
pub fn validate_ordered_set(set: &OrderedSet) -> Result<()> {
    validate_name(&set.name)?;
    if set.name.len() > MAX_SET_NAME_LEN {
        bail!(
            "set name '{}' exceeds {} characters; replica names would not fit a DNS label",
            set.name,
            MAX_SET_NAME_LEN
        );
    }
    validate_name(&set.namespace)?;
    validate_name(&set.spec.service_name)
        .map_err(|e| anyhow::anyhow!("invalid service name: {}", e))?;
    if set.spec.replicas < 0 {
        bail!("replicas must not be negative (got {})", set.spec.replicas);
    }
    if set.spec.replicas > MAX_REPLICAS {
        bail!(
            "replicas must not exceed {} (got {})",
            MAX_REPLICAS,
            set.spec.replicas
        );
    }
    if set.spec.update_partition < 0 {
        bail!(
            "update partition must not be negative (got {})",
            set.spec.update_partition
        );
    }
    if set.spec.template.containers.is_empty() {
        bail!("pod template must declare at least one container");
    }
    if let Some(vct) = &set.spec.volume_claim_template {
        validate_name(&vct.name)
            .map_err(|e| anyhow::anyhow!("invalid volume claim template name: {}", e))?;
    }
    Ok(())
}
