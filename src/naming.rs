//! Collision-free volume name allocation
//!
//! Derived names follow the `vm-{owner}-disk-{n}` convention. Probing is
//! against a listing snapshot, so two concurrent allocators can still pick
//! the same candidate; the remote uniqueness constraint is the real
//! serialization point and an "already exists" rejection on create moves
//! the caller to the next candidate.

use crate::error::{VolumeError, VolumeResult};

/// Probe ceiling for derived names. Exhaustion is a hard failure.
pub const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Derived name for `owner`'s disk number `n`.
pub fn disk_name(owner: &str, n: u32) -> String {
    format!("vm-{}-disk-{}", owner, n)
}

/// Pick a name for a new volume.
///
/// With an explicit name, collision is a conflict the caller resolves
/// (re-entrant allocate). Without one, probes sequential suffixes against
/// `existing` starting at `first_candidate`.
pub fn allocate_name(
    owner: &str,
    explicit: Option<&str>,
    existing: &[String],
    first_candidate: u32,
) -> VolumeResult<String> {
    if let Some(name) = explicit {
        if existing.iter().any(|e| e == name) {
            return Err(VolumeError::conflict(name.to_string()));
        }
        return Ok(name.to_string());
    }

    for n in first_candidate..MAX_NAME_ATTEMPTS {
        let candidate = disk_name(owner, n);
        if !existing.iter().any(|e| e == &candidate) {
            log::debug!("allocated name {} for owner {}", candidate, owner);
            return Ok(candidate);
        }
    }

    Err(VolumeError::validation(
        "name allocation",
        format!(
            "no free disk name for owner {} within {} attempts",
            owner, MAX_NAME_ATTEMPTS
        ),
    ))
}
