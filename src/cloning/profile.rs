use crate::governance::status::SignOffState;
use crate::state::kinds::{InstanceStatus, VersioningProfile};
use crate::state::models::{AuditEntry, FileInstance};

/// Whether `profile` carries `instance` into the clone.
///
/// `history` is the instance's own audit trail.
pub fn admits(
    profile: VersioningProfile,
    instance: &FileInstance,
    history: &[&AuditEntry],
) -> bool {
    match profile {
        VersioningProfile::LatestApproved => {
            instance.status == InstanceStatus::Active
                && SignOffState::from_entries(history.iter().copied()).reviewer
        }
        VersioningProfile::FullHistoryNoSuperseded => matches!(
            instance.status,
            InstanceStatus::Active | InstanceStatus::Rejected
        ),
        VersioningProfile::CarbonCopyForensic => true,
    }
}

/// Whether the clone replays the source audit trail instead of writing one
/// CLONE_FILE entry per copied instance.
pub fn replays_audit(profile: VersioningProfile) -> bool {
    profile == VersioningProfile::CarbonCopyForensic
}
