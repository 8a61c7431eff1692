use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::kinds::{AuditAction, Capacity, InstanceStatus, Workflow};
use crate::state::models::AuditEntry;

/// Governance state of one file instance, derived from its audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GovernanceStatus {
    PendingDoer,
    PendingReview,
    FullyApproved,
    Rejected,
    Superseded,
}

impl GovernanceStatus {
    pub fn is_approved(&self) -> bool {
        matches!(self, GovernanceStatus::FullyApproved)
    }
}

impl fmt::Display for GovernanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GovernanceStatus::PendingDoer => "Pending Doer",
            GovernanceStatus::PendingReview => "Pending Review",
            GovernanceStatus::FullyApproved => "Approved",
            GovernanceStatus::Rejected => "Rejected",
            GovernanceStatus::Superseded => "Superseded",
        };
        f.write_str(s)
    }
}

/// Which signatures currently stand on an instance.
///
/// For each capacity the latest SIGN_OFF or REVOKE wins, so a revoke only
/// cancels the signature of its own capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignOffState {
    pub doer: bool,
    pub reviewer: bool,
}

impl SignOffState {
    /// Folds entries (already filtered to one instance) in id order.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a AuditEntry>) -> Self {
        let mut ordered: Vec<&AuditEntry> = entries.into_iter().collect();
        ordered.sort_by_key(|e| e.id);

        let mut state = SignOffState::default();
        for entry in ordered {
            let signed = match entry.action {
                AuditAction::SignOff => true,
                AuditAction::Revoke => false,
                _ => continue,
            };
            match entry.capacity {
                Capacity::Doer => state.doer = signed,
                c if c.is_reviewer_equivalent() => state.reviewer = signed,
                _ => {}
            }
        }
        state
    }
}

/// Pure status derivation; `entries` must belong to the instance.
pub fn derive_status(
    instance_status: InstanceStatus,
    workflow: Workflow,
    entries: &[AuditEntry],
) -> GovernanceStatus {
    match instance_status {
        InstanceStatus::Rejected => return GovernanceStatus::Rejected,
        InstanceStatus::Superseded => return GovernanceStatus::Superseded,
        InstanceStatus::Active => {}
    }

    let signed = SignOffState::from_entries(entries);
    match workflow {
        Workflow::DoerOnly if signed.doer => GovernanceStatus::FullyApproved,
        Workflow::DoerOnly => GovernanceStatus::PendingDoer,
        Workflow::DoerAndReviewer => match (signed.doer, signed.reviewer) {
            (true, true) => GovernanceStatus::FullyApproved,
            (true, false) => GovernanceStatus::PendingReview,
            (false, _) => GovernanceStatus::PendingDoer,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::kinds::{FileRef, Stage, Target};

    fn entry(id: i64, action: AuditAction, capacity: Capacity) -> AuditEntry {
        AuditEntry {
            id,
            timestamp: format!("2025-01-01T00:00:{:02}Z", id),
            actor: "alice".into(),
            action,
            target: Target::File(FileRef::new(Stage::Models, 1)),
            capacity,
            comment: Some("ok".into()),
        }
    }

    #[test]
    fn reviewer_before_doer_still_needs_doer() {
        let entries = vec![entry(2, AuditAction::SignOff, Capacity::Reviewer)];
        assert_eq!(
            derive_status(InstanceStatus::Active, Workflow::DoerAndReviewer, &entries),
            GovernanceStatus::PendingDoer
        );
    }

    #[test]
    fn revoke_cancels_only_its_capacity() {
        let entries = vec![
            entry(1, AuditAction::SignOff, Capacity::Doer),
            entry(2, AuditAction::SignOff, Capacity::Reviewer),
            entry(3, AuditAction::Revoke, Capacity::Reviewer),
        ];
        assert_eq!(
            derive_status(InstanceStatus::Active, Workflow::DoerAndReviewer, &entries),
            GovernanceStatus::PendingReview
        );
    }

    #[test]
    fn status_column_wins_over_signatures() {
        let entries = vec![entry(1, AuditAction::SignOff, Capacity::Doer)];
        assert_eq!(
            derive_status(InstanceStatus::Superseded, Workflow::DoerOnly, &entries),
            GovernanceStatus::Superseded
        );
    }
}
