//! Bounty lifecycle rules.
//!
//! A bounty is open from its first funding commitment until it is
//! completed (winning submission paid) or cancelled. Terminal states
//! are final: there is no reopen transition, even if the underlying
//! GitHub issue is reopened.

use crate::error::{EngineError, Result};
use crate::models::Bounty;

/// Why a bounty moved to cancelled. Drives the note recorded against
/// expired submissions and the comment posted back to the issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The last active commitment was withdrawn.
    FundingDrained,
    /// The primary funder cancelled through the API.
    FunderRequest,
    /// The GitHub issue was closed while the bounty was open.
    IssueClosed,
}

impl CancelReason {
    pub fn note(&self) -> &'static str {
        match self {
            CancelReason::FundingDrained => "all funding withdrawn",
            CancelReason::FunderRequest => "cancelled by the primary funder",
            CancelReason::IssueClosed => "issue closed on GitHub",
        }
    }
}

/// Reject ledger or submission mutations against terminal bounties.
pub fn ensure_open(bounty: &Bounty) -> Result<()> {
    if bounty.status.is_terminal() {
        return Err(EngineError::terminal_bounty(bounty.status));
    }
    Ok(())
}

/// The actor allowed to cancel, approve, and reject: the current
/// primary funder.
pub fn is_primary_funder(bounty: &Bounty, user_id: i64) -> bool {
    bounty.primary_funder_id == Some(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BountyStatus;
    use chrono::{TimeZone, Utc};

    fn bounty(status: BountyStatus) -> Bounty {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Bounty {
            id: 1,
            github_repo_id: 42,
            issue_number: 101,
            status,
            token_address: "0xusdc".into(),
            total_funded: 1500,
            primary_funder_id: Some(100),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_open_bounty_accepts_changes() {
        assert!(ensure_open(&bounty(BountyStatus::Open)).is_ok());
    }

    #[test]
    fn test_terminal_bounty_rejects_changes() {
        for status in [BountyStatus::Completed, BountyStatus::Cancelled] {
            let err = ensure_open(&bounty(status)).unwrap_err();
            assert!(matches!(err, EngineError::TerminalBounty { .. }));
        }
    }

    #[test]
    fn test_primary_funder_check() {
        let b = bounty(BountyStatus::Open);
        assert!(is_primary_funder(&b, 100));
        assert!(!is_primary_funder(&b, 200));
        let mut drained = b;
        drained.primary_funder_id = None;
        assert!(!is_primary_funder(&drained, 100));
    }

    #[test]
    fn test_cancel_notes_are_distinct() {
        let notes = [
            CancelReason::FundingDrained.note(),
            CancelReason::FunderRequest.note(),
            CancelReason::IssueClosed.note(),
        ];
        assert_ne!(notes[0], notes[1]);
        assert_ne!(notes[1], notes[2]);
    }
}
