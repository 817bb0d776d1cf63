//! Submission state machine.
//!
//! Pure transition functions over [`Submission`]. Storage backends call
//! these inside the transaction that persists the result, so both the
//! Postgres and SQLite paths share one set of rules:
//!
//! - pending -> approved | rejected | merged | expired
//! - approved -> merged | rejected | expired
//! - merged -> paid | expired
//! - rejected, paid, expired are terminal
//!
//! Webhook-driven transitions (merge, close) are idempotent: a repeat
//! delivery returns `None` and the caller persists nothing.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Submission, SubmissionStatus};

/// Note recorded on submissions rejected because their PR was closed
/// without being merged.
pub const CLOSED_UNMERGED_NOTE: &str = "pull request closed without merge";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("submission is {status} and accepts no further transitions")]
    Terminal { status: SubmissionStatus },
    #[error("cannot move a {from} submission to {to}")]
    Invalid {
        from: SubmissionStatus,
        to: SubmissionStatus,
    },
    #[error("{role} approval already recorded for this submission")]
    AlreadyApproved { role: ApprovalRole },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalRole {
    Funder,
    Owner,
}

impl std::fmt::Display for ApprovalRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalRole::Funder => write!(f, "funder"),
            ApprovalRole::Owner => write!(f, "owner"),
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// All approvals required by the repository's settings are present.
pub fn approvals_complete(sub: &Submission, require_owner_approval: bool) -> bool {
    let funder_ok = sub.funder_approved_at.is_some();
    let owner_ok = !require_owner_approval || sub.owner_approved_at.is_some();
    funder_ok && owner_ok
}

/// Merged and fully approved: the payout coordinator may start.
pub fn payout_ready(sub: &Submission, require_owner_approval: bool) -> bool {
    sub.status == SubmissionStatus::Merged && approvals_complete(sub, require_owner_approval)
}

/// Record an approval stamp. Approving a merged submission keeps it
/// merged; approving a pending one moves it to approved. Each role
/// stamps at most once.
pub fn apply_approval(
    sub: &Submission,
    role: ApprovalRole,
    approver_id: i64,
    at: DateTime<Utc>,
) -> Result<Submission, TransitionError> {
    if sub.status.is_terminal() {
        return Err(TransitionError::Terminal { status: sub.status });
    }
    let mut next = sub.clone();
    match role {
        ApprovalRole::Funder => {
            if next.funder_approved_at.is_some() {
                return Err(TransitionError::AlreadyApproved { role });
            }
            next.funder_approved_at = Some(at);
            next.funder_approved_by = Some(approver_id);
        }
        ApprovalRole::Owner => {
            if next.owner_approved_at.is_some() {
                return Err(TransitionError::AlreadyApproved { role });
            }
            next.owner_approved_at = Some(at);
            next.owner_approved_by = Some(approver_id);
        }
    }
    if next.status == SubmissionStatus::Pending {
        next.status = SubmissionStatus::Approved;
    }
    next.updated_at = at;
    Ok(next)
}

/// Explicit rejection by the primary funder. Only active submissions
/// can be rejected; a merged submission is past the point of rejection
/// and the funder instead withholds approval.
pub fn apply_rejection(
    sub: &Submission,
    rejected_by: Option<i64>,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<Submission, TransitionError> {
    if !sub.status.is_active() {
        if sub.status.is_terminal() {
            return Err(TransitionError::Terminal { status: sub.status });
        }
        return Err(TransitionError::Invalid {
            from: sub.status,
            to: SubmissionStatus::Rejected,
        });
    }
    let mut next = sub.clone();
    next.status = SubmissionStatus::Rejected;
    next.rejected_at = Some(at);
    next.rejected_by = rejected_by;
    next.rejection_reason = Some(reason.to_string());
    next.updated_at = at;
    Ok(next)
}

/// PR merge delivery. Active submissions move to merged; anything else
/// is a repeat or late delivery and changes nothing (`None`).
pub fn apply_merge(sub: &Submission, merged_at: DateTime<Utc>) -> Option<Submission> {
    if !sub.status.is_active() {
        return None;
    }
    let mut next = sub.clone();
    next.status = SubmissionStatus::Merged;
    next.merged_at = Some(merged_at);
    next.updated_at = merged_at;
    Some(next)
}

/// PR closed without merge. Active submissions are auto-rejected with
/// [`CLOSED_UNMERGED_NOTE`]; repeats and late deliveries are no-ops.
pub fn apply_close_unmerged(sub: &Submission, closed_at: DateTime<Utc>) -> Option<Submission> {
    if !sub.status.is_active() {
        return None;
    }
    let mut next = sub.clone();
    next.status = SubmissionStatus::Rejected;
    next.rejected_at = Some(closed_at);
    next.rejection_reason = Some(CLOSED_UNMERGED_NOTE.to_string());
    next.closed_at = Some(closed_at);
    next.updated_at = closed_at;
    Some(next)
}

/// Bounty cancellation expires every non-terminal submission, with the
/// cancellation cause recorded as the reason. Merged-but-unpaid
/// submissions expire too: once the bounty is cancelled no path to
/// paid remains.
pub fn apply_expiry(sub: &Submission, at: DateTime<Utc>, note: &str) -> Option<Submission> {
    if sub.status.is_terminal() {
        return None;
    }
    let mut next = sub.clone();
    next.status = SubmissionStatus::Expired;
    next.rejection_reason = Some(note.to_string());
    next.updated_at = at;
    Some(next)
}

/// All payouts confirmed: the submission is settled.
pub fn apply_paid(sub: &Submission, at: DateTime<Utc>) -> Result<Submission, TransitionError> {
    if sub.status != SubmissionStatus::Merged {
        return Err(TransitionError::Invalid {
            from: sub.status,
            to: SubmissionStatus::Paid,
        });
    }
    let mut next = sub.clone();
    next.status = SubmissionStatus::Paid;
    next.paid_at = Some(at);
    next.updated_at = at;
    Ok(next)
}
