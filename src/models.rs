//! Core entities of the bounty funding and submission lifecycle.
//!
//! Amounts are i64 base units of the bounty's token. Statuses are stored
//! as TEXT in both storage backends; `as_str`/`parse` are the single
//! source of truth for their wire form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// STATUS ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BountyStatus {
    Open,
    Completed,
    Cancelled,
}

impl BountyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BountyStatus::Open => "open",
            BountyStatus::Completed => "completed",
            BountyStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(BountyStatus::Open),
            "completed" => Some(BountyStatus::Completed),
            "cancelled" => Some(BountyStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal bounties accept no further ledger or submission transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BountyStatus::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Approved,
    Rejected,
    Merged,
    Paid,
    Expired,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Approved => "approved",
            SubmissionStatus::Rejected => "rejected",
            SubmissionStatus::Merged => "merged",
            SubmissionStatus::Paid => "paid",
            SubmissionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SubmissionStatus::Pending),
            "approved" => Some(SubmissionStatus::Approved),
            "rejected" => Some(SubmissionStatus::Rejected),
            "merged" => Some(SubmissionStatus::Merged),
            "paid" => Some(SubmissionStatus::Paid),
            "expired" => Some(SubmissionStatus::Expired),
            _ => None,
        }
    }

    /// Active submissions are still competing for the bounty.
    pub fn is_active(&self) -> bool {
        matches!(self, SubmissionStatus::Pending | SubmissionStatus::Approved)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Rejected | SubmissionStatus::Paid | SubmissionStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKeyStatus {
    Active,
    Revoked,
    Expired,
}

impl AccessKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKeyStatus::Active => "active",
            AccessKeyStatus::Revoked => "revoked",
            AccessKeyStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccessKeyStatus::Active),
            "revoked" => Some(AccessKeyStatus::Revoked),
            "expired" => Some(AccessKeyStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutMethod {
    Automated,
    Manual,
}

impl PayoutMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutMethod::Automated => "automated",
            PayoutMethod::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automated" => Some(PayoutMethod::Automated),
            "manual" => Some(PayoutMethod::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    /// Signed by the backend signer, awaiting on-chain confirmation.
    Signed,
    /// Waiting for the funder's manual passkey signature.
    AwaitingSignature,
    Confirmed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Signed => "signed",
            PayoutStatus::AwaitingSignature => "awaiting_signature",
            PayoutStatus::Confirmed => "confirmed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signed" => Some(PayoutStatus::Signed),
            "awaiting_signature" => Some(PayoutStatus::AwaitingSignature),
            "confirmed" => Some(PayoutStatus::Confirmed),
            _ => None,
        }
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub github_login: String,
    pub wallet_address: Option<String>,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSettings {
    pub id: i64,
    pub github_repo_id: i64,
    pub owner: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub require_owner_approval: bool,
    pub admin_user_id: Option<i64>,
    pub installation_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl RepoSettings {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bounty {
    pub id: i64,
    pub github_repo_id: i64,
    pub issue_number: i64,
    pub status: BountyStatus,
    pub token_address: String,
    /// Sum of non-withdrawn commitments; recomputed transactionally
    /// with every commitment mutation.
    pub total_funded: i64,
    /// Earliest-created non-withdrawn commitment's funder, or None.
    pub primary_funder_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingCommitment {
    pub id: i64,
    pub bounty_id: i64,
    pub funder_id: i64,
    pub amount: i64,
    pub token_address: String,
    pub created_at: DateTime<Utc>,
    pub withdrawn_at: Option<DateTime<Utc>>,
}

impl FundingCommitment {
    pub fn is_withdrawn(&self) -> bool {
        self.withdrawn_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub bounty_id: i64,
    pub contributor_id: i64,
    pub github_pr_id: i64,
    pub pr_number: i64,
    pub pr_title: Option<String>,
    pub pr_url: Option<String>,
    pub status: SubmissionStatus,
    pub funder_approved_at: Option<DateTime<Utc>>,
    pub funder_approved_by: Option<i64>,
    pub owner_approved_at: Option<DateTime<Utc>>,
    pub owner_approved_by: Option<i64>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<i64>,
    pub rejection_reason: Option<String>,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendLimit {
    pub token_address: String,
    pub initial: i64,
    pub remaining: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessKey {
    pub id: i64,
    pub user_id: i64,
    /// On-chain authorization identifier of the signed key.
    pub key_id: String,
    pub status: AccessKeyStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub limits: Vec<SpendLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: String,
    pub submission_id: i64,
    pub commitment_id: i64,
    pub funder_id: i64,
    pub contributor_id: i64,
    pub amount: i64,
    pub token_address: String,
    pub method: PayoutMethod,
    pub status: PayoutStatus,
    pub tx_hash: Option<String>,
    pub signed_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for s in [
            BountyStatus::Open,
            BountyStatus::Completed,
            BountyStatus::Cancelled,
        ] {
            assert_eq!(BountyStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            SubmissionStatus::Pending,
            SubmissionStatus::Approved,
            SubmissionStatus::Rejected,
            SubmissionStatus::Merged,
            SubmissionStatus::Paid,
            SubmissionStatus::Expired,
        ] {
            assert_eq!(SubmissionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(BountyStatus::parse("reopened"), None);
    }

    #[test]
    fn test_terminal_and_active_flags() {
        assert!(!BountyStatus::Open.is_terminal());
        assert!(BountyStatus::Completed.is_terminal());
        assert!(BountyStatus::Cancelled.is_terminal());

        assert!(SubmissionStatus::Pending.is_active());
        assert!(SubmissionStatus::Approved.is_active());
        assert!(!SubmissionStatus::Merged.is_active());
        assert!(SubmissionStatus::Merged != SubmissionStatus::Paid);
        assert!(!SubmissionStatus::Merged.is_terminal());
        assert!(SubmissionStatus::Rejected.is_terminal());
        assert!(SubmissionStatus::Expired.is_terminal());
        assert!(SubmissionStatus::Paid.is_terminal());
    }
}
