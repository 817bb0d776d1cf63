//! Storage interface shared by the PostgreSQL and SQLite backends.
//!
//! Every method that spans more than one row runs inside a single
//! transaction in both backends: ledger mutations recompute the bounty
//! totals from the commitment rows before committing, cancellation
//! expires submissions together with the status flip, and payout
//! confirmation settles the submission and bounty in the same commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    AccessKey, Bounty, FundingCommitment, Payout, RepoSettings, SpendLimit, Submission, User,
};
use crate::submissions::ApprovalRole;

// ============================================================================
// REQUEST TYPES
// ============================================================================

#[derive(Debug, Clone)]
pub struct NewUser {
    pub github_login: String,
    pub wallet_address: Option<String>,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRepo {
    pub github_repo_id: i64,
    pub owner: String,
    pub name: String,
    pub webhook_secret: String,
    pub require_owner_approval: bool,
    pub admin_user_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AddCommitment {
    pub github_repo_id: i64,
    pub issue_number: i64,
    pub funder_id: i64,
    pub amount: i64,
    pub token_address: String,
}

#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub bounty_id: i64,
    pub contributor_id: i64,
    pub github_pr_id: i64,
    pub pr_number: i64,
    pub pr_title: Option<String>,
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAccessKey {
    pub user_id: i64,
    pub key_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub limits: Vec<SpendLimit>,
}

#[derive(Debug, Clone)]
pub struct NewPayout {
    pub id: String,
    pub submission_id: i64,
    pub commitment_id: i64,
    pub funder_id: i64,
    pub contributor_id: i64,
    pub amount: i64,
    pub token_address: String,
}

// ============================================================================
// OUTCOME TYPES
// ============================================================================

/// Result of a commitment add or withdrawal: the bounty with its
/// recomputed totals plus the touched commitment row.
#[derive(Debug, Clone)]
pub struct LedgerUpdate {
    pub bounty: Bounty,
    pub commitment: FundingCommitment,
    /// The bounty was created by this funding.
    pub bounty_created: bool,
    /// The withdrawal drained the ledger and cancelled the bounty.
    pub bounty_cancelled: bool,
    /// Submissions expired by that cancellation.
    pub expired_submission_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub bounty: Bounty,
    /// The bounty was already terminal; nothing changed.
    pub already_terminal: bool,
    pub expired_submission_ids: Vec<i64>,
}

/// A submission auto-rejected because its PR closed without merging.
#[derive(Debug, Clone)]
pub struct ClosedSubmission {
    pub submission: Submission,
    /// Active submissions left on the same bounty afterwards.
    pub remaining_active: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendReservation {
    Reserved,
    /// The conditional decrement found less than the requested amount.
    InsufficientRemaining,
    /// No active key limit row matched the key and token.
    NotAvailable,
}

#[derive(Debug, Clone)]
pub struct PayoutConfirmed {
    pub payout: Payout,
    /// This confirmation was a repeat delivery; nothing changed.
    pub already_confirmed: bool,
    /// Every payout of the submission is now confirmed.
    pub all_confirmed: bool,
    /// Set when `all_confirmed` settled the submission as paid.
    pub submission: Option<Submission>,
    /// Set when settling the submission completed the bounty.
    pub bounty: Option<Bounty>,
}

// ============================================================================
// STORAGE TRAIT
// ============================================================================

#[async_trait]
pub trait Storage: Send + Sync {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    async fn create_user(&self, new: NewUser) -> Result<User>;
    async fn user_by_id(&self, id: i64) -> Result<Option<User>>;
    async fn user_by_github_login(&self, login: &str) -> Result<Option<User>>;
    async fn user_by_api_token(&self, token: &str) -> Result<Option<User>>;

    // ------------------------------------------------------------------
    // Repositories
    // ------------------------------------------------------------------

    /// Insert or refresh a repository registration, keyed by the GitHub
    /// repository id.
    async fn upsert_repo(&self, new: NewRepo) -> Result<RepoSettings>;
    async fn repo_by_github_id(&self, github_repo_id: i64) -> Result<Option<RepoSettings>>;
    /// Record or clear the GitHub App installation covering the repo.
    /// Returns false when the repo is not registered.
    async fn set_installation(
        &self,
        github_repo_id: i64,
        installation_id: Option<i64>,
    ) -> Result<bool>;

    // ------------------------------------------------------------------
    // Bounties
    // ------------------------------------------------------------------

    async fn bounty_by_id(&self, id: i64) -> Result<Option<Bounty>>;
    async fn bounty_by_issue(
        &self,
        github_repo_id: i64,
        issue_number: i64,
    ) -> Result<Option<Bounty>>;
    async fn list_bounties(
        &self,
        status: Option<crate::models::BountyStatus>,
        github_repo_id: Option<i64>,
    ) -> Result<Vec<Bounty>>;
    /// Move an open bounty to cancelled and expire its active
    /// submissions. Terminal bounties come back with `already_terminal`.
    async fn cancel_bounty(&self, bounty_id: i64, note: &str) -> Result<CancelOutcome>;

    // ------------------------------------------------------------------
    // Funding ledger
    // ------------------------------------------------------------------

    /// Add a commitment, creating the bounty on first funding. The
    /// bounty totals are recomputed in the same transaction.
    async fn add_commitment(&self, req: AddCommitment) -> Result<LedgerUpdate>;
    /// Withdraw the funder's active commitment. Cancels the bounty when
    /// the last active commitment goes.
    async fn withdraw_commitment(&self, bounty_id: i64, funder_id: i64) -> Result<LedgerUpdate>;
    async fn commitments_for_bounty(&self, bounty_id: i64) -> Result<Vec<FundingCommitment>>;

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    /// Find-or-create keyed on (bounty, PR id); repeat deliveries
    /// refresh title and URL without duplicating. The bool is true when
    /// the row was created.
    async fn upsert_submission(&self, new: NewSubmission) -> Result<(Submission, bool)>;
    async fn submission_by_id(&self, id: i64) -> Result<Option<Submission>>;
    /// All submissions referencing a GitHub PR id, across bounties.
    async fn submissions_by_pr(&self, github_pr_id: i64) -> Result<Vec<Submission>>;
    async fn submissions_for_bounty(&self, bounty_id: i64) -> Result<Vec<Submission>>;
    async fn record_approval(
        &self,
        submission_id: i64,
        role: ApprovalRole,
        approver_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Submission>;
    async fn record_rejection(
        &self,
        submission_id: i64,
        rejected_by: Option<i64>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Submission>;
    /// Apply a merge delivery to every active submission of the PR.
    /// Returns only the rows that changed; repeats return empty.
    async fn record_merge(&self, github_pr_id: i64, at: DateTime<Utc>) -> Result<Vec<Submission>>;
    /// Apply an unmerged close to every active submission of the PR.
    async fn record_close_unmerged(
        &self,
        github_pr_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Vec<ClosedSubmission>>;

    // ------------------------------------------------------------------
    // Access keys
    // ------------------------------------------------------------------

    async fn insert_access_key(&self, new: NewAccessKey) -> Result<AccessKey>;
    async fn access_keys_for_user(&self, user_id: i64) -> Result<Vec<AccessKey>>;
    /// The user's most recently created active key, with limits loaded.
    async fn active_access_key(&self, user_id: i64) -> Result<Option<AccessKey>>;
    /// Returns false when no active key matched.
    async fn revoke_access_key(
        &self,
        user_id: i64,
        key_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    /// Flip active keys past their expiry to expired. Returns the count.
    async fn expire_access_keys(&self, now: DateTime<Utc>) -> Result<u64>;
    /// Raise the cached limit on the user's active keys by `amount`,
    /// creating the per-token row on first use.
    async fn raise_spend_limit(
        &self,
        user_id: i64,
        token_address: &str,
        amount: i64,
    ) -> Result<()>;
    /// Conditionally decrement the cached remaining amount. Only
    /// succeeds against an active key with enough headroom.
    async fn reserve_spend(
        &self,
        key_id: &str,
        token_address: &str,
        amount: i64,
    ) -> Result<SpendReservation>;
    /// Return a reserved amount after a failed signing attempt. Clamped
    /// so remaining never exceeds initial.
    async fn release_spend(&self, key_id: &str, token_address: &str, amount: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // Payouts
    // ------------------------------------------------------------------

    /// Insert payout rows for a submission. Rows that already exist for
    /// the (submission, commitment) pair are left untouched. Returns the
    /// full set for the submission.
    async fn insert_payouts(&self, rows: Vec<NewPayout>) -> Result<Vec<Payout>>;
    async fn payout_by_id(&self, id: &str) -> Result<Option<Payout>>;
    async fn payouts_for_submission(&self, submission_id: i64) -> Result<Vec<Payout>>;
    /// Record a successful automated signing.
    async fn mark_payout_signed(
        &self,
        payout_id: &str,
        tx_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<Payout>;
    /// Confirm a payout on-chain. When it is the last outstanding payout
    /// of the submission, the submission moves to paid and the bounty to
    /// completed in the same transaction.
    async fn confirm_payout(
        &self,
        payout_id: &str,
        tx_hash: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<PayoutConfirmed>;
}
