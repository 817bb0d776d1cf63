//! PostgreSQL storage for server mode.
//!
//! Connection pool via deadpool with the schema applied from embedded
//! migrations on startup. Ledger mutations take a `FOR UPDATE` lock on
//! the bounty row so concurrent commitment writes serialize around the
//! recomputation of `total_funded` and `primary_funder_id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime, Transaction};
use tokio_postgres::NoTls;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::ledger;
use crate::models::{
    AccessKey, AccessKeyStatus, Bounty, BountyStatus, FundingCommitment, Payout, PayoutMethod,
    PayoutStatus, RepoSettings, SpendLimit, Submission, SubmissionStatus, User,
};
use crate::storage::{
    AddCommitment, CancelOutcome, ClosedSubmission, LedgerUpdate, NewAccessKey, NewPayout,
    NewRepo, NewSubmission, NewUser, PayoutConfirmed, SpendReservation, Storage,
};
use crate::submissions::{self, ApprovalRole};

const DB_POOL_MAX_SIZE: usize = 20;
const DB_QUERY_TIMEOUT_SECS: u64 = 30;

const USER_COLS: &str = "id, github_login, wallet_address, api_token, created_at";
const REPO_COLS: &str = "id, github_repo_id, owner, name, webhook_secret, \
     require_owner_approval, admin_user_id, installation_id, created_at";
const BOUNTY_COLS: &str = "id, github_repo_id, issue_number, status, token_address, \
     total_funded, primary_funder_id, created_at, updated_at";
const COMMITMENT_COLS: &str = "id, bounty_id, funder_id, amount, token_address, \
     created_at, withdrawn_at";
const SUBMISSION_COLS: &str = "id, bounty_id, contributor_id, github_pr_id, pr_number, \
     pr_title, pr_url, status, funder_approved_at, funder_approved_by, owner_approved_at, \
     owner_approved_by, rejected_at, rejected_by, rejection_reason, merged_at, closed_at, \
     paid_at, created_at, updated_at";
const PAYOUT_COLS: &str = "id, submission_id, commitment_id, funder_id, contributor_id, \
     amount, token_address, method, status, tx_hash, signed_at, confirmed_at, created_at";

#[derive(Clone)]
pub struct PgStorage {
    pool: Pool,
}

impl PgStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        use deadpool_postgres::{ManagerConfig, PoolConfig, RecyclingMethod};
        use std::time::Duration;

        let mut config = Config::new();
        config.url = Some(database_url.to_string());
        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        config.pool = Some(PoolConfig {
            max_size: DB_POOL_MAX_SIZE,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(Duration::from_secs(DB_QUERY_TIMEOUT_SECS)),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| EngineError::Database(format!("pool creation: {e}")))?;

        let client = pool.get().await?;
        client
            .batch_execute(&format!(
                "SET statement_timeout = '{DB_QUERY_TIMEOUT_SECS}s'"
            ))
            .await?;
        info!(
            "Connected to PostgreSQL (pool_size: {}, query_timeout: {}s)",
            DB_POOL_MAX_SIZE, DB_QUERY_TIMEOUT_SECS
        );

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<()> {
        let client = self.pool.get().await?;
        let exists: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
                 WHERE table_name = 'schema_migrations')",
                &[],
            )
            .await?
            .get(0);
        if !exists {
            let migration_sql = include_str!("../migrations/001_schema.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 001_schema");
        }
        Ok(())
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn map_user(row: &tokio_postgres::Row) -> User {
    User {
        id: row.get("id"),
        github_login: row.get("github_login"),
        wallet_address: row.get("wallet_address"),
        api_token: row.get("api_token"),
        created_at: row.get("created_at"),
    }
}

fn map_repo(row: &tokio_postgres::Row) -> RepoSettings {
    RepoSettings {
        id: row.get("id"),
        github_repo_id: row.get("github_repo_id"),
        owner: row.get("owner"),
        name: row.get("name"),
        webhook_secret: row.get("webhook_secret"),
        require_owner_approval: row.get("require_owner_approval"),
        admin_user_id: row.get("admin_user_id"),
        installation_id: row.get("installation_id"),
        created_at: row.get("created_at"),
    }
}

fn map_bounty(row: &tokio_postgres::Row) -> Result<Bounty> {
    let status: String = row.get("status");
    Ok(Bounty {
        id: row.get("id"),
        github_repo_id: row.get("github_repo_id"),
        issue_number: row.get("issue_number"),
        status: BountyStatus::parse(&status)
            .ok_or_else(|| EngineError::Database(format!("unknown bounty status {status}")))?,
        token_address: row.get("token_address"),
        total_funded: row.get("total_funded"),
        primary_funder_id: row.get("primary_funder_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_commitment(row: &tokio_postgres::Row) -> FundingCommitment {
    FundingCommitment {
        id: row.get("id"),
        bounty_id: row.get("bounty_id"),
        funder_id: row.get("funder_id"),
        amount: row.get("amount"),
        token_address: row.get("token_address"),
        created_at: row.get("created_at"),
        withdrawn_at: row.get("withdrawn_at"),
    }
}

fn map_submission(row: &tokio_postgres::Row) -> Result<Submission> {
    let status: String = row.get("status");
    Ok(Submission {
        id: row.get("id"),
        bounty_id: row.get("bounty_id"),
        contributor_id: row.get("contributor_id"),
        github_pr_id: row.get("github_pr_id"),
        pr_number: row.get("pr_number"),
        pr_title: row.get("pr_title"),
        pr_url: row.get("pr_url"),
        status: SubmissionStatus::parse(&status)
            .ok_or_else(|| EngineError::Database(format!("unknown submission status {status}")))?,
        funder_approved_at: row.get("funder_approved_at"),
        funder_approved_by: row.get("funder_approved_by"),
        owner_approved_at: row.get("owner_approved_at"),
        owner_approved_by: row.get("owner_approved_by"),
        rejected_at: row.get("rejected_at"),
        rejected_by: row.get("rejected_by"),
        rejection_reason: row.get("rejection_reason"),
        merged_at: row.get("merged_at"),
        closed_at: row.get("closed_at"),
        paid_at: row.get("paid_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_payout(row: &tokio_postgres::Row) -> Result<Payout> {
    let method: String = row.get("method");
    let status: String = row.get("status");
    Ok(Payout {
        id: row.get("id"),
        submission_id: row.get("submission_id"),
        commitment_id: row.get("commitment_id"),
        funder_id: row.get("funder_id"),
        contributor_id: row.get("contributor_id"),
        amount: row.get("amount"),
        token_address: row.get("token_address"),
        method: PayoutMethod::parse(&method)
            .ok_or_else(|| EngineError::Database(format!("unknown payout method {method}")))?,
        status: PayoutStatus::parse(&status)
            .ok_or_else(|| EngineError::Database(format!("unknown payout status {status}")))?,
        tx_hash: row.get("tx_hash"),
        signed_at: row.get("signed_at"),
        confirmed_at: row.get("confirmed_at"),
        created_at: row.get("created_at"),
    })
}

// ============================================================================
// TRANSACTION HELPERS
// ============================================================================

async fn lock_bounty(tx: &Transaction<'_>, id: i64) -> Result<Option<Bounty>> {
    let row = tx
        .query_opt(
            &format!("SELECT {BOUNTY_COLS} FROM bounties WHERE id = $1 FOR UPDATE"),
            &[&id],
        )
        .await?;
    row.map(|r| map_bounty(&r)).transpose()
}

async fn commitments_tx(tx: &Transaction<'_>, bounty_id: i64) -> Result<Vec<FundingCommitment>> {
    let rows = tx
        .query(
            &format!(
                "SELECT {COMMITMENT_COLS} FROM funding_commitments \
                 WHERE bounty_id = $1 ORDER BY created_at, id"
            ),
            &[&bounty_id],
        )
        .await?;
    Ok(rows.iter().map(map_commitment).collect())
}

async fn submission_by_id_tx(tx: &Transaction<'_>, id: i64) -> Result<Submission> {
    let row = tx
        .query_opt(
            &format!("SELECT {SUBMISSION_COLS} FROM submissions WHERE id = $1 FOR UPDATE"),
            &[&id],
        )
        .await?
        .ok_or(EngineError::NotFound("submission"))?;
    map_submission(&row)
}

async fn persist_submission(tx: &Transaction<'_>, sub: &Submission) -> Result<()> {
    tx.execute(
        "UPDATE submissions SET status = $1, funder_approved_at = $2, funder_approved_by = $3, \
         owner_approved_at = $4, owner_approved_by = $5, rejected_at = $6, rejected_by = $7, \
         rejection_reason = $8, merged_at = $9, closed_at = $10, paid_at = $11, updated_at = $12 \
         WHERE id = $13",
        &[
            &sub.status.as_str(),
            &sub.funder_approved_at,
            &sub.funder_approved_by,
            &sub.owner_approved_at,
            &sub.owner_approved_by,
            &sub.rejected_at,
            &sub.rejected_by,
            &sub.rejection_reason,
            &sub.merged_at,
            &sub.closed_at,
            &sub.paid_at,
            &sub.updated_at,
            &sub.id,
        ],
    )
    .await?;
    Ok(())
}

async fn refresh_bounty_totals(
    tx: &Transaction<'_>,
    bounty_id: i64,
    now: DateTime<Utc>,
) -> Result<Bounty> {
    let commitments = commitments_tx(tx, bounty_id).await?;
    let snap = ledger::snapshot(&commitments);
    let row = tx
        .query_one(
            &format!(
                "UPDATE bounties SET total_funded = $1, primary_funder_id = $2, updated_at = $3 \
                 WHERE id = $4 RETURNING {BOUNTY_COLS}"
            ),
            &[&snap.total_funded, &snap.primary_funder_id, &now, &bounty_id],
        )
        .await?;
    map_bounty(&row)
}

async fn expire_submissions(
    tx: &Transaction<'_>,
    bounty_id: i64,
    note: &str,
    now: DateTime<Utc>,
) -> Result<Vec<i64>> {
    let rows = tx
        .query(
            &format!("SELECT {SUBMISSION_COLS} FROM submissions WHERE bounty_id = $1 FOR UPDATE"),
            &[&bounty_id],
        )
        .await?;
    let mut expired = Vec::new();
    for row in &rows {
        let sub = map_submission(row)?;
        if let Some(next) = submissions::apply_expiry(&sub, now, note) {
            persist_submission(tx, &next).await?;
            expired.push(next.id);
        }
    }
    Ok(expired)
}

async fn cancel_bounty_tx(
    tx: &Transaction<'_>,
    bounty: &Bounty,
    note: &str,
    now: DateTime<Utc>,
) -> Result<(Bounty, Vec<i64>)> {
    let row = tx
        .query_one(
            &format!(
                "UPDATE bounties SET status = 'cancelled', updated_at = $1 \
                 WHERE id = $2 RETURNING {BOUNTY_COLS}"
            ),
            &[&now, &bounty.id],
        )
        .await?;
    let expired = expire_submissions(tx, bounty.id, note, now).await?;
    Ok((map_bounty(&row)?, expired))
}

async fn load_access_key(tx: &Transaction<'_>, row_id: i64) -> Result<AccessKey> {
    let row = tx
        .query_one(
            "SELECT id, user_id, key_id, status, expires_at, created_at, revoked_at \
             FROM access_keys WHERE id = $1",
            &[&row_id],
        )
        .await?;
    let status: String = row.get("status");
    let limit_rows = tx
        .query(
            "SELECT token_address, initial_amount, remaining_amount \
             FROM access_key_limits WHERE access_key_id = $1 ORDER BY token_address",
            &[&row_id],
        )
        .await?;
    Ok(AccessKey {
        id: row.get("id"),
        user_id: row.get("user_id"),
        key_id: row.get("key_id"),
        status: AccessKeyStatus::parse(&status)
            .ok_or_else(|| EngineError::Database(format!("unknown access key status {status}")))?,
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
        revoked_at: row.get("revoked_at"),
        limits: limit_rows
            .iter()
            .map(|r| SpendLimit {
                token_address: r.get("token_address"),
                initial: r.get("initial_amount"),
                remaining: r.get("remaining_amount"),
            })
            .collect(),
    })
}

// ============================================================================
// STORAGE IMPL
// ============================================================================

#[async_trait]
impl Storage for PgStorage {
    async fn create_user(&self, new: NewUser) -> Result<User> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO users (github_login, wallet_address, api_token) \
                     VALUES ($1, $2, $3) RETURNING {USER_COLS}"
                ),
                &[&new.github_login, &new.wallet_address, &new.api_token],
            )
            .await?;
        Ok(map_user(&row))
    }

    async fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(&format!("SELECT {USER_COLS} FROM users WHERE id = $1"), &[&id])
            .await?;
        Ok(row.map(|r| map_user(&r)))
    }

    async fn user_by_github_login(&self, login: &str) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {USER_COLS} FROM users WHERE LOWER(github_login) = LOWER($1)"),
                &[&login],
            )
            .await?;
        Ok(row.map(|r| map_user(&r)))
    }

    async fn user_by_api_token(&self, token: &str) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {USER_COLS} FROM users WHERE api_token = $1"),
                &[&token],
            )
            .await?;
        Ok(row.map(|r| map_user(&r)))
    }

    async fn upsert_repo(&self, new: NewRepo) -> Result<RepoSettings> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO repo_settings (github_repo_id, owner, name, webhook_secret, \
                     require_owner_approval, admin_user_id) VALUES ($1, $2, $3, $4, $5, $6) \
                     ON CONFLICT (github_repo_id) DO UPDATE SET \
                     owner = EXCLUDED.owner, name = EXCLUDED.name, \
                     webhook_secret = EXCLUDED.webhook_secret, \
                     require_owner_approval = EXCLUDED.require_owner_approval, \
                     admin_user_id = EXCLUDED.admin_user_id \
                     RETURNING {REPO_COLS}"
                ),
                &[
                    &new.github_repo_id,
                    &new.owner,
                    &new.name,
                    &new.webhook_secret,
                    &new.require_owner_approval,
                    &new.admin_user_id,
                ],
            )
            .await?;
        Ok(map_repo(&row))
    }

    async fn repo_by_github_id(&self, github_repo_id: i64) -> Result<Option<RepoSettings>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {REPO_COLS} FROM repo_settings WHERE github_repo_id = $1"),
                &[&github_repo_id],
            )
            .await?;
        Ok(row.map(|r| map_repo(&r)))
    }

    async fn set_installation(
        &self,
        github_repo_id: i64,
        installation_id: Option<i64>,
    ) -> Result<bool> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE repo_settings SET installation_id = $1 WHERE github_repo_id = $2",
                &[&installation_id, &github_repo_id],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn bounty_by_id(&self, id: i64) -> Result<Option<Bounty>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(&format!("SELECT {BOUNTY_COLS} FROM bounties WHERE id = $1"), &[&id])
            .await?;
        row.map(|r| map_bounty(&r)).transpose()
    }

    async fn bounty_by_issue(
        &self,
        github_repo_id: i64,
        issue_number: i64,
    ) -> Result<Option<Bounty>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {BOUNTY_COLS} FROM bounties \
                     WHERE github_repo_id = $1 AND issue_number = $2"
                ),
                &[&github_repo_id, &issue_number],
            )
            .await?;
        row.map(|r| map_bounty(&r)).transpose()
    }

    async fn list_bounties(
        &self,
        status: Option<BountyStatus>,
        github_repo_id: Option<i64>,
    ) -> Result<Vec<Bounty>> {
        let client = self.pool.get().await?;
        let status_str = status.map(|s| s.as_str().to_string());
        let rows = client
            .query(
                &format!(
                    "SELECT {BOUNTY_COLS} FROM bounties \
                     WHERE ($1::TEXT IS NULL OR status = $1) \
                     AND ($2::BIGINT IS NULL OR github_repo_id = $2) \
                     ORDER BY created_at DESC, id DESC"
                ),
                &[&status_str, &github_repo_id],
            )
            .await?;
        rows.iter().map(map_bounty).collect()
    }

    async fn cancel_bounty(&self, bounty_id: i64, note: &str) -> Result<CancelOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let bounty = lock_bounty(&tx, bounty_id)
            .await?
            .ok_or(EngineError::NotFound("bounty"))?;
        if bounty.status.is_terminal() {
            return Ok(CancelOutcome {
                bounty,
                already_terminal: true,
                expired_submission_ids: Vec::new(),
            });
        }
        let (bounty, expired) = cancel_bounty_tx(&tx, &bounty, note, Utc::now()).await?;
        tx.commit().await?;
        Ok(CancelOutcome {
            bounty,
            already_terminal: false,
            expired_submission_ids: expired,
        })
    }

    async fn add_commitment(&self, req: AddCommitment) -> Result<LedgerUpdate> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let now = Utc::now();

        let existing = tx
            .query_opt(
                &format!(
                    "SELECT {BOUNTY_COLS} FROM bounties \
                     WHERE github_repo_id = $1 AND issue_number = $2 FOR UPDATE"
                ),
                &[&req.github_repo_id, &req.issue_number],
            )
            .await?
            .map(|r| map_bounty(&r))
            .transpose()?;
        let (bounty, bounty_created) = match existing {
            Some(b) => {
                if b.status.is_terminal() {
                    return Err(EngineError::terminal_bounty(b.status));
                }
                if b.token_address != req.token_address {
                    return Err(EngineError::TokenMismatch);
                }
                (b, false)
            }
            None => {
                let row = tx
                    .query_one(
                        &format!(
                            "INSERT INTO bounties (github_repo_id, issue_number, status, \
                             token_address, total_funded) VALUES ($1, $2, 'open', $3, 0) \
                             RETURNING {BOUNTY_COLS}"
                        ),
                        &[&req.github_repo_id, &req.issue_number, &req.token_address],
                    )
                    .await?;
                (map_bounty(&row)?, true)
            }
        };

        let commitments = commitments_tx(&tx, bounty.id).await?;
        if ledger::active_commitment_for(&commitments, req.funder_id).is_some() {
            return Err(EngineError::DuplicateCommitment);
        }

        let row = tx
            .query_one(
                &format!(
                    "INSERT INTO funding_commitments (bounty_id, funder_id, amount, \
                     token_address) VALUES ($1, $2, $3, $4) RETURNING {COMMITMENT_COLS}"
                ),
                &[&bounty.id, &req.funder_id, &req.amount, &req.token_address],
            )
            .await?;
        let commitment = map_commitment(&row);
        let bounty = refresh_bounty_totals(&tx, bounty.id, now).await?;
        tx.commit().await?;
        Ok(LedgerUpdate {
            bounty,
            commitment,
            bounty_created,
            bounty_cancelled: false,
            expired_submission_ids: Vec::new(),
        })
    }

    async fn withdraw_commitment(&self, bounty_id: i64, funder_id: i64) -> Result<LedgerUpdate> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let now = Utc::now();

        let bounty = lock_bounty(&tx, bounty_id)
            .await?
            .ok_or(EngineError::NotFound("bounty"))?;
        if bounty.status.is_terminal() {
            return Err(EngineError::terminal_bounty(bounty.status));
        }
        let commitments = commitments_tx(&tx, bounty_id).await?;
        let active = ledger::active_commitment_for(&commitments, funder_id)
            .ok_or(EngineError::NotFound("active commitment"))?;
        let row = tx
            .query_one(
                &format!(
                    "UPDATE funding_commitments SET withdrawn_at = $1 \
                     WHERE id = $2 RETURNING {COMMITMENT_COLS}"
                ),
                &[&now, &active.id],
            )
            .await?;
        let commitment = map_commitment(&row);

        let mut bounty = refresh_bounty_totals(&tx, bounty_id, now).await?;
        let mut bounty_cancelled = false;
        let mut expired = Vec::new();
        if bounty.primary_funder_id.is_none() {
            let (b, e) = cancel_bounty_tx(
                &tx,
                &bounty,
                crate::bounties::CancelReason::FundingDrained.note(),
                now,
            )
            .await?;
            bounty = b;
            expired = e;
            bounty_cancelled = true;
        }
        tx.commit().await?;
        Ok(LedgerUpdate {
            bounty,
            commitment,
            bounty_created: false,
            bounty_cancelled,
            expired_submission_ids: expired,
        })
    }

    async fn commitments_for_bounty(&self, bounty_id: i64) -> Result<Vec<FundingCommitment>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {COMMITMENT_COLS} FROM funding_commitments \
                     WHERE bounty_id = $1 ORDER BY created_at, id"
                ),
                &[&bounty_id],
            )
            .await?;
        Ok(rows.iter().map(map_commitment).collect())
    }

    async fn upsert_submission(&self, new: NewSubmission) -> Result<(Submission, bool)> {
        let client = self.pool.get().await?;
        // xmax = 0 distinguishes a fresh insert from a conflict-update.
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO submissions (bounty_id, contributor_id, github_pr_id, \
                     pr_number, pr_title, pr_url) VALUES ($1, $2, $3, $4, $5, $6) \
                     ON CONFLICT (bounty_id, github_pr_id) DO UPDATE SET \
                     pr_title = EXCLUDED.pr_title, pr_url = EXCLUDED.pr_url, \
                     updated_at = NOW() \
                     RETURNING {SUBMISSION_COLS}, (xmax = 0) AS inserted"
                ),
                &[
                    &new.bounty_id,
                    &new.contributor_id,
                    &new.github_pr_id,
                    &new.pr_number,
                    &new.pr_title,
                    &new.pr_url,
                ],
            )
            .await?;
        let created: bool = row.get("inserted");
        let sub = map_submission(&row)?;
        Ok((sub, created))
    }

    async fn submission_by_id(&self, id: i64) -> Result<Option<Submission>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {SUBMISSION_COLS} FROM submissions WHERE id = $1"),
                &[&id],
            )
            .await?;
        row.map(|r| map_submission(&r)).transpose()
    }

    async fn submissions_by_pr(&self, github_pr_id: i64) -> Result<Vec<Submission>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {SUBMISSION_COLS} FROM submissions \
                     WHERE github_pr_id = $1 ORDER BY id"
                ),
                &[&github_pr_id],
            )
            .await?;
        rows.iter().map(map_submission).collect()
    }

    async fn submissions_for_bounty(&self, bounty_id: i64) -> Result<Vec<Submission>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {SUBMISSION_COLS} FROM submissions WHERE bounty_id = $1 ORDER BY id"
                ),
                &[&bounty_id],
            )
            .await?;
        rows.iter().map(map_submission).collect()
    }

    async fn record_approval(
        &self,
        submission_id: i64,
        role: ApprovalRole,
        approver_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Submission> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let sub = submission_by_id_tx(&tx, submission_id).await?;
        let next = submissions::apply_approval(&sub, role, approver_id, at)?;
        persist_submission(&tx, &next).await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn record_rejection(
        &self,
        submission_id: i64,
        rejected_by: Option<i64>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Submission> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let sub = submission_by_id_tx(&tx, submission_id).await?;
        let next = submissions::apply_rejection(&sub, rejected_by, reason, at)?;
        persist_submission(&tx, &next).await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn record_merge(&self, github_pr_id: i64, at: DateTime<Utc>) -> Result<Vec<Submission>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let rows = tx
            .query(
                &format!(
                    "SELECT {SUBMISSION_COLS} FROM submissions \
                     WHERE github_pr_id = $1 FOR UPDATE"
                ),
                &[&github_pr_id],
            )
            .await?;
        let mut changed = Vec::new();
        for row in &rows {
            let sub = map_submission(row)?;
            if let Some(next) = submissions::apply_merge(&sub, at) {
                persist_submission(&tx, &next).await?;
                changed.push(next);
            }
        }
        tx.commit().await?;
        Ok(changed)
    }

    async fn record_close_unmerged(
        &self,
        github_pr_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Vec<ClosedSubmission>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let rows = tx
            .query(
                &format!(
                    "SELECT {SUBMISSION_COLS} FROM submissions \
                     WHERE github_pr_id = $1 FOR UPDATE"
                ),
                &[&github_pr_id],
            )
            .await?;
        let mut closed = Vec::new();
        for row in &rows {
            let sub = map_submission(row)?;
            if let Some(next) = submissions::apply_close_unmerged(&sub, at) {
                persist_submission(&tx, &next).await?;
                let remaining: i64 = tx
                    .query_one(
                        "SELECT COUNT(*) FROM submissions WHERE bounty_id = $1 \
                         AND status IN ('pending', 'approved')",
                        &[&next.bounty_id],
                    )
                    .await?
                    .get(0);
                closed.push(ClosedSubmission {
                    submission: next,
                    remaining_active: remaining as usize,
                });
            }
        }
        tx.commit().await?;
        Ok(closed)
    }

    async fn insert_access_key(&self, new: NewAccessKey) -> Result<AccessKey> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_one(
                "INSERT INTO access_keys (user_id, key_id, status, expires_at) \
                 VALUES ($1, $2, 'active', $3) RETURNING id",
                &[&new.user_id, &new.key_id, &new.expires_at],
            )
            .await?;
        let key_row_id: i64 = row.get(0);
        for limit in &new.limits {
            tx.execute(
                "INSERT INTO access_key_limits (access_key_id, token_address, \
                 initial_amount, remaining_amount) VALUES ($1, $2, $3, $3)",
                &[&key_row_id, &limit.token_address, &limit.initial],
            )
            .await?;
        }
        let key = load_access_key(&tx, key_row_id).await?;
        tx.commit().await?;
        Ok(key)
    }

    async fn access_keys_for_user(&self, user_id: i64) -> Result<Vec<AccessKey>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let rows = tx
            .query(
                "SELECT id FROM access_keys WHERE user_id = $1 \
                 ORDER BY created_at DESC, id DESC",
                &[&user_id],
            )
            .await?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            keys.push(load_access_key(&tx, row.get(0)).await?);
        }
        tx.commit().await?;
        Ok(keys)
    }

    async fn active_access_key(&self, user_id: i64) -> Result<Option<AccessKey>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(
                "SELECT id FROM access_keys WHERE user_id = $1 AND status = 'active' \
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                &[&user_id],
            )
            .await?;
        let key = match row {
            Some(row) => Some(load_access_key(&tx, row.get(0)).await?),
            None => None,
        };
        tx.commit().await?;
        Ok(key)
    }

    async fn revoke_access_key(
        &self,
        user_id: i64,
        key_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE access_keys SET status = 'revoked', revoked_at = $1 \
                 WHERE user_id = $2 AND key_id = $3 AND status = 'active'",
                &[&at, &user_id, &key_id],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn expire_access_keys(&self, now: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE access_keys SET status = 'expired' \
                 WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= $1",
                &[&now],
            )
            .await?;
        Ok(changed)
    }

    async fn raise_spend_limit(
        &self,
        user_id: i64,
        token_address: &str,
        amount: i64,
    ) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO access_key_limits (access_key_id, token_address, \
                 initial_amount, remaining_amount) \
                 SELECT id, $2, $3, $3 FROM access_keys \
                 WHERE user_id = $1 AND status = 'active' \
                 ON CONFLICT (access_key_id, token_address) DO UPDATE SET \
                 initial_amount = access_key_limits.initial_amount + EXCLUDED.initial_amount, \
                 remaining_amount = access_key_limits.remaining_amount + EXCLUDED.remaining_amount",
                &[&user_id, &token_address, &amount],
            )
            .await?;
        Ok(())
    }

    async fn reserve_spend(
        &self,
        key_id: &str,
        token_address: &str,
        amount: i64,
    ) -> Result<SpendReservation> {
        let client = self.pool.get().await?;
        // Check-and-decrement in one statement; two concurrent payouts
        // cannot both pass the check against the same headroom.
        let changed = client
            .execute(
                "UPDATE access_key_limits SET remaining_amount = remaining_amount - $1 \
                 WHERE access_key_id IN (SELECT id FROM access_keys \
                                         WHERE key_id = $2 AND status = 'active') \
                 AND token_address = $3 AND remaining_amount >= $1",
                &[&amount, &key_id, &token_address],
            )
            .await?;
        if changed > 0 {
            return Ok(SpendReservation::Reserved);
        }
        let exists: i64 = client
            .query_one(
                "SELECT COUNT(*) FROM access_key_limits l \
                 JOIN access_keys k ON k.id = l.access_key_id \
                 WHERE k.key_id = $1 AND k.status = 'active' AND l.token_address = $2",
                &[&key_id, &token_address],
            )
            .await?
            .get(0);
        if exists > 0 {
            Ok(SpendReservation::InsufficientRemaining)
        } else {
            Ok(SpendReservation::NotAvailable)
        }
    }

    async fn release_spend(&self, key_id: &str, token_address: &str, amount: i64) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE access_key_limits \
                 SET remaining_amount = LEAST(initial_amount, remaining_amount + $1) \
                 WHERE access_key_id IN (SELECT id FROM access_keys WHERE key_id = $2) \
                 AND token_address = $3",
                &[&amount, &key_id, &token_address],
            )
            .await?;
        Ok(())
    }

    async fn insert_payouts(&self, rows: Vec<NewPayout>) -> Result<Vec<Payout>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let mut submission_id = None;
        for row in &rows {
            submission_id = Some(row.submission_id);
            tx.execute(
                "INSERT INTO payouts (id, submission_id, commitment_id, funder_id, \
                 contributor_id, amount, token_address, method, status) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'manual', 'awaiting_signature') \
                 ON CONFLICT (submission_id, commitment_id) DO NOTHING",
                &[
                    &row.id,
                    &row.submission_id,
                    &row.commitment_id,
                    &row.funder_id,
                    &row.contributor_id,
                    &row.amount,
                    &row.token_address,
                ],
            )
            .await?;
        }
        let all = match submission_id {
            Some(id) => {
                let rows = tx
                    .query(
                        &format!(
                            "SELECT {PAYOUT_COLS} FROM payouts \
                             WHERE submission_id = $1 ORDER BY created_at, id"
                        ),
                        &[&id],
                    )
                    .await?;
                rows.iter().map(map_payout).collect::<Result<Vec<_>>>()?
            }
            None => Vec::new(),
        };
        tx.commit().await?;
        Ok(all)
    }

    async fn payout_by_id(&self, id: &str) -> Result<Option<Payout>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(&format!("SELECT {PAYOUT_COLS} FROM payouts WHERE id = $1"), &[&id])
            .await?;
        row.map(|r| map_payout(&r)).transpose()
    }

    async fn payouts_for_submission(&self, submission_id: i64) -> Result<Vec<Payout>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {PAYOUT_COLS} FROM payouts \
                     WHERE submission_id = $1 ORDER BY created_at, id"
                ),
                &[&submission_id],
            )
            .await?;
        rows.iter().map(map_payout).collect()
    }

    async fn mark_payout_signed(
        &self,
        payout_id: &str,
        tx_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<Payout> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE payouts SET method = 'automated', status = 'signed', \
                     tx_hash = $1, signed_at = $2 \
                     WHERE id = $3 AND status = 'awaiting_signature' \
                     RETURNING {PAYOUT_COLS}"
                ),
                &[&tx_hash, &at, &payout_id],
            )
            .await?
            .ok_or(EngineError::NotFound("payout awaiting signature"))?;
        map_payout(&row)
    }

    async fn confirm_payout(
        &self,
        payout_id: &str,
        tx_hash: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<PayoutConfirmed> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(
                &format!("SELECT {PAYOUT_COLS} FROM payouts WHERE id = $1 FOR UPDATE"),
                &[&payout_id],
            )
            .await?
            .ok_or(EngineError::NotFound("payout"))?;
        let payout = map_payout(&row)?;

        if payout.status == PayoutStatus::Confirmed {
            let unconfirmed: i64 = tx
                .query_one(
                    "SELECT COUNT(*) FROM payouts \
                     WHERE submission_id = $1 AND status != 'confirmed'",
                    &[&payout.submission_id],
                )
                .await?
                .get(0);
            tx.commit().await?;
            return Ok(PayoutConfirmed {
                payout,
                already_confirmed: true,
                all_confirmed: unconfirmed == 0,
                submission: None,
                bounty: None,
            });
        }

        let row = tx
            .query_one(
                &format!(
                    "UPDATE payouts SET status = 'confirmed', confirmed_at = $1, \
                     tx_hash = COALESCE($2, tx_hash) WHERE id = $3 RETURNING {PAYOUT_COLS}"
                ),
                &[&at, &tx_hash, &payout_id],
            )
            .await?;
        let payout = map_payout(&row)?;

        let unconfirmed: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM payouts WHERE submission_id = $1 AND status != 'confirmed'",
                &[&payout.submission_id],
            )
            .await?
            .get(0);
        let mut settled_submission = None;
        let mut completed_bounty = None;
        if unconfirmed == 0 {
            let sub = submission_by_id_tx(&tx, payout.submission_id).await?;
            if sub.status == SubmissionStatus::Merged {
                let paid = submissions::apply_paid(&sub, at)?;
                persist_submission(&tx, &paid).await?;
                let bounty = lock_bounty(&tx, paid.bounty_id)
                    .await?
                    .ok_or(EngineError::NotFound("bounty"))?;
                if bounty.status == BountyStatus::Open {
                    let row = tx
                        .query_one(
                            &format!(
                                "UPDATE bounties SET status = 'completed', updated_at = $1 \
                                 WHERE id = $2 RETURNING {BOUNTY_COLS}"
                            ),
                            &[&at, &bounty.id],
                        )
                        .await?;
                    completed_bounty = Some(map_bounty(&row)?);
                }
                settled_submission = Some(paid);
            }
        }
        tx.commit().await?;
        Ok(PayoutConfirmed {
            payout,
            already_confirmed: false,
            all_confirmed: unconfirmed == 0,
            submission: settled_submission,
            bounty: completed_bounty,
        })
    }
}
