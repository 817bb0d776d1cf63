//! SQLite storage for local mode and the test suite.
//!
//! Same invariants as the PostgreSQL backend: every ledger mutation
//! recomputes the bounty's cached totals before the transaction
//! commits. The single connection behind a mutex serializes writers,
//! which stands in for the row locks the server backend takes.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

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

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    github_login TEXT NOT NULL UNIQUE,
    wallet_address TEXT,
    api_token TEXT UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS repo_settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    github_repo_id INTEGER NOT NULL UNIQUE,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    webhook_secret TEXT NOT NULL,
    require_owner_approval INTEGER NOT NULL DEFAULT 0,
    admin_user_id INTEGER REFERENCES users(id),
    installation_id INTEGER,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bounties (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    github_repo_id INTEGER NOT NULL,
    issue_number INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    token_address TEXT NOT NULL,
    total_funded INTEGER NOT NULL DEFAULT 0,
    primary_funder_id INTEGER REFERENCES users(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (github_repo_id, issue_number)
);

CREATE TABLE IF NOT EXISTS funding_commitments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bounty_id INTEGER NOT NULL REFERENCES bounties(id),
    funder_id INTEGER NOT NULL REFERENCES users(id),
    amount INTEGER NOT NULL CHECK (amount > 0),
    token_address TEXT NOT NULL,
    created_at TEXT NOT NULL,
    withdrawn_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS funding_commitments_active_uniq
    ON funding_commitments (bounty_id, funder_id)
    WHERE withdrawn_at IS NULL;

CREATE TABLE IF NOT EXISTS submissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bounty_id INTEGER NOT NULL REFERENCES bounties(id),
    contributor_id INTEGER NOT NULL REFERENCES users(id),
    github_pr_id INTEGER NOT NULL,
    pr_number INTEGER NOT NULL,
    pr_title TEXT,
    pr_url TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    funder_approved_at TEXT,
    funder_approved_by INTEGER REFERENCES users(id),
    owner_approved_at TEXT,
    owner_approved_by INTEGER REFERENCES users(id),
    rejected_at TEXT,
    rejected_by INTEGER REFERENCES users(id),
    rejection_reason TEXT,
    merged_at TEXT,
    closed_at TEXT,
    paid_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (bounty_id, github_pr_id)
);

CREATE INDEX IF NOT EXISTS submissions_pr_idx ON submissions (github_pr_id);

CREATE TABLE IF NOT EXISTS access_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    key_id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'active',
    expires_at TEXT,
    created_at TEXT NOT NULL,
    revoked_at TEXT
);

CREATE TABLE IF NOT EXISTS access_key_limits (
    access_key_id INTEGER NOT NULL REFERENCES access_keys(id),
    token_address TEXT NOT NULL,
    initial_amount INTEGER NOT NULL CHECK (initial_amount >= 0),
    remaining_amount INTEGER NOT NULL,
    PRIMARY KEY (access_key_id, token_address),
    CHECK (remaining_amount >= 0 AND remaining_amount <= initial_amount)
);

CREATE TABLE IF NOT EXISTS payouts (
    id TEXT PRIMARY KEY,
    submission_id INTEGER NOT NULL REFERENCES submissions(id),
    commitment_id INTEGER NOT NULL REFERENCES funding_commitments(id),
    funder_id INTEGER NOT NULL REFERENCES users(id),
    contributor_id INTEGER NOT NULL REFERENCES users(id),
    amount INTEGER NOT NULL CHECK (amount > 0),
    token_address TEXT NOT NULL,
    method TEXT NOT NULL,
    status TEXT NOT NULL,
    tx_hash TEXT,
    signed_at TEXT,
    confirmed_at TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (submission_id, commitment_id)
);
"#;

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

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

fn bad_col(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn get_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| bad_col(idx, format!("bad timestamp: {e}")))
}

fn get_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| bad_col(idx, format!("bad timestamp: {e}")))
    })
    .transpose()
}

fn sql_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn opt_sql_ts(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(sql_ts)
}

fn map_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        github_login: row.get(1)?,
        wallet_address: row.get(2)?,
        api_token: row.get(3)?,
        created_at: get_ts(row, 4)?,
    })
}

fn map_repo(row: &Row) -> rusqlite::Result<RepoSettings> {
    Ok(RepoSettings {
        id: row.get(0)?,
        github_repo_id: row.get(1)?,
        owner: row.get(2)?,
        name: row.get(3)?,
        webhook_secret: row.get(4)?,
        require_owner_approval: row.get(5)?,
        admin_user_id: row.get(6)?,
        installation_id: row.get(7)?,
        created_at: get_ts(row, 8)?,
    })
}

fn map_bounty(row: &Row) -> rusqlite::Result<Bounty> {
    let status: String = row.get(3)?;
    Ok(Bounty {
        id: row.get(0)?,
        github_repo_id: row.get(1)?,
        issue_number: row.get(2)?,
        status: BountyStatus::parse(&status)
            .ok_or_else(|| bad_col(3, format!("unknown bounty status {status}")))?,
        token_address: row.get(4)?,
        total_funded: row.get(5)?,
        primary_funder_id: row.get(6)?,
        created_at: get_ts(row, 7)?,
        updated_at: get_ts(row, 8)?,
    })
}

fn map_commitment(row: &Row) -> rusqlite::Result<FundingCommitment> {
    Ok(FundingCommitment {
        id: row.get(0)?,
        bounty_id: row.get(1)?,
        funder_id: row.get(2)?,
        amount: row.get(3)?,
        token_address: row.get(4)?,
        created_at: get_ts(row, 5)?,
        withdrawn_at: get_opt_ts(row, 6)?,
    })
}

fn map_submission(row: &Row) -> rusqlite::Result<Submission> {
    let status: String = row.get(7)?;
    Ok(Submission {
        id: row.get(0)?,
        bounty_id: row.get(1)?,
        contributor_id: row.get(2)?,
        github_pr_id: row.get(3)?,
        pr_number: row.get(4)?,
        pr_title: row.get(5)?,
        pr_url: row.get(6)?,
        status: SubmissionStatus::parse(&status)
            .ok_or_else(|| bad_col(7, format!("unknown submission status {status}")))?,
        funder_approved_at: get_opt_ts(row, 8)?,
        funder_approved_by: row.get(9)?,
        owner_approved_at: get_opt_ts(row, 10)?,
        owner_approved_by: row.get(11)?,
        rejected_at: get_opt_ts(row, 12)?,
        rejected_by: row.get(13)?,
        rejection_reason: row.get(14)?,
        merged_at: get_opt_ts(row, 15)?,
        closed_at: get_opt_ts(row, 16)?,
        paid_at: get_opt_ts(row, 17)?,
        created_at: get_ts(row, 18)?,
        updated_at: get_ts(row, 19)?,
    })
}

fn map_payout(row: &Row) -> rusqlite::Result<Payout> {
    let method: String = row.get(7)?;
    let status: String = row.get(8)?;
    Ok(Payout {
        id: row.get(0)?,
        submission_id: row.get(1)?,
        commitment_id: row.get(2)?,
        funder_id: row.get(3)?,
        contributor_id: row.get(4)?,
        amount: row.get(5)?,
        token_address: row.get(6)?,
        method: PayoutMethod::parse(&method)
            .ok_or_else(|| bad_col(7, format!("unknown payout method {method}")))?,
        status: PayoutStatus::parse(&status)
            .ok_or_else(|| bad_col(8, format!("unknown payout status {status}")))?,
        tx_hash: row.get(9)?,
        signed_at: get_opt_ts(row, 10)?,
        confirmed_at: get_opt_ts(row, 11)?,
        created_at: get_ts(row, 12)?,
    })
}

// ============================================================================
// TRANSACTION HELPERS
// ============================================================================

fn bounty_by_id_tx(tx: &Transaction, id: i64) -> Result<Option<Bounty>> {
    Ok(tx
        .query_row(
            &format!("SELECT {BOUNTY_COLS} FROM bounties WHERE id = ?1"),
            params![id],
            map_bounty,
        )
        .optional()?)
}

fn commitments_tx(tx: &Transaction, bounty_id: i64) -> Result<Vec<FundingCommitment>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {COMMITMENT_COLS} FROM funding_commitments \
         WHERE bounty_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map(params![bounty_id], map_commitment)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn submission_by_id_tx(tx: &Transaction, id: i64) -> Result<Submission> {
    tx.query_row(
        &format!("SELECT {SUBMISSION_COLS} FROM submissions WHERE id = ?1"),
        params![id],
        map_submission,
    )
    .optional()?
    .ok_or(EngineError::NotFound("submission"))
}

/// Write back every mutable submission field after a transition.
fn persist_submission(tx: &Transaction, sub: &Submission) -> Result<()> {
    tx.execute(
        "UPDATE submissions SET status = ?1, funder_approved_at = ?2, funder_approved_by = ?3, \
         owner_approved_at = ?4, owner_approved_by = ?5, rejected_at = ?6, rejected_by = ?7, \
         rejection_reason = ?8, merged_at = ?9, closed_at = ?10, paid_at = ?11, updated_at = ?12 \
         WHERE id = ?13",
        params![
            sub.status.as_str(),
            opt_sql_ts(sub.funder_approved_at),
            sub.funder_approved_by,
            opt_sql_ts(sub.owner_approved_at),
            sub.owner_approved_by,
            opt_sql_ts(sub.rejected_at),
            sub.rejected_by,
            sub.rejection_reason,
            opt_sql_ts(sub.merged_at),
            opt_sql_ts(sub.closed_at),
            opt_sql_ts(sub.paid_at),
            sql_ts(sub.updated_at),
            sub.id,
        ],
    )?;
    Ok(())
}

/// Recompute the bounty's cached totals from its commitment rows.
fn refresh_bounty_totals(tx: &Transaction, bounty_id: i64, now: DateTime<Utc>) -> Result<Bounty> {
    let commitments = commitments_tx(tx, bounty_id)?;
    let snap = ledger::snapshot(&commitments);
    tx.execute(
        "UPDATE bounties SET total_funded = ?1, primary_funder_id = ?2, updated_at = ?3 \
         WHERE id = ?4",
        params![snap.total_funded, snap.primary_funder_id, sql_ts(now), bounty_id],
    )?;
    bounty_by_id_tx(tx, bounty_id)?.ok_or(EngineError::NotFound("bounty"))
}

/// Expire every non-terminal submission of a cancelling bounty.
fn expire_submissions(
    tx: &Transaction,
    bounty_id: i64,
    note: &str,
    now: DateTime<Utc>,
) -> Result<Vec<i64>> {
    let subs = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {SUBMISSION_COLS} FROM submissions WHERE bounty_id = ?1"
        ))?;
        let rows = stmt
            .query_map(params![bounty_id], map_submission)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    let mut expired = Vec::new();
    for sub in &subs {
        if let Some(next) = submissions::apply_expiry(sub, now, note) {
            persist_submission(tx, &next)?;
            expired.push(next.id);
        }
    }
    Ok(expired)
}

fn cancel_bounty_tx(
    tx: &Transaction,
    bounty: &Bounty,
    note: &str,
    now: DateTime<Utc>,
) -> Result<(Bounty, Vec<i64>)> {
    tx.execute(
        "UPDATE bounties SET status = 'cancelled', updated_at = ?1 WHERE id = ?2",
        params![sql_ts(now), bounty.id],
    )?;
    let expired = expire_submissions(tx, bounty.id, note, now)?;
    let updated = bounty_by_id_tx(tx, bounty.id)?.ok_or(EngineError::NotFound("bounty"))?;
    Ok((updated, expired))
}

// ============================================================================
// STORAGE IMPL
// ============================================================================

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_user(&self, new: NewUser) -> Result<User> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (github_login, wallet_address, api_token, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                new.github_login,
                new.wallet_address,
                new.api_token,
                sql_ts(Utc::now())
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
            params![id],
            map_user,
        )?)
    }

    async fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                params![id],
                map_user,
            )
            .optional()?)
    }

    async fn user_by_github_login(&self, login: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE LOWER(github_login) = LOWER(?1)"),
                params![login],
                map_user,
            )
            .optional()?)
    }

    async fn user_by_api_token(&self, token: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE api_token = ?1"),
                params![token],
                map_user,
            )
            .optional()?)
    }

    async fn upsert_repo(&self, new: NewRepo) -> Result<RepoSettings> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO repo_settings (github_repo_id, owner, name, webhook_secret, \
             require_owner_approval, admin_user_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT (github_repo_id) DO UPDATE SET \
             owner = excluded.owner, name = excluded.name, \
             webhook_secret = excluded.webhook_secret, \
             require_owner_approval = excluded.require_owner_approval, \
             admin_user_id = excluded.admin_user_id",
            params![
                new.github_repo_id,
                new.owner,
                new.name,
                new.webhook_secret,
                new.require_owner_approval,
                new.admin_user_id,
                sql_ts(Utc::now())
            ],
        )?;
        Ok(conn.query_row(
            &format!("SELECT {REPO_COLS} FROM repo_settings WHERE github_repo_id = ?1"),
            params![new.github_repo_id],
            map_repo,
        )?)
    }

    async fn repo_by_github_id(&self, github_repo_id: i64) -> Result<Option<RepoSettings>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("SELECT {REPO_COLS} FROM repo_settings WHERE github_repo_id = ?1"),
                params![github_repo_id],
                map_repo,
            )
            .optional()?)
    }

    async fn set_installation(
        &self,
        github_repo_id: i64,
        installation_id: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE repo_settings SET installation_id = ?1 WHERE github_repo_id = ?2",
            params![installation_id, github_repo_id],
        )?;
        Ok(changed > 0)
    }

    async fn bounty_by_id(&self, id: i64) -> Result<Option<Bounty>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("SELECT {BOUNTY_COLS} FROM bounties WHERE id = ?1"),
                params![id],
                map_bounty,
            )
            .optional()?)
    }

    async fn bounty_by_issue(
        &self,
        github_repo_id: i64,
        issue_number: i64,
    ) -> Result<Option<Bounty>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {BOUNTY_COLS} FROM bounties \
                     WHERE github_repo_id = ?1 AND issue_number = ?2"
                ),
                params![github_repo_id, issue_number],
                map_bounty,
            )
            .optional()?)
    }

    async fn list_bounties(
        &self,
        status: Option<BountyStatus>,
        github_repo_id: Option<i64>,
    ) -> Result<Vec<Bounty>> {
        let conn = self.conn.lock().unwrap();
        let base = format!("SELECT {BOUNTY_COLS} FROM bounties");
        let order = "ORDER BY created_at DESC, id DESC";
        let rows = match (status, github_repo_id) {
            (Some(s), Some(r)) => {
                let mut stmt = conn.prepare(&format!(
                    "{base} WHERE status = ?1 AND github_repo_id = ?2 {order}"
                ))?;
                let rows = stmt
                    .query_map(params![s.as_str(), r], map_bounty)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            (Some(s), None) => {
                let mut stmt = conn.prepare(&format!("{base} WHERE status = ?1 {order}"))?;
                let rows = stmt
                    .query_map(params![s.as_str()], map_bounty)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            (None, Some(r)) => {
                let mut stmt =
                    conn.prepare(&format!("{base} WHERE github_repo_id = ?1 {order}"))?;
                let rows = stmt
                    .query_map(params![r], map_bounty)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            (None, None) => {
                let mut stmt = conn.prepare(&format!("{base} {order}"))?;
                let rows = stmt
                    .query_map([], map_bounty)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(rows)
    }

    async fn cancel_bounty(&self, bounty_id: i64, note: &str) -> Result<CancelOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let bounty = bounty_by_id_tx(&tx, bounty_id)?.ok_or(EngineError::NotFound("bounty"))?;
        if bounty.status.is_terminal() {
            return Ok(CancelOutcome {
                bounty,
                already_terminal: true,
                expired_submission_ids: Vec::new(),
            });
        }
        let (bounty, expired) = cancel_bounty_tx(&tx, &bounty, note, Utc::now())?;
        tx.commit()?;
        Ok(CancelOutcome {
            bounty,
            already_terminal: false,
            expired_submission_ids: expired,
        })
    }

    async fn add_commitment(&self, req: AddCommitment) -> Result<LedgerUpdate> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {BOUNTY_COLS} FROM bounties \
                     WHERE github_repo_id = ?1 AND issue_number = ?2"
                ),
                params![req.github_repo_id, req.issue_number],
                map_bounty,
            )
            .optional()?;
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
                tx.execute(
                    "INSERT INTO bounties (github_repo_id, issue_number, status, \
                     token_address, total_funded, created_at, updated_at) \
                     VALUES (?1, ?2, 'open', ?3, 0, ?4, ?4)",
                    params![
                        req.github_repo_id,
                        req.issue_number,
                        req.token_address,
                        sql_ts(now)
                    ],
                )?;
                let id = tx.last_insert_rowid();
                let b = bounty_by_id_tx(&tx, id)?.ok_or(EngineError::NotFound("bounty"))?;
                (b, true)
            }
        };

        let commitments = commitments_tx(&tx, bounty.id)?;
        if ledger::active_commitment_for(&commitments, req.funder_id).is_some() {
            return Err(EngineError::DuplicateCommitment);
        }

        tx.execute(
            "INSERT INTO funding_commitments (bounty_id, funder_id, amount, token_address, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                bounty.id,
                req.funder_id,
                req.amount,
                req.token_address,
                sql_ts(now)
            ],
        )?;
        let commitment_id = tx.last_insert_rowid();
        let bounty = refresh_bounty_totals(&tx, bounty.id, now)?;
        let commitment = tx.query_row(
            &format!("SELECT {COMMITMENT_COLS} FROM funding_commitments WHERE id = ?1"),
            params![commitment_id],
            map_commitment,
        )?;
        tx.commit()?;
        Ok(LedgerUpdate {
            bounty,
            commitment,
            bounty_created,
            bounty_cancelled: false,
            expired_submission_ids: Vec::new(),
        })
    }

    async fn withdraw_commitment(&self, bounty_id: i64, funder_id: i64) -> Result<LedgerUpdate> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let bounty = bounty_by_id_tx(&tx, bounty_id)?.ok_or(EngineError::NotFound("bounty"))?;
        if bounty.status.is_terminal() {
            return Err(EngineError::terminal_bounty(bounty.status));
        }
        let commitments = commitments_tx(&tx, bounty_id)?;
        let active = ledger::active_commitment_for(&commitments, funder_id)
            .ok_or(EngineError::NotFound("active commitment"))?;
        let commitment_id = active.id;
        tx.execute(
            "UPDATE funding_commitments SET withdrawn_at = ?1 WHERE id = ?2",
            params![sql_ts(now), commitment_id],
        )?;

        let mut bounty = refresh_bounty_totals(&tx, bounty_id, now)?;
        let mut bounty_cancelled = false;
        let mut expired = Vec::new();
        if bounty.primary_funder_id.is_none() {
            // Last pledge gone: the bounty cannot be won any more.
            let (b, e) = cancel_bounty_tx(
                &tx,
                &bounty,
                crate::bounties::CancelReason::FundingDrained.note(),
                now,
            )?;
            bounty = b;
            expired = e;
            bounty_cancelled = true;
        }
        let commitment = tx.query_row(
            &format!("SELECT {COMMITMENT_COLS} FROM funding_commitments WHERE id = ?1"),
            params![commitment_id],
            map_commitment,
        )?;
        tx.commit()?;
        Ok(LedgerUpdate {
            bounty,
            commitment,
            bounty_created: false,
            bounty_cancelled,
            expired_submission_ids: expired,
        })
    }

    async fn commitments_for_bounty(&self, bounty_id: i64) -> Result<Vec<FundingCommitment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMMITMENT_COLS} FROM funding_commitments \
             WHERE bounty_id = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map(params![bounty_id], map_commitment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn upsert_submission(&self, new: NewSubmission) -> Result<(Submission, bool)> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM submissions WHERE bounty_id = ?1 AND github_pr_id = ?2",
                params![new.bounty_id, new.github_pr_id],
                |row| row.get(0),
            )
            .optional()?;
        let (id, created) = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE submissions SET pr_title = ?1, pr_url = ?2, updated_at = ?3 \
                     WHERE id = ?4",
                    params![new.pr_title, new.pr_url, sql_ts(now), id],
                )?;
                (id, false)
            }
            None => {
                tx.execute(
                    "INSERT INTO submissions (bounty_id, contributor_id, github_pr_id, \
                     pr_number, pr_title, pr_url, status, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
                    params![
                        new.bounty_id,
                        new.contributor_id,
                        new.github_pr_id,
                        new.pr_number,
                        new.pr_title,
                        new.pr_url,
                        sql_ts(now)
                    ],
                )?;
                (tx.last_insert_rowid(), true)
            }
        };
        let sub = submission_by_id_tx(&tx, id)?;
        tx.commit()?;
        Ok((sub, created))
    }

    async fn submission_by_id(&self, id: i64) -> Result<Option<Submission>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("SELECT {SUBMISSION_COLS} FROM submissions WHERE id = ?1"),
                params![id],
                map_submission,
            )
            .optional()?)
    }

    async fn submissions_by_pr(&self, github_pr_id: i64) -> Result<Vec<Submission>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBMISSION_COLS} FROM submissions WHERE github_pr_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![github_pr_id], map_submission)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn submissions_for_bounty(&self, bounty_id: i64) -> Result<Vec<Submission>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBMISSION_COLS} FROM submissions WHERE bounty_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![bounty_id], map_submission)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn record_approval(
        &self,
        submission_id: i64,
        role: ApprovalRole,
        approver_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Submission> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let sub = submission_by_id_tx(&tx, submission_id)?;
        let next = submissions::apply_approval(&sub, role, approver_id, at)?;
        persist_submission(&tx, &next)?;
        tx.commit()?;
        Ok(next)
    }

    async fn record_rejection(
        &self,
        submission_id: i64,
        rejected_by: Option<i64>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Submission> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let sub = submission_by_id_tx(&tx, submission_id)?;
        let next = submissions::apply_rejection(&sub, rejected_by, reason, at)?;
        persist_submission(&tx, &next)?;
        tx.commit()?;
        Ok(next)
    }

    async fn record_merge(&self, github_pr_id: i64, at: DateTime<Utc>) -> Result<Vec<Submission>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let subs = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {SUBMISSION_COLS} FROM submissions WHERE github_pr_id = ?1"
            ))?;
            let rows = stmt
                .query_map(params![github_pr_id], map_submission)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let mut changed = Vec::new();
        for sub in &subs {
            if let Some(next) = submissions::apply_merge(sub, at) {
                persist_submission(&tx, &next)?;
                changed.push(next);
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    async fn record_close_unmerged(
        &self,
        github_pr_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Vec<ClosedSubmission>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let subs = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {SUBMISSION_COLS} FROM submissions WHERE github_pr_id = ?1"
            ))?;
            let rows = stmt
                .query_map(params![github_pr_id], map_submission)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let mut closed = Vec::new();
        for sub in &subs {
            if let Some(next) = submissions::apply_close_unmerged(sub, at) {
                persist_submission(&tx, &next)?;
                let remaining: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM submissions WHERE bounty_id = ?1 \
                     AND status IN ('pending', 'approved')",
                    params![next.bounty_id],
                    |row| row.get(0),
                )?;
                closed.push(ClosedSubmission {
                    submission: next,
                    remaining_active: remaining as usize,
                });
            }
        }
        tx.commit()?;
        Ok(closed)
    }

    async fn insert_access_key(&self, new: NewAccessKey) -> Result<AccessKey> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now();
        tx.execute(
            "INSERT INTO access_keys (user_id, key_id, status, expires_at, created_at) \
             VALUES (?1, ?2, 'active', ?3, ?4)",
            params![new.user_id, new.key_id, opt_sql_ts(new.expires_at), sql_ts(now)],
        )?;
        let key_row_id = tx.last_insert_rowid();
        for limit in &new.limits {
            tx.execute(
                "INSERT INTO access_key_limits (access_key_id, token_address, \
                 initial_amount, remaining_amount) VALUES (?1, ?2, ?3, ?3)",
                params![key_row_id, limit.token_address, limit.initial],
            )?;
        }
        let key = load_access_key(&tx, key_row_id)?;
        tx.commit()?;
        Ok(key)
    }

    async fn access_keys_for_user(&self, user_id: i64) -> Result<Vec<AccessKey>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM access_keys WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let mut keys = Vec::with_capacity(ids.len());
        for id in ids {
            keys.push(load_access_key(&tx, id)?);
        }
        tx.commit()?;
        Ok(keys)
    }

    async fn active_access_key(&self, user_id: i64) -> Result<Option<AccessKey>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM access_keys WHERE user_id = ?1 AND status = 'active' \
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        let key = match id {
            Some(id) => Some(load_access_key(&tx, id)?),
            None => None,
        };
        tx.commit()?;
        Ok(key)
    }

    async fn revoke_access_key(
        &self,
        user_id: i64,
        key_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE access_keys SET status = 'revoked', revoked_at = ?1 \
             WHERE user_id = ?2 AND key_id = ?3 AND status = 'active'",
            params![sql_ts(at), user_id, key_id],
        )?;
        Ok(changed > 0)
    }

    async fn expire_access_keys(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE access_keys SET status = 'expired' \
             WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?1",
            params![sql_ts(now)],
        )?;
        Ok(changed as u64)
    }

    async fn raise_spend_limit(
        &self,
        user_id: i64,
        token_address: &str,
        amount: i64,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let key_ids: Vec<i64> = {
            let mut stmt =
                tx.prepare("SELECT id FROM access_keys WHERE user_id = ?1 AND status = 'active'")?;
            let rows = stmt
                .query_map(params![user_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        for key_id in key_ids {
            tx.execute(
                "INSERT INTO access_key_limits (access_key_id, token_address, \
                 initial_amount, remaining_amount) VALUES (?1, ?2, ?3, ?3) \
                 ON CONFLICT (access_key_id, token_address) DO UPDATE SET \
                 initial_amount = initial_amount + excluded.initial_amount, \
                 remaining_amount = remaining_amount + excluded.remaining_amount",
                params![key_id, token_address, amount],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn reserve_spend(
        &self,
        key_id: &str,
        token_address: &str,
        amount: i64,
    ) -> Result<SpendReservation> {
        let conn = self.conn.lock().unwrap();
        // Check-and-decrement in one statement; two concurrent payouts
        // cannot both pass the check against the same headroom.
        let changed = conn.execute(
            "UPDATE access_key_limits SET remaining_amount = remaining_amount - ?1 \
             WHERE access_key_id = (SELECT id FROM access_keys \
                                    WHERE key_id = ?2 AND status = 'active') \
             AND token_address = ?3 AND remaining_amount >= ?1",
            params![amount, key_id, token_address],
        )?;
        if changed > 0 {
            return Ok(SpendReservation::Reserved);
        }
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM access_key_limits l \
             JOIN access_keys k ON k.id = l.access_key_id \
             WHERE k.key_id = ?1 AND k.status = 'active' AND l.token_address = ?2",
            params![key_id, token_address],
            |row| row.get(0),
        )?;
        if exists > 0 {
            Ok(SpendReservation::InsufficientRemaining)
        } else {
            Ok(SpendReservation::NotAvailable)
        }
    }

    async fn release_spend(&self, key_id: &str, token_address: &str, amount: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE access_key_limits \
             SET remaining_amount = MIN(initial_amount, remaining_amount + ?1) \
             WHERE access_key_id = (SELECT id FROM access_keys WHERE key_id = ?2) \
             AND token_address = ?3",
            params![amount, key_id, token_address],
        )?;
        Ok(())
    }

    async fn insert_payouts(&self, rows: Vec<NewPayout>) -> Result<Vec<Payout>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let mut submission_id = None;
        for row in &rows {
            submission_id = Some(row.submission_id);
            // New rows start on the manual path; automated signing
            // upgrades them when it succeeds.
            tx.execute(
                "INSERT INTO payouts (id, submission_id, commitment_id, funder_id, \
                 contributor_id, amount, token_address, method, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'manual', 'awaiting_signature', ?8) \
                 ON CONFLICT (submission_id, commitment_id) DO NOTHING",
                params![
                    row.id,
                    row.submission_id,
                    row.commitment_id,
                    row.funder_id,
                    row.contributor_id,
                    row.amount,
                    row.token_address,
                    sql_ts(now)
                ],
            )?;
        }
        let all = match submission_id {
            Some(id) => {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {PAYOUT_COLS} FROM payouts WHERE submission_id = ?1 ORDER BY created_at, id"
                ))?;
                let rows = stmt
                    .query_map(params![id], map_payout)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => Vec::new(),
        };
        tx.commit()?;
        Ok(all)
    }

    async fn payout_by_id(&self, id: &str) -> Result<Option<Payout>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("SELECT {PAYOUT_COLS} FROM payouts WHERE id = ?1"),
                params![id],
                map_payout,
            )
            .optional()?)
    }

    async fn payouts_for_submission(&self, submission_id: i64) -> Result<Vec<Payout>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PAYOUT_COLS} FROM payouts WHERE submission_id = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map(params![submission_id], map_payout)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn mark_payout_signed(
        &self,
        payout_id: &str,
        tx_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<Payout> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE payouts SET method = 'automated', status = 'signed', tx_hash = ?1, \
             signed_at = ?2 WHERE id = ?3 AND status = 'awaiting_signature'",
            params![tx_hash, sql_ts(at), payout_id],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound("payout awaiting signature"));
        }
        Ok(conn.query_row(
            &format!("SELECT {PAYOUT_COLS} FROM payouts WHERE id = ?1"),
            params![payout_id],
            map_payout,
        )?)
    }

    async fn confirm_payout(
        &self,
        payout_id: &str,
        tx_hash: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<PayoutConfirmed> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let payout = tx
            .query_row(
                &format!("SELECT {PAYOUT_COLS} FROM payouts WHERE id = ?1"),
                params![payout_id],
                map_payout,
            )
            .optional()?
            .ok_or(EngineError::NotFound("payout"))?;

        if payout.status == PayoutStatus::Confirmed {
            let unconfirmed: i64 = tx.query_row(
                "SELECT COUNT(*) FROM payouts WHERE submission_id = ?1 AND status != 'confirmed'",
                params![payout.submission_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            return Ok(PayoutConfirmed {
                payout,
                already_confirmed: true,
                all_confirmed: unconfirmed == 0,
                submission: None,
                bounty: None,
            });
        }

        tx.execute(
            "UPDATE payouts SET status = 'confirmed', confirmed_at = ?1, \
             tx_hash = COALESCE(?2, tx_hash) WHERE id = ?3",
            params![sql_ts(at), tx_hash, payout_id],
        )?;
        let payout = tx.query_row(
            &format!("SELECT {PAYOUT_COLS} FROM payouts WHERE id = ?1"),
            params![payout_id],
            map_payout,
        )?;

        let unconfirmed: i64 = tx.query_row(
            "SELECT COUNT(*) FROM payouts WHERE submission_id = ?1 AND status != 'confirmed'",
            params![payout.submission_id],
            |row| row.get(0),
        )?;
        let mut settled_submission = None;
        let mut completed_bounty = None;
        if unconfirmed == 0 {
            let sub = submission_by_id_tx(&tx, payout.submission_id)?;
            if sub.status == SubmissionStatus::Merged {
                let paid = submissions::apply_paid(&sub, at)?;
                persist_submission(&tx, &paid)?;
                let bounty =
                    bounty_by_id_tx(&tx, paid.bounty_id)?.ok_or(EngineError::NotFound("bounty"))?;
                if bounty.status == BountyStatus::Open {
                    tx.execute(
                        "UPDATE bounties SET status = 'completed', updated_at = ?1 WHERE id = ?2",
                        params![sql_ts(at), bounty.id],
                    )?;
                    completed_bounty = bounty_by_id_tx(&tx, bounty.id)?;
                }
                settled_submission = Some(paid);
            }
        }
        tx.commit()?;
        Ok(PayoutConfirmed {
            payout,
            already_confirmed: false,
            all_confirmed: unconfirmed == 0,
            submission: settled_submission,
            bounty: completed_bounty,
        })
    }
}

fn load_access_key(tx: &Transaction, row_id: i64) -> Result<AccessKey> {
    let (id, user_id, key_id, status, expires_at, created_at, revoked_at) = tx.query_row(
        "SELECT id, user_id, key_id, status, expires_at, created_at, revoked_at \
         FROM access_keys WHERE id = ?1",
        params![row_id],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                get_opt_ts(row, 4)?,
                get_ts(row, 5)?,
                get_opt_ts(row, 6)?,
            ))
        },
    )?;
    let status = AccessKeyStatus::parse(&status)
        .ok_or_else(|| EngineError::Database(format!("unknown access key status {status}")))?;
    let limits = {
        let mut stmt = tx.prepare(
            "SELECT token_address, initial_amount, remaining_amount \
             FROM access_key_limits WHERE access_key_id = ?1 ORDER BY token_address",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(SpendLimit {
                    token_address: row.get(0)?,
                    initial: row.get(1)?,
                    remaining: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    Ok(AccessKey {
        id,
        user_id,
        key_id,
        status,
        expires_at,
        created_at,
        revoked_at,
        limits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SpendLimit;

    async fn storage_with_users() -> (SqliteStorage, User, User, User) {
        let storage = SqliteStorage::in_memory().unwrap();
        let a = storage
            .create_user(NewUser {
                github_login: "funder-a".into(),
                wallet_address: Some("0xaaa".into()),
                api_token: Some("token-a".into()),
            })
            .await
            .unwrap();
        let b = storage
            .create_user(NewUser {
                github_login: "funder-b".into(),
                wallet_address: Some("0xbbb".into()),
                api_token: Some("token-b".into()),
            })
            .await
            .unwrap();
        let c = storage
            .create_user(NewUser {
                github_login: "octocat".into(),
                wallet_address: Some("0xccc".into()),
                api_token: Some("token-c".into()),
            })
            .await
            .unwrap();
        (storage, a, b, c)
    }

    fn fund(funder_id: i64, amount: i64) -> AddCommitment {
        AddCommitment {
            github_repo_id: 42,
            issue_number: 101,
            funder_id,
            amount,
            token_address: "0xusdc".into(),
        }
    }

    #[tokio::test]
    async fn test_funding_creates_bounty_and_tracks_totals() {
        let (storage, a, b, _) = storage_with_users().await;

        let first = storage.add_commitment(fund(a.id, 1500)).await.unwrap();
        assert!(first.bounty_created);
        assert_eq!(first.bounty.total_funded, 1500);
        assert_eq!(first.bounty.primary_funder_id, Some(a.id));
        assert_eq!(first.bounty.status, BountyStatus::Open);

        let second = storage.add_commitment(fund(b.id, 800)).await.unwrap();
        assert!(!second.bounty_created);
        assert_eq!(second.bounty.total_funded, 2300);
        assert_eq!(second.bounty.primary_funder_id, Some(a.id));

        // A withdraws: primacy passes to B.
        let after = storage
            .withdraw_commitment(second.bounty.id, a.id)
            .await
            .unwrap();
        assert_eq!(after.bounty.total_funded, 800);
        assert_eq!(after.bounty.primary_funder_id, Some(b.id));
        assert!(!after.bounty_cancelled);
    }

    #[tokio::test]
    async fn test_duplicate_active_commitment_rejected() {
        let (storage, a, _, _) = storage_with_users().await;
        let first = storage.add_commitment(fund(a.id, 1500)).await.unwrap();
        let err = storage.add_commitment(fund(a.id, 500)).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateCommitment));
        let bounty = storage
            .bounty_by_id(first.bounty.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bounty.total_funded, 1500);

        // After withdrawing, the funder may pledge again.
        storage
            .withdraw_commitment(bounty.id, a.id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_last_withdrawal_cancels_and_expires() {
        let (storage, a, _, c) = storage_with_users().await;
        let update = storage.add_commitment(fund(a.id, 1500)).await.unwrap();
        let (sub, created) = storage
            .upsert_submission(NewSubmission {
                bounty_id: update.bounty.id,
                contributor_id: c.id,
                github_pr_id: 900_145,
                pr_number: 145,
                pr_title: Some("Fix leak".into()),
                pr_url: None,
            })
            .await
            .unwrap();
        assert!(created);

        let after = storage
            .withdraw_commitment(update.bounty.id, a.id)
            .await
            .unwrap();
        assert!(after.bounty_cancelled);
        assert_eq!(after.bounty.status, BountyStatus::Cancelled);
        assert_eq!(after.bounty.primary_funder_id, None);
        assert_eq!(after.bounty.total_funded, 0);
        assert_eq!(after.expired_submission_ids, vec![sub.id]);

        let expired = storage.submission_by_id(sub.id).await.unwrap().unwrap();
        assert_eq!(expired.status, SubmissionStatus::Expired);

        // Terminal bounty rejects further funding.
        let err = storage.add_commitment(fund(a.id, 100)).await.unwrap_err();
        assert!(matches!(err, EngineError::TerminalBounty { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_expires_merged_but_unpaid_submission() {
        // GitHub closes the fixing issue when the PR merges; the sole
        // funder may also withdraw afterwards. Either way the merged
        // submission must not stay stuck waiting for a payout that can
        // never start.
        let (storage, a, _, c) = storage_with_users().await;
        let update = storage.add_commitment(fund(a.id, 1500)).await.unwrap();
        let (sub, _) = storage
            .upsert_submission(NewSubmission {
                bounty_id: update.bounty.id,
                contributor_id: c.id,
                github_pr_id: 900_148,
                pr_number: 148,
                pr_title: None,
                pr_url: None,
            })
            .await
            .unwrap();
        storage.record_merge(900_148, Utc::now()).await.unwrap();

        let after = storage
            .withdraw_commitment(update.bounty.id, a.id)
            .await
            .unwrap();
        assert!(after.bounty_cancelled);
        assert_eq!(after.expired_submission_ids, vec![sub.id]);

        let expired = storage.submission_by_id(sub.id).await.unwrap().unwrap();
        assert_eq!(expired.status, SubmissionStatus::Expired);
        assert!(expired.merged_at.is_some());
    }

    #[tokio::test]
    async fn test_submission_upsert_is_idempotent() {
        let (storage, a, _, c) = storage_with_users().await;
        let update = storage.add_commitment(fund(a.id, 1500)).await.unwrap();
        let new = NewSubmission {
            bounty_id: update.bounty.id,
            contributor_id: c.id,
            github_pr_id: 900_145,
            pr_number: 145,
            pr_title: Some("Fix leak".into()),
            pr_url: Some("https://github.com/acme/widgets/pull/145".into()),
        };
        let (first, created) = storage.upsert_submission(new.clone()).await.unwrap();
        assert!(created);
        let (second, created_again) = storage
            .upsert_submission(NewSubmission {
                pr_title: Some("Fix leak (v2)".into()),
                ..new
            })
            .await
            .unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);
        assert_eq!(second.pr_title.as_deref(), Some("Fix leak (v2)"));
        assert_eq!(
            storage.submissions_by_pr(900_145).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_merge_delivery_applies_once() {
        let (storage, a, _, c) = storage_with_users().await;
        let update = storage.add_commitment(fund(a.id, 1500)).await.unwrap();
        storage
            .upsert_submission(NewSubmission {
                bounty_id: update.bounty.id,
                contributor_id: c.id,
                github_pr_id: 900_148,
                pr_number: 148,
                pr_title: None,
                pr_url: None,
            })
            .await
            .unwrap();

        let at = Utc::now();
        let changed = storage.record_merge(900_148, at).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, SubmissionStatus::Merged);

        // Redelivery of the same webhook changes nothing.
        let repeat = storage.record_merge(900_148, at).await.unwrap();
        assert!(repeat.is_empty());
    }

    #[tokio::test]
    async fn test_close_unmerged_reports_remaining_active() {
        let (storage, a, _, c) = storage_with_users().await;
        let b_user = storage
            .create_user(NewUser {
                github_login: "hubot".into(),
                wallet_address: None,
                api_token: None,
            })
            .await
            .unwrap();
        let update = storage.add_commitment(fund(a.id, 1500)).await.unwrap();
        for (contributor, pr) in [(c.id, 900_145), (b_user.id, 900_148)] {
            storage
                .upsert_submission(NewSubmission {
                    bounty_id: update.bounty.id,
                    contributor_id: contributor,
                    github_pr_id: pr,
                    pr_number: pr - 900_000,
                    pr_title: None,
                    pr_url: None,
                })
                .await
                .unwrap();
        }

        let closed = storage
            .record_close_unmerged(900_145, Utc::now())
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].submission.status, SubmissionStatus::Rejected);
        assert_eq!(closed[0].remaining_active, 1);
        // Bounty unaffected either way.
        let bounty = storage
            .bounty_by_id(update.bounty.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bounty.status, BountyStatus::Open);

        let closed = storage
            .record_close_unmerged(900_148, Utc::now())
            .await
            .unwrap();
        assert_eq!(closed[0].remaining_active, 0);
        let bounty = storage
            .bounty_by_id(update.bounty.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bounty.status, BountyStatus::Open);
    }

    #[tokio::test]
    async fn test_spend_limit_reserve_and_release() {
        let (storage, a, _, _) = storage_with_users().await;
        storage
            .insert_access_key(NewAccessKey {
                user_id: a.id,
                key_id: "key_abc".into(),
                expires_at: None,
                limits: vec![SpendLimit {
                    token_address: "0xusdc".into(),
                    initial: 1000,
                    remaining: 1000,
                }],
            })
            .await
            .unwrap();

        assert_eq!(
            storage.reserve_spend("key_abc", "0xusdc", 700).await.unwrap(),
            SpendReservation::Reserved
        );
        // 300 left: a second 700 reservation must not pass.
        assert_eq!(
            storage.reserve_spend("key_abc", "0xusdc", 700).await.unwrap(),
            SpendReservation::InsufficientRemaining
        );
        assert_eq!(
            storage.reserve_spend("key_abc", "0xdai", 1).await.unwrap(),
            SpendReservation::NotAvailable
        );

        storage.release_spend("key_abc", "0xusdc", 700).await.unwrap();
        let key = storage.active_access_key(a.id).await.unwrap().unwrap();
        assert_eq!(key.limits[0].remaining, 1000);

        // Release never pushes remaining past initial.
        storage.release_spend("key_abc", "0xusdc", 500).await.unwrap();
        let key = storage.active_access_key(a.id).await.unwrap().unwrap();
        assert_eq!(key.limits[0].remaining, 1000);
    }

    #[tokio::test]
    async fn test_raise_spend_limit_tracks_new_pledges() {
        let (storage, a, _, _) = storage_with_users().await;
        storage
            .insert_access_key(NewAccessKey {
                user_id: a.id,
                key_id: "key_abc".into(),
                expires_at: None,
                limits: vec![],
            })
            .await
            .unwrap();

        storage.raise_spend_limit(a.id, "0xusdc", 1500).await.unwrap();
        storage.raise_spend_limit(a.id, "0xusdc", 500).await.unwrap();
        let key = storage.active_access_key(a.id).await.unwrap().unwrap();
        assert_eq!(key.limits.len(), 1);
        assert_eq!(key.limits[0].initial, 2000);
        assert_eq!(key.limits[0].remaining, 2000);
    }

    #[tokio::test]
    async fn test_revoke_and_expire_keys() {
        let (storage, a, _, _) = storage_with_users().await;
        storage
            .insert_access_key(NewAccessKey {
                user_id: a.id,
                key_id: "key_old".into(),
                expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
                limits: vec![],
            })
            .await
            .unwrap();
        storage
            .insert_access_key(NewAccessKey {
                user_id: a.id,
                key_id: "key_new".into(),
                expires_at: None,
                limits: vec![],
            })
            .await
            .unwrap();

        assert_eq!(storage.expire_access_keys(Utc::now()).await.unwrap(), 1);
        let active = storage.active_access_key(a.id).await.unwrap().unwrap();
        assert_eq!(active.key_id, "key_new");

        assert!(storage
            .revoke_access_key(a.id, "key_new", Utc::now())
            .await
            .unwrap());
        // Already revoked: no active row matches.
        assert!(!storage
            .revoke_access_key(a.id, "key_new", Utc::now())
            .await
            .unwrap());
        assert!(storage.active_access_key(a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_confirm_payout_settles_submission_and_bounty() {
        let (storage, a, b, c) = storage_with_users().await;
        let update = storage.add_commitment(fund(a.id, 1500)).await.unwrap();
        storage.add_commitment(fund(b.id, 800)).await.unwrap();
        let (sub, _) = storage
            .upsert_submission(NewSubmission {
                bounty_id: update.bounty.id,
                contributor_id: c.id,
                github_pr_id: 900_148,
                pr_number: 148,
                pr_title: None,
                pr_url: None,
            })
            .await
            .unwrap();
        storage.record_merge(900_148, Utc::now()).await.unwrap();

        let commitments = storage
            .commitments_for_bounty(update.bounty.id)
            .await
            .unwrap();
        let rows: Vec<NewPayout> = commitments
            .iter()
            .map(|cm| NewPayout {
                id: format!("payout-{}", cm.id),
                submission_id: sub.id,
                commitment_id: cm.id,
                funder_id: cm.funder_id,
                contributor_id: c.id,
                amount: cm.amount,
                token_address: cm.token_address.clone(),
            })
            .collect();
        let payouts = storage.insert_payouts(rows.clone()).await.unwrap();
        assert_eq!(payouts.len(), 2);
        // Re-planning is a no-op thanks to the (submission, commitment) key.
        assert_eq!(storage.insert_payouts(rows).await.unwrap().len(), 2);

        let first = storage
            .confirm_payout(&payouts[0].id, Some("0xtx1"), Utc::now())
            .await
            .unwrap();
        assert!(!first.all_confirmed);
        assert!(first.submission.is_none());

        let second = storage
            .confirm_payout(&payouts[1].id, Some("0xtx2"), Utc::now())
            .await
            .unwrap();
        assert!(second.all_confirmed);
        let settled = second.submission.unwrap();
        assert_eq!(settled.status, SubmissionStatus::Paid);
        let completed = second.bounty.unwrap();
        assert_eq!(completed.status, BountyStatus::Completed);

        // Watcher retry: recorded once, flagged as a repeat.
        let repeat = storage
            .confirm_payout(&payouts[1].id, Some("0xtx2"), Utc::now())
            .await
            .unwrap();
        assert!(repeat.already_confirmed);
        assert!(repeat.all_confirmed);
    }
}
