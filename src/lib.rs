//! Bounty Board - fund GitHub issues, pay out merged pull requests
//!
//! Marketplace backend connecting issue funders with contributors.
//!
//! # How it works
//!
//! 1. Funders put token commitments on GitHub issues; the first
//!    commitment opens the bounty and the earliest active funder is its
//!    primary funder
//! 2. Contributors open pull requests referencing the funded issue;
//!    webhook deliveries link them as submissions
//! 3. The primary funder (and optionally the repository owner) approve
//!    a submission; merging the PR makes it payable
//! 4. Payouts are signed automatically through the funder's delegated
//!    access key when its spend limit allows, and fall back to a manual
//!    signature otherwise
//! 5. On-chain confirmation settles the submission as paid and
//!    completes the bounty
//!
//! # Integrity rules
//!
//! - Webhook deliveries are verified with HMAC-SHA256 before any state
//!   change
//! - Bounty totals are recomputed from commitment rows inside the same
//!   transaction as every ledger mutation
//! - Completed and cancelled bounties are terminal; reopening the issue
//!   does not resurrect them
//! - The on-chain authorization is re-checked before every automated
//!   transfer; cached spend limits only stop local overspend

pub mod access_keys;
pub mod auth;
pub mod bounties;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod github;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod payouts;
pub mod pg_storage;
pub mod server;
pub mod signer;
pub mod sqlite_storage;
pub mod storage;
pub mod submissions;
pub mod webhook;

pub use config::Config;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use github::GitHubClient;
pub use notify::{HttpNotifier, NoopNotifier, Notifier};
pub use payouts::PayoutRunner;
pub use pg_storage::PgStorage;
pub use signer::{PayoutSigner, RpcSigner};
pub use sqlite_storage::SqliteStorage;
pub use storage::Storage;
