//! Orchestration layer tying the ledger, submission lifecycle, access
//! keys, and payouts together.
//!
//! The engine owns the storage handle and the outbound side effects
//! (GitHub comments, notifications, payout signing). Storage mutations
//! are transactional and authoritative; every side effect is
//! best-effort and runs after the commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::auth;
use crate::bounties::{self, CancelReason};
use crate::error::{EngineError, Result};
use crate::events::{
    InstallationAction, InstallationEvent, InstallationRepositoriesEvent, IssuesAction,
    IssuesEvent, PullRequestAction, PullRequestEvent, WebhookEvent,
};
use crate::github::GitHubClient;
use crate::models::{
    AccessKey, Bounty, BountyStatus, Payout, RepoSettings, SpendLimit, Submission, User,
};
use crate::notify::{self, Notification, NotificationKind, Notifier};
use crate::payouts::{plan_payouts, PayoutRunner};
use crate::signer::PayoutSigner;
use crate::storage::{
    AddCommitment, CancelOutcome, LedgerUpdate, NewAccessKey, NewRepo, NewSubmission, NewUser,
    PayoutConfirmed, Storage,
};
use crate::submissions::{self, ApprovalRole};

pub struct Engine {
    storage: Arc<dyn Storage>,
    github: Arc<GitHubClient>,
    notifier: Arc<dyn Notifier>,
    payouts: PayoutRunner,
    app_webhook_secret: Option<String>,
}

impl Engine {
    pub fn new(
        storage: Arc<dyn Storage>,
        github: Arc<GitHubClient>,
        notifier: Arc<dyn Notifier>,
        signer: Option<Arc<dyn PayoutSigner>>,
        app_webhook_secret: Option<String>,
    ) -> Self {
        let payouts = PayoutRunner::new(storage.clone(), signer, notifier.clone());
        Self {
            storage,
            github,
            notifier,
            payouts,
            app_webhook_secret,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Secret for app-level webhook deliveries.
    pub fn app_webhook_secret(&self) -> Option<&str> {
        self.app_webhook_secret.as_deref()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub async fn register_user(
        &self,
        github_login: &str,
        wallet_address: Option<String>,
    ) -> Result<User> {
        let login = github_login.trim();
        if login.is_empty() {
            return Err(EngineError::InvalidInput("github_login is required".into()));
        }
        if let Some(existing) = self.storage.user_by_github_login(login).await? {
            return Err(EngineError::InvalidInput(format!(
                "user {} is already registered",
                existing.github_login
            )));
        }
        self.storage
            .create_user(NewUser {
                github_login: login.to_string(),
                wallet_address,
                api_token: Some(auth::generate_api_token()),
            })
            .await
    }

    /// Register or refresh a repository. The webhook secret survives
    /// re-registration so GitHub's hook configuration stays valid.
    pub async fn register_repo(
        &self,
        admin: &User,
        github_repo_id: i64,
        owner: &str,
        name: &str,
        require_owner_approval: bool,
    ) -> Result<RepoSettings> {
        if owner.trim().is_empty() || name.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "repository owner and name are required".into(),
            ));
        }
        let webhook_secret = match self.storage.repo_by_github_id(github_repo_id).await? {
            Some(existing) => existing.webhook_secret,
            None => auth::generate_webhook_secret(),
        };
        self.storage
            .upsert_repo(NewRepo {
                github_repo_id,
                owner: owner.trim().to_string(),
                name: name.trim().to_string(),
                webhook_secret,
                require_owner_approval,
                admin_user_id: Some(admin.id),
            })
            .await
    }

    // ------------------------------------------------------------------
    // Funding ledger
    // ------------------------------------------------------------------

    pub async fn fund_bounty(
        &self,
        funder: &User,
        github_repo_id: i64,
        issue_number: i64,
        amount: i64,
        token_address: &str,
    ) -> Result<LedgerUpdate> {
        if amount <= 0 {
            return Err(EngineError::InvalidInput(
                "funding amount must be positive".into(),
            ));
        }
        if token_address.trim().is_empty() {
            return Err(EngineError::InvalidInput("token_address is required".into()));
        }
        let repo = self
            .storage
            .repo_by_github_id(github_repo_id)
            .await?
            .ok_or(EngineError::NotFound("repository"))?;

        let update = self
            .storage
            .add_commitment(AddCommitment {
                github_repo_id,
                issue_number,
                funder_id: funder.id,
                amount,
                token_address: token_address.trim().to_string(),
            })
            .await?;
        self.storage
            .raise_spend_limit(funder.id, token_address.trim(), amount)
            .await?;
        info!(
            bounty_id = update.bounty.id,
            funder_id = funder.id,
            amount,
            created = update.bounty_created,
            "funding commitment added"
        );

        let issue = issue_number as u64;
        if update.bounty_created {
            self.label_best_effort(&repo, issue, &["bounty"]).await;
        }
        self.comment_best_effort(
            &repo,
            issue,
            format!(
                "A bounty of {} base units now backs this issue (total {}).",
                amount, update.bounty.total_funded
            ),
        )
        .await;
        Ok(update)
    }

    pub async fn withdraw_funding(&self, funder: &User, bounty_id: i64) -> Result<LedgerUpdate> {
        let update = self.storage.withdraw_commitment(bounty_id, funder.id).await?;
        info!(
            bounty_id,
            funder_id = funder.id,
            cancelled = update.bounty_cancelled,
            "funding commitment withdrawn"
        );
        if update.bounty_cancelled {
            self.announce_cancellation(&update.bounty, &update.expired_submission_ids)
                .await;
        }
        Ok(update)
    }

    /// Explicit cancellation by the primary funder.
    pub async fn cancel_bounty(&self, user: &User, bounty_id: i64) -> Result<CancelOutcome> {
        let bounty = self
            .storage
            .bounty_by_id(bounty_id)
            .await?
            .ok_or(EngineError::NotFound("bounty"))?;
        bounties::ensure_open(&bounty)?;
        if !bounties::is_primary_funder(&bounty, user.id) {
            return Err(EngineError::Forbidden(
                "only the primary funder can cancel a bounty".into(),
            ));
        }
        let outcome = self
            .storage
            .cancel_bounty(bounty_id, CancelReason::FunderRequest.note())
            .await?;
        if !outcome.already_terminal {
            self.announce_cancellation(&outcome.bounty, &outcome.expired_submission_ids)
                .await;
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Submission review
    // ------------------------------------------------------------------

    pub async fn approve_submission(
        &self,
        user: &User,
        submission_id: i64,
        role: ApprovalRole,
    ) -> Result<Submission> {
        let submission = self
            .storage
            .submission_by_id(submission_id)
            .await?
            .ok_or(EngineError::NotFound("submission"))?;
        let bounty = self
            .storage
            .bounty_by_id(submission.bounty_id)
            .await?
            .ok_or(EngineError::NotFound("bounty"))?;
        bounties::ensure_open(&bounty)?;
        let repo = self
            .storage
            .repo_by_github_id(bounty.github_repo_id)
            .await?
            .ok_or(EngineError::NotFound("repository"))?;
        match role {
            ApprovalRole::Funder => {
                if !bounties::is_primary_funder(&bounty, user.id) {
                    return Err(EngineError::Forbidden(
                        "only the primary funder can approve as funder".into(),
                    ));
                }
            }
            ApprovalRole::Owner => {
                if repo.admin_user_id != Some(user.id) {
                    return Err(EngineError::Forbidden(
                        "only the repository admin can approve as owner".into(),
                    ));
                }
            }
        }

        let approved = self
            .storage
            .record_approval(submission_id, role, user.id, Utc::now())
            .await?;
        info!(submission_id, approver = user.id, %role, "approval recorded");

        if submissions::payout_ready(&approved, repo.require_owner_approval) {
            self.start_payouts(&approved).await?;
        }
        Ok(approved)
    }

    pub async fn reject_submission(
        &self,
        user: &User,
        submission_id: i64,
        reason: &str,
    ) -> Result<Submission> {
        let submission = self
            .storage
            .submission_by_id(submission_id)
            .await?
            .ok_or(EngineError::NotFound("submission"))?;
        let bounty = self
            .storage
            .bounty_by_id(submission.bounty_id)
            .await?
            .ok_or(EngineError::NotFound("bounty"))?;
        bounties::ensure_open(&bounty)?;
        if !bounties::is_primary_funder(&bounty, user.id) {
            return Err(EngineError::Forbidden(
                "only the primary funder can reject a submission".into(),
            ));
        }
        let reason = if reason.trim().is_empty() {
            "rejected by the primary funder"
        } else {
            reason.trim()
        };
        let rejected = self
            .storage
            .record_rejection(submission_id, Some(user.id), reason, Utc::now())
            .await?;
        notify::dispatch_best_effort(
            self.notifier.as_ref(),
            Notification::new(
                NotificationKind::SubmissionRejected,
                format!("your submission was rejected: {reason}"),
            )
            .recipient(rejected.contributor_id)
            .bounty(rejected.bounty_id)
            .submission(rejected.id),
        )
        .await;
        Ok(rejected)
    }

    // ------------------------------------------------------------------
    // Access keys
    // ------------------------------------------------------------------

    pub async fn register_access_key(
        &self,
        user: &User,
        key_id: &str,
        expires_at: Option<DateTime<Utc>>,
        limits: Vec<SpendLimit>,
    ) -> Result<AccessKey> {
        if key_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("key_id is required".into()));
        }
        if limits.is_empty() {
            return Err(EngineError::InvalidInput(
                "an access key needs at least one spend limit".into(),
            ));
        }
        if limits.iter().any(|l| l.initial <= 0 || l.token_address.trim().is_empty()) {
            return Err(EngineError::InvalidInput(
                "spend limits need a token address and a positive amount".into(),
            ));
        }
        self.storage
            .insert_access_key(NewAccessKey {
                user_id: user.id,
                key_id: key_id.trim().to_string(),
                expires_at,
                limits: limits
                    .into_iter()
                    .map(|l| SpendLimit {
                        remaining: l.initial,
                        ..l
                    })
                    .collect(),
            })
            .await
    }

    pub async fn list_access_keys(&self, user: &User) -> Result<Vec<AccessKey>> {
        self.storage.access_keys_for_user(user.id).await
    }

    pub async fn revoke_access_key(&self, user: &User, key_id: &str) -> Result<()> {
        let revoked = self
            .storage
            .revoke_access_key(user.id, key_id, Utc::now())
            .await?;
        if !revoked {
            return Err(EngineError::NotFound("active access key"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Payout settlement
    // ------------------------------------------------------------------

    /// Confirmation callback from the payout watcher (or the funder's
    /// manual signing flow). Safe to repeat.
    pub async fn confirm_payout(
        &self,
        payout_id: &str,
        tx_hash: Option<&str>,
    ) -> Result<PayoutConfirmed> {
        let outcome = self
            .storage
            .confirm_payout(payout_id, tx_hash, Utc::now())
            .await?;
        if outcome.already_confirmed {
            return Ok(outcome);
        }
        notify::dispatch_best_effort(
            self.notifier.as_ref(),
            Notification::new(
                NotificationKind::PayoutConfirmed,
                format!("payout of {} confirmed on-chain", outcome.payout.amount),
            )
            .recipient(outcome.payout.contributor_id)
            .submission(outcome.payout.submission_id)
            .payout(&outcome.payout.id),
        )
        .await;

        if let (Some(submission), Some(bounty)) = (&outcome.submission, &outcome.bounty) {
            info!(
                bounty_id = bounty.id,
                submission_id = submission.id,
                "bounty completed"
            );
            notify::dispatch_best_effort(
                self.notifier.as_ref(),
                Notification::new(
                    NotificationKind::BountyCompleted,
                    "bounty paid out in full".to_string(),
                )
                .recipient(submission.contributor_id)
                .bounty(bounty.id)
                .submission(submission.id),
            )
            .await;
            if let Ok(Some(repo)) = self.storage.repo_by_github_id(bounty.github_repo_id).await {
                self.comment_best_effort(
                    &repo,
                    bounty.issue_number as u64,
                    format!(
                        "Bounty completed: PR #{} was merged and paid out.",
                        submission.pr_number
                    ),
                )
                .await;
            }
        }
        Ok(outcome)
    }

    pub async fn payouts_for_submission(&self, submission_id: i64) -> Result<Vec<Payout>> {
        self.storage.payouts_for_submission(submission_id).await
    }

    /// Plan one payout per active commitment and run the automated
    /// signing attempts.
    async fn start_payouts(&self, submission: &Submission) -> Result<()> {
        let commitments = self
            .storage
            .commitments_for_bounty(submission.bounty_id)
            .await?;
        let planned = plan_payouts(submission, &commitments);
        if planned.is_empty() {
            warn!(
                submission_id = submission.id,
                "payout-ready submission has no active commitments"
            );
            return Ok(());
        }
        self.storage.insert_payouts(planned).await?;
        self.payouts.execute(submission.id).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Webhook dispatch
    // ------------------------------------------------------------------

    /// Apply a verified webhook event. Returns a short summary for the
    /// delivery log.
    pub async fn dispatch(
        &self,
        event: WebhookEvent,
        repo: Option<&RepoSettings>,
    ) -> Result<String> {
        match event {
            WebhookEvent::Ping(_) => Ok("pong".into()),
            WebhookEvent::PullRequest(ev) => {
                let Some(repo) = repo else {
                    return Ok("repository not registered; ignored".into());
                };
                self.dispatch_pull_request(ev, repo).await
            }
            WebhookEvent::Issues(ev) => {
                let Some(repo) = repo else {
                    return Ok("repository not registered; ignored".into());
                };
                self.dispatch_issues(ev, repo).await
            }
            WebhookEvent::Installation(ev) => self.dispatch_installation(ev).await,
            WebhookEvent::InstallationRepositories(ev) => {
                self.dispatch_installation_repositories(ev).await
            }
        }
    }

    async fn dispatch_pull_request(
        &self,
        ev: PullRequestEvent,
        repo: &RepoSettings,
    ) -> Result<String> {
        match ev.action {
            PullRequestAction::Opened
            | PullRequestAction::Edited
            | PullRequestAction::Reopened
            | PullRequestAction::Synchronize => self.intake_submissions(&ev, repo).await,
            PullRequestAction::Closed => {
                if ev.pull_request.is_merged() {
                    self.handle_pr_merged(&ev, repo).await
                } else {
                    self.handle_pr_closed_unmerged(&ev).await
                }
            }
            PullRequestAction::Other => Ok("pull_request action ignored".into()),
        }
    }

    /// Link the PR to every open bounty its description references.
    async fn intake_submissions(
        &self,
        ev: &PullRequestEvent,
        repo: &RepoSettings,
    ) -> Result<String> {
        let pr = &ev.pull_request;
        let Some(contributor) = self.storage.user_by_github_login(&pr.user.login).await? else {
            info!(
                login = %pr.user.login,
                pr = pr.number,
                "PR author is not a registered user; ignoring"
            );
            return Ok("contributor not registered; ignored".into());
        };

        let references = pr.referenced_issues(&repo.full_name());
        if references.is_empty() {
            return Ok("no issue references in the PR description".into());
        }

        let mut linked = 0usize;
        for issue_number in references {
            let Some(bounty) = self
                .storage
                .bounty_by_issue(repo.github_repo_id, issue_number as i64)
                .await?
            else {
                continue;
            };
            if bounty.status != BountyStatus::Open {
                continue;
            }
            let (submission, created) = self
                .storage
                .upsert_submission(NewSubmission {
                    bounty_id: bounty.id,
                    contributor_id: contributor.id,
                    github_pr_id: pr.id as i64,
                    pr_number: pr.number as i64,
                    pr_title: pr.title.clone(),
                    pr_url: pr.html_url.clone(),
                })
                .await?;
            linked += 1;
            if created {
                info!(
                    submission_id = submission.id,
                    bounty_id = bounty.id,
                    pr = pr.number,
                    "submission created"
                );
                if let Some(funder_id) = bounty.primary_funder_id {
                    notify::dispatch_best_effort(
                        self.notifier.as_ref(),
                        Notification::new(
                            NotificationKind::SubmissionReceived,
                            format!("PR #{} targets your bounty", pr.number),
                        )
                        .recipient(funder_id)
                        .bounty(bounty.id)
                        .submission(submission.id),
                    )
                    .await;
                }
                self.comment_best_effort(
                    repo,
                    pr.number,
                    format!(
                        "This pull request is now competing for the bounty on issue #{}.",
                        bounty.issue_number
                    ),
                )
                .await;
            }
        }
        Ok(format!("linked {linked} submission(s)"))
    }

    async fn handle_pr_merged(
        &self,
        ev: &PullRequestEvent,
        repo: &RepoSettings,
    ) -> Result<String> {
        let pr = &ev.pull_request;
        let merged_at = pr.merged_at.unwrap_or_else(Utc::now);
        let merged = self.storage.record_merge(pr.id as i64, merged_at).await?;
        for submission in &merged {
            if submissions::payout_ready(submission, repo.require_owner_approval) {
                self.start_payouts(submission).await?;
            }
        }
        Ok(format!("recorded merge on {} submission(s)", merged.len()))
    }

    async fn handle_pr_closed_unmerged(&self, ev: &PullRequestEvent) -> Result<String> {
        let pr = &ev.pull_request;
        let closed_at = pr.closed_at.unwrap_or_else(Utc::now);
        let closed = self
            .storage
            .record_close_unmerged(pr.id as i64, closed_at)
            .await?;
        for entry in &closed {
            notify::dispatch_best_effort(
                self.notifier.as_ref(),
                Notification::new(
                    NotificationKind::SubmissionRejected,
                    format!("PR #{} was closed without being merged", pr.number),
                )
                .recipient(entry.submission.contributor_id)
                .bounty(entry.submission.bounty_id)
                .submission(entry.submission.id),
            )
            .await;
        }
        Ok(format!("closed {} submission(s) unmerged", closed.len()))
    }

    /// Closing the funded issue cancels its bounty. Reopening the issue
    /// does not resurrect it.
    async fn dispatch_issues(&self, ev: IssuesEvent, repo: &RepoSettings) -> Result<String> {
        if ev.action != IssuesAction::Closed {
            return Ok("issues action ignored".into());
        }
        let Some(bounty) = self
            .storage
            .bounty_by_issue(repo.github_repo_id, ev.issue.number as i64)
            .await?
        else {
            return Ok("no bounty on the closed issue".into());
        };
        if bounty.status != BountyStatus::Open {
            return Ok("bounty already terminal".into());
        }
        let outcome = self
            .storage
            .cancel_bounty(bounty.id, CancelReason::IssueClosed.note())
            .await?;
        self.announce_cancellation(&outcome.bounty, &outcome.expired_submission_ids)
            .await;
        Ok(format!(
            "cancelled bounty {} after issue close",
            outcome.bounty.id
        ))
    }

    async fn dispatch_installation(&self, ev: InstallationEvent) -> Result<String> {
        let installation_id = ev.installation.id as i64;
        let mut touched = 0usize;
        match ev.action {
            InstallationAction::Created => {
                for repo in &ev.repositories {
                    if self
                        .storage
                        .set_installation(repo.id as i64, Some(installation_id))
                        .await?
                    {
                        touched += 1;
                    }
                }
                Ok(format!("installation recorded on {touched} repo(s)"))
            }
            InstallationAction::Deleted => {
                for repo in &ev.repositories {
                    if self.storage.set_installation(repo.id as i64, None).await? {
                        touched += 1;
                    }
                }
                self.github.invalidate_installation(installation_id);
                Ok(format!("installation cleared on {touched} repo(s)"))
            }
            InstallationAction::Other => Ok("installation action ignored".into()),
        }
    }

    async fn dispatch_installation_repositories(
        &self,
        ev: InstallationRepositoriesEvent,
    ) -> Result<String> {
        let installation_id = ev.installation.id as i64;
        let mut added = 0usize;
        let mut removed = 0usize;
        for repo in &ev.repositories_added {
            if self
                .storage
                .set_installation(repo.id as i64, Some(installation_id))
                .await?
            {
                added += 1;
            }
        }
        for repo in &ev.repositories_removed {
            if self.storage.set_installation(repo.id as i64, None).await? {
                removed += 1;
            }
        }
        Ok(format!(
            "installation repositories updated (+{added}/-{removed})"
        ))
    }

    // ------------------------------------------------------------------
    // Side effects
    // ------------------------------------------------------------------

    async fn announce_cancellation(&self, bounty: &Bounty, expired_submission_ids: &[i64]) {
        for id in expired_submission_ids {
            match self.storage.submission_by_id(*id).await {
                Ok(Some(submission)) => {
                    notify::dispatch_best_effort(
                        self.notifier.as_ref(),
                        Notification::new(
                            NotificationKind::BountyCancelled,
                            "the bounty your submission targeted was cancelled".to_string(),
                        )
                        .recipient(submission.contributor_id)
                        .bounty(bounty.id)
                        .submission(submission.id),
                    )
                    .await;
                }
                Ok(None) => {}
                Err(e) => warn!("failed to load expired submission {id}: {e}"),
            }
        }
        if let Ok(Some(repo)) = self.storage.repo_by_github_id(bounty.github_repo_id).await {
            self.comment_best_effort(
                &repo,
                bounty.issue_number as u64,
                "The bounty on this issue has been cancelled.".to_string(),
            )
            .await;
        }
    }

    async fn comment_best_effort(&self, repo: &RepoSettings, number: u64, body: String) {
        if let Err(e) = self
            .github
            .post_issue_comment(&repo.full_name(), number, &body, repo.installation_id)
            .await
        {
            warn!(
                "failed to comment on {}#{}: {}",
                repo.full_name(),
                number,
                e
            );
        }
    }

    async fn label_best_effort(&self, repo: &RepoSettings, number: u64, labels: &[&str]) {
        if let Err(e) = self
            .github
            .add_labels(&repo.full_name(), number, labels, repo.installation_id)
            .await
        {
            warn!("failed to label {}#{}: {}", repo.full_name(), number, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GitHubConfig;
    use crate::events::EventKind;
    use crate::models::{PayoutStatus, SubmissionStatus};
    use crate::notify::NoopNotifier;
    use crate::sqlite_storage::SqliteStorage;

    fn github_client() -> Arc<GitHubClient> {
        // No token configured: every API write is skipped, so tests
        // never touch the network.
        Arc::new(
            GitHubClient::new(&GitHubConfig {
                api_base: "https://api.github.com".into(),
                app_webhook_secret: String::new(),
                token: String::new(),
                request_timeout_secs: 10,
                installation_token_ttl_secs: 3300,
            })
            .unwrap(),
        )
    }

    fn engine() -> Engine {
        let storage = Arc::new(SqliteStorage::in_memory().unwrap());
        Engine::new(
            storage,
            github_client(),
            Arc::new(NoopNotifier),
            None,
            Some("app-secret".into()),
        )
    }

    async fn setup_repo_and_funder(engine: &Engine) -> (User, RepoSettings) {
        let funder = engine
            .register_user("alice", Some("0xalice".into()))
            .await
            .unwrap();
        let repo = engine
            .register_repo(&funder, 42, "acme", "widgets", false)
            .await
            .unwrap();
        (funder, repo)
    }

    fn pr_event(action: &str, pr_id: u64, number: u64, body: &str, merged: bool) -> WebhookEvent {
        let merged_at = if merged {
            r#""2024-05-01T12:00:00Z""#
        } else {
            "null"
        };
        let payload = format!(
            r#"{{
                "action": "{action}",
                "pull_request": {{
                    "id": {pr_id}, "number": {number},
                    "title": "Fix the leak",
                    "body": "{body}",
                    "html_url": "https://github.com/acme/widgets/pull/{number}",
                    "user": {{ "id": 5555, "login": "bob" }},
                    "merged": {merged}, "merged_at": {merged_at},
                    "closed_at": {merged_at}
                }},
                "repository": {{ "id": 42, "full_name": "acme/widgets" }}
            }}"#
        );
        WebhookEvent::parse(EventKind::PullRequest, payload.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_full_lifecycle_to_paid_bounty() {
        let engine = engine();
        let (funder, repo) = setup_repo_and_funder(&engine).await;
        let contributor = engine
            .register_user("bob", Some("0xbob".into()))
            .await
            .unwrap();

        let update = engine
            .fund_bounty(&funder, 42, 101, 1500, "0xusdc")
            .await
            .unwrap();
        assert!(update.bounty_created);
        let bounty = update.bounty;

        // PR opened referencing the funded issue.
        let summary = engine
            .dispatch(
                pr_event("opened", 900_145, 145, "Fixes #101", false),
                Some(&repo),
            )
            .await
            .unwrap();
        assert_eq!(summary, "linked 1 submission(s)");
        let subs = engine
            .storage()
            .submissions_for_bounty(bounty.id)
            .await
            .unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].contributor_id, contributor.id);

        // Funder approves, then the PR merges.
        engine
            .approve_submission(&funder, subs[0].id, ApprovalRole::Funder)
            .await
            .unwrap();
        engine
            .dispatch(
                pr_event("closed", 900_145, 145, "Fixes #101", true),
                Some(&repo),
            )
            .await
            .unwrap();

        // Merge on an approved submission starts the payout plan; with
        // no signer it stays on the manual path.
        let sub = engine
            .storage()
            .submission_by_id(subs[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.status, SubmissionStatus::Merged);
        let payouts = engine.payouts_for_submission(sub.id).await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].status, PayoutStatus::AwaitingSignature);
        assert_eq!(payouts[0].amount, 1500);

        // The watcher confirms the payout; everything settles.
        let outcome = engine
            .confirm_payout(&payouts[0].id, Some("0xhash"))
            .await
            .unwrap();
        assert!(outcome.all_confirmed);
        assert_eq!(
            outcome.submission.unwrap().status,
            SubmissionStatus::Paid
        );
        assert_eq!(outcome.bounty.unwrap().status, BountyStatus::Completed);
    }

    #[tokio::test]
    async fn test_merge_before_approval_defers_payouts() {
        let engine = engine();
        let (funder, repo) = setup_repo_and_funder(&engine).await;
        engine.register_user("bob", None).await.unwrap();
        engine
            .fund_bounty(&funder, 42, 101, 800, "0xusdc")
            .await
            .unwrap();

        engine
            .dispatch(
                pr_event("opened", 900_145, 145, "Fixes #101", false),
                Some(&repo),
            )
            .await
            .unwrap();
        engine
            .dispatch(
                pr_event("closed", 900_145, 145, "Fixes #101", true),
                Some(&repo),
            )
            .await
            .unwrap();

        let subs = engine.storage().submissions_by_pr(900_145).await.unwrap();
        assert_eq!(subs[0].status, SubmissionStatus::Merged);
        assert!(engine
            .payouts_for_submission(subs[0].id)
            .await
            .unwrap()
            .is_empty());

        // Approval after the merge triggers the payout plan.
        engine
            .approve_submission(&funder, subs[0].id, ApprovalRole::Funder)
            .await
            .unwrap();
        assert_eq!(
            engine.payouts_for_submission(subs[0].id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unregistered_contributor_is_ignored() {
        let engine = engine();
        let (funder, repo) = setup_repo_and_funder(&engine).await;
        engine
            .fund_bounty(&funder, 42, 101, 500, "0xusdc")
            .await
            .unwrap();
        let summary = engine
            .dispatch(
                pr_event("opened", 900_145, 145, "Fixes #101", false),
                Some(&repo),
            )
            .await
            .unwrap();
        assert_eq!(summary, "contributor not registered; ignored");
    }

    #[tokio::test]
    async fn test_owner_approval_gate() {
        let engine = engine();
        let funder = engine.register_user("alice", None).await.unwrap();
        let repo = engine
            .register_repo(&funder, 42, "acme", "widgets", true)
            .await
            .unwrap();
        engine.register_user("bob", Some("0xbob".into())).await.unwrap();
        engine
            .fund_bounty(&funder, 42, 101, 1000, "0xusdc")
            .await
            .unwrap();
        engine
            .dispatch(
                pr_event("opened", 900_145, 145, "Fixes #101", false),
                Some(&repo),
            )
            .await
            .unwrap();
        engine
            .dispatch(
                pr_event("closed", 900_145, 145, "Fixes #101", true),
                Some(&repo),
            )
            .await
            .unwrap();
        let subs = engine.storage().submissions_by_pr(900_145).await.unwrap();

        engine
            .approve_submission(&funder, subs[0].id, ApprovalRole::Funder)
            .await
            .unwrap();
        // Funder approval alone is not enough with owner approval on.
        assert!(engine
            .payouts_for_submission(subs[0].id)
            .await
            .unwrap()
            .is_empty());

        // alice is also the repo admin here.
        engine
            .approve_submission(&funder, subs[0].id, ApprovalRole::Owner)
            .await
            .unwrap();
        assert_eq!(
            engine.payouts_for_submission(subs[0].id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_approval_requires_the_right_actor() {
        let engine = engine();
        let (funder, repo) = setup_repo_and_funder(&engine).await;
        let other = engine.register_user("mallory", None).await.unwrap();
        engine.register_user("bob", None).await.unwrap();
        engine
            .fund_bounty(&funder, 42, 101, 500, "0xusdc")
            .await
            .unwrap();
        engine
            .dispatch(
                pr_event("opened", 900_145, 145, "Fixes #101", false),
                Some(&repo),
            )
            .await
            .unwrap();
        let subs = engine.storage().submissions_by_pr(900_145).await.unwrap();

        let err = engine
            .approve_submission(&other, subs[0].id, ApprovalRole::Funder)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
        let err = engine
            .approve_submission(&other, subs[0].id, ApprovalRole::Owner)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
        let err = engine
            .reject_submission(&other, subs[0].id, "not mine to judge")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_issue_close_cancels_bounty_and_expires_submissions() {
        let engine = engine();
        let (funder, repo) = setup_repo_and_funder(&engine).await;
        engine.register_user("bob", None).await.unwrap();
        engine
            .fund_bounty(&funder, 42, 101, 500, "0xusdc")
            .await
            .unwrap();
        engine
            .dispatch(
                pr_event("opened", 900_145, 145, "Fixes #101", false),
                Some(&repo),
            )
            .await
            .unwrap();

        let payload = r#"{
            "action": "closed",
            "issue": { "id": 700101, "number": 101, "title": "Leak", "closed_at": "2024-05-02T08:00:00Z" },
            "repository": { "id": 42, "full_name": "acme/widgets" }
        }"#;
        let event = WebhookEvent::parse(EventKind::Issues, payload.as_bytes()).unwrap();
        engine.dispatch(event, Some(&repo)).await.unwrap();

        let bounty = engine
            .storage()
            .bounty_by_issue(42, 101)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bounty.status, BountyStatus::Cancelled);
        let subs = engine.storage().submissions_by_pr(900_145).await.unwrap();
        assert_eq!(subs[0].status, SubmissionStatus::Expired);

        // Reopening the issue does not resurrect the bounty: funding it
        // again is also rejected while the old bounty row is terminal.
        let err = engine
            .fund_bounty(&funder, 42, 101, 100, "0xusdc")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TerminalBounty { .. }));
    }

    #[tokio::test]
    async fn test_cancel_requires_primary_funder() {
        let engine = engine();
        let (funder, _) = setup_repo_and_funder(&engine).await;
        let other = engine.register_user("mallory", None).await.unwrap();
        let update = engine
            .fund_bounty(&funder, 42, 101, 500, "0xusdc")
            .await
            .unwrap();

        let err = engine
            .cancel_bounty(&other, update.bounty.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        let outcome = engine.cancel_bounty(&funder, update.bounty.id).await.unwrap();
        assert_eq!(outcome.bounty.status, BountyStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_installation_events_update_repo_settings() {
        let engine = engine();
        let (_, repo) = setup_repo_and_funder(&engine).await;
        assert!(repo.installation_id.is_none());

        let created = r#"{
            "action": "created",
            "installation": { "id": 77 },
            "repositories": [
                { "id": 42, "full_name": "acme/widgets" },
                { "id": 99, "full_name": "acme/unregistered" }
            ]
        }"#;
        let event = WebhookEvent::parse(EventKind::Installation, created.as_bytes()).unwrap();
        let summary = engine.dispatch(event, None).await.unwrap();
        assert_eq!(summary, "installation recorded on 1 repo(s)");
        let repo = engine
            .storage()
            .repo_by_github_id(42)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(repo.installation_id, Some(77));

        let removed = r#"{
            "installation": { "id": 77 },
            "repositories_added": [],
            "repositories_removed": [{ "id": 42, "full_name": "acme/widgets" }]
        }"#;
        let event =
            WebhookEvent::parse(EventKind::InstallationRepositories, removed.as_bytes()).unwrap();
        engine.dispatch(event, None).await.unwrap();
        let repo = engine
            .storage()
            .repo_by_github_id(42)
            .await
            .unwrap()
            .unwrap();
        assert!(repo.installation_id.is_none());
    }

    #[tokio::test]
    async fn test_fund_bounty_validation() {
        let engine = engine();
        let (funder, _) = setup_repo_and_funder(&engine).await;
        assert!(matches!(
            engine.fund_bounty(&funder, 42, 101, 0, "0xusdc").await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.fund_bounty(&funder, 42, 101, 100, "  ").await,
            Err(EngineError::InvalidInput(_))
        ));
        // Unregistered repository.
        assert!(matches!(
            engine.fund_bounty(&funder, 777, 101, 100, "0xusdc").await,
            Err(EngineError::NotFound("repository"))
        ));
    }

    #[tokio::test]
    async fn test_access_key_management() {
        let engine = engine();
        let (funder, _) = setup_repo_and_funder(&engine).await;
        let key = engine
            .register_access_key(
                &funder,
                "key_abc",
                None,
                vec![SpendLimit {
                    token_address: "0xusdc".into(),
                    initial: 2000,
                    remaining: 0,
                }],
            )
            .await
            .unwrap();
        // remaining is normalized to initial on registration.
        assert_eq!(key.limits[0].remaining, 2000);

        assert_eq!(engine.list_access_keys(&funder).await.unwrap().len(), 1);
        engine.revoke_access_key(&funder, "key_abc").await.unwrap();
        let err = engine.revoke_access_key(&funder, "key_abc").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        assert!(matches!(
            engine.register_access_key(&funder, "", None, vec![]).await,
            Err(EngineError::InvalidInput(_))
        ));
    }
}
