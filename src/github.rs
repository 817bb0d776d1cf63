//! GitHub REST client.
//!
//! All calls go out with an installation token when the repository has
//! one recorded; tokens are minted on demand and cached per
//! installation for a little under GitHub's one-hour validity. Repos
//! without an installation fall back to the configured app token.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::GitHubConfig;
use crate::events::{GhIssue, GhPullRequest};

const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "bounty-board/0.1.0";

struct CachedToken {
    token: String,
    fetched_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_base: String,
    app_token: Option<String>,
    token_ttl: Duration,
    installation_tokens: RwLock<HashMap<i64, CachedToken>>,
}

impl GitHubClient {
    pub fn new(cfg: &GitHubConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        let app_token = cfg.resolved_token();
        if app_token.is_none() {
            warn!("GitHub client has no app token; API writes will be skipped");
        }
        Ok(Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            app_token,
            token_ttl: Duration::from_secs(cfg.installation_token_ttl_secs),
            installation_tokens: RwLock::new(HashMap::new()),
        })
    }

    fn build_request(
        &self,
        method: reqwest::Method,
        url: &str,
        token: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req
    }

    /// Token to use for a repository: a cached or freshly minted
    /// installation token, else the app token. Minting failures degrade
    /// to the app token rather than failing the caller.
    async fn token_for(&self, installation_id: Option<i64>) -> Option<String> {
        let Some(id) = installation_id else {
            return self.app_token.clone();
        };
        {
            let cache = self.installation_tokens.read();
            if let Some(cached) = cache.get(&id) {
                if cached.is_fresh(self.token_ttl) {
                    return Some(cached.token.clone());
                }
            }
        }
        match self.mint_installation_token(id).await {
            Ok(token) => {
                self.installation_tokens.write().insert(
                    id,
                    CachedToken {
                        token: token.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Some(token)
            }
            Err(e) => {
                warn!("failed to mint token for installation {}: {}", id, e);
                self.app_token.clone()
            }
        }
    }

    async fn mint_installation_token(&self, installation_id: i64) -> Result<String> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );
        let response = self
            .build_request(reqwest::Method::POST, &url, self.app_token.as_deref())
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "installation token request failed: {}",
                response.status()
            );
        }
        let data: TokenResponse = response.json().await?;
        Ok(data.token)
    }

    /// Drop the cached token when an installation is removed.
    pub fn invalidate_installation(&self, installation_id: i64) {
        self.installation_tokens.write().remove(&installation_id);
    }

    pub async fn get_issue(
        &self,
        full_name: &str,
        number: u64,
        installation_id: Option<i64>,
    ) -> Result<GhIssue> {
        let url = format!("{}/repos/{}/issues/{}", self.api_base, full_name, number);
        let token = self.token_for(installation_id).await;
        let response = self
            .build_request(reqwest::Method::GET, &url, token.as_deref())
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "failed to fetch issue {}#{}: {}",
                full_name,
                number,
                response.status()
            );
        }
        Ok(response.json().await?)
    }

    pub async fn get_pull_request(
        &self,
        full_name: &str,
        number: u64,
        installation_id: Option<i64>,
    ) -> Result<GhPullRequest> {
        let url = format!("{}/repos/{}/pulls/{}", self.api_base, full_name, number);
        let token = self.token_for(installation_id).await;
        let response = self
            .build_request(reqwest::Method::GET, &url, token.as_deref())
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "failed to fetch PR {}#{}: {}",
                full_name,
                number,
                response.status()
            );
        }
        Ok(response.json().await?)
    }

    /// Comment on an issue or PR. Callers treat this as best-effort.
    pub async fn post_issue_comment(
        &self,
        full_name: &str,
        number: u64,
        body: &str,
        installation_id: Option<i64>,
    ) -> Result<()> {
        let Some(token) = self.token_for(installation_id).await else {
            debug!("no GitHub token; skipping comment on {}#{}", full_name, number);
            return Ok(());
        };
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_base, full_name, number
        );
        let response = self
            .build_request(reqwest::Method::POST, &url, Some(&token))
            .json(&json!({ "body": body }))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "failed to comment on {}#{}: {}",
                full_name,
                number,
                response.status()
            );
        }
        Ok(())
    }

    /// Add labels to an issue. Callers treat this as best-effort.
    pub async fn add_labels(
        &self,
        full_name: &str,
        number: u64,
        labels: &[&str],
        installation_id: Option<i64>,
    ) -> Result<()> {
        let Some(token) = self.token_for(installation_id).await else {
            debug!("no GitHub token; skipping labels on {}#{}", full_name, number);
            return Ok(());
        };
        let url = format!(
            "{}/repos/{}/issues/{}/labels",
            self.api_base, full_name, number
        );
        let response = self
            .build_request(reqwest::Method::POST, &url, Some(&token))
            .json(&json!({ "labels": labels }))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "failed to label {}#{}: {}",
                full_name,
                number,
                response.status()
            );
        }
        Ok(())
    }
}
