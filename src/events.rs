//! Typed GitHub webhook payloads.
//!
//! Deliveries are classified by the `x-github-event` header into
//! [`EventKind`], then parsed into a closed [`WebhookEvent`]. Unknown
//! event kinds never reach parsing; unknown actions of known kinds
//! deserialize into an explicit `Other` variant so the engine ignores
//! them visibly instead of failing the delivery.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

// ============================================================================
// EVENT CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PullRequest,
    Issues,
    Installation,
    InstallationRepositories,
    Ping,
}

impl EventKind {
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "pull_request" => Some(EventKind::PullRequest),
            "issues" => Some(EventKind::Issues),
            "installation" => Some(EventKind::Installation),
            "installation_repositories" => Some(EventKind::InstallationRepositories),
            "ping" => Some(EventKind::Ping),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PullRequest => "pull_request",
            EventKind::Issues => "issues",
            EventKind::Installation => "installation",
            EventKind::InstallationRepositories => "installation_repositories",
            EventKind::Ping => "ping",
        }
    }

    /// App-level deliveries are signed with the GitHub App secret, not a
    /// per-repository secret.
    pub fn is_app_level(&self) -> bool {
        matches!(
            self,
            EventKind::Installation | EventKind::InstallationRepositories
        )
    }
}

// ============================================================================
// SHARED PAYLOAD FRAGMENTS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct GhUser {
    pub id: u64,
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhRepository {
    pub id: u64,
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhRepoRef {
    pub id: u64,
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhInstallation {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhPullRequest {
    pub id: u64,
    pub number: u64,
    pub title: Option<String>,
    pub body: Option<String>,
    pub html_url: Option<String>,
    pub user: GhUser,
    #[serde(default)]
    pub merged: Option<bool>,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl GhPullRequest {
    /// `merged` is only reliable on `closed` deliveries; `merged_at`
    /// backs it up when the flag is absent.
    pub fn is_merged(&self) -> bool {
        self.merged.unwrap_or(false) || self.merged_at.is_some()
    }

    /// Issue numbers referenced from the PR description, in either the
    /// `#123` shorthand or the full issue URL form. Cross-repo
    /// shorthand (`owner/repo#123`) does not count, and URL references
    /// only count when they point at `repo_full_name`. Deduplicated,
    /// sorted.
    pub fn referenced_issues(&self, repo_full_name: &str) -> Vec<u64> {
        let Some(body) = self.body.as_deref() else {
            return Vec::new();
        };
        let mut numbers: Vec<u64> = Vec::new();
        for cap in ISSUE_SHORTHAND.captures_iter(body) {
            if let Ok(n) = cap[1].parse::<u64>() {
                numbers.push(n);
            }
        }
        for cap in ISSUE_URL.captures_iter(body) {
            if cap[1].eq_ignore_ascii_case(repo_full_name) {
                if let Ok(n) = cap[2].parse::<u64>() {
                    numbers.push(n);
                }
            }
        }
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhIssue {
    pub id: u64,
    pub number: u64,
    pub title: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
}

lazy_static! {
    // No look-behind in the regex crate: the leading group rejects the
    // tail of cross-repo references like `owner/repo#9`.
    static ref ISSUE_SHORTHAND: Regex =
        Regex::new(r"(?:^|[^\w/])#(\d+)\b").expect("issue shorthand regex");
    static ref ISSUE_URL: Regex =
        Regex::new(r"github\.com/([\w.-]+/[\w.-]+)/issues/(\d+)").expect("issue url regex");
}

// ============================================================================
// EVENT PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    Opened,
    Edited,
    Reopened,
    Synchronize,
    Closed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: PullRequestAction,
    pub pull_request: GhPullRequest,
    pub repository: GhRepository,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuesAction {
    Opened,
    Closed,
    Reopened,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuesEvent {
    pub action: IssuesAction,
    pub issue: GhIssue,
    pub repository: GhRepository,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationAction {
    Created,
    Deleted,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationEvent {
    pub action: InstallationAction,
    pub installation: GhInstallation,
    #[serde(default)]
    pub repositories: Vec<GhRepoRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationRepositoriesEvent {
    pub installation: GhInstallation,
    #[serde(default)]
    pub repositories_added: Vec<GhRepoRef>,
    #[serde(default)]
    pub repositories_removed: Vec<GhRepoRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingEvent {
    pub zen: Option<String>,
    pub hook_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum WebhookEvent {
    PullRequest(PullRequestEvent),
    Issues(IssuesEvent),
    Installation(InstallationEvent),
    InstallationRepositories(InstallationRepositoriesEvent),
    Ping(PingEvent),
}

impl WebhookEvent {
    pub fn parse(kind: EventKind, body: &[u8]) -> serde_json::Result<Self> {
        Ok(match kind {
            EventKind::PullRequest => WebhookEvent::PullRequest(serde_json::from_slice(body)?),
            EventKind::Issues => WebhookEvent::Issues(serde_json::from_slice(body)?),
            EventKind::Installation => WebhookEvent::Installation(serde_json::from_slice(body)?),
            EventKind::InstallationRepositories => {
                WebhookEvent::InstallationRepositories(serde_json::from_slice(body)?)
            }
            EventKind::Ping => WebhookEvent::Ping(serde_json::from_slice(body)?),
        })
    }
}

/// Minimal probe run before signature verification to pick the
/// per-repository secret. Malformed JSON is an error; a well-formed
/// payload without `repository.id` yields `None`.
pub fn probe_repo_id(body: &[u8]) -> serde_json::Result<Option<u64>> {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(default)]
        repository: Option<ProbeRepo>,
    }
    #[derive(Deserialize)]
    struct ProbeRepo {
        #[serde(default)]
        id: Option<u64>,
    }
    let probe: Probe = serde_json::from_slice(body)?;
    Ok(probe.repository.and_then(|r| r.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PR_OPENED: &str = r##"{
        "action": "opened",
        "pull_request": {
            "id": 900145,
            "number": 145,
            "title": "Fix memory leak in parser",
            "body": "Fixes #101 and addresses https://github.com/acme/widgets/issues/102.\nSee also acme/other#9.",
            "html_url": "https://github.com/acme/widgets/pull/145",
            "user": { "id": 5555, "login": "octocat" },
            "merged": false,
            "merged_at": null,
            "closed_at": null
        },
        "repository": { "id": 42, "full_name": "acme/widgets" }
    }"##;

    #[test]
    fn test_classifies_known_headers() {
        assert_eq!(EventKind::from_header("pull_request"), Some(EventKind::PullRequest));
        assert_eq!(EventKind::from_header("issues"), Some(EventKind::Issues));
        assert_eq!(EventKind::from_header("ping"), Some(EventKind::Ping));
        assert_eq!(EventKind::from_header("workflow_run"), None);
        assert!(EventKind::Installation.is_app_level());
        assert!(EventKind::InstallationRepositories.is_app_level());
        assert!(!EventKind::PullRequest.is_app_level());
    }

    #[test]
    fn test_parses_pull_request_opened() {
        let ev = WebhookEvent::parse(EventKind::PullRequest, PR_OPENED.as_bytes()).unwrap();
        let WebhookEvent::PullRequest(ev) = ev else {
            panic!("wrong variant");
        };
        assert_eq!(ev.action, PullRequestAction::Opened);
        assert_eq!(ev.pull_request.number, 145);
        assert_eq!(ev.repository.id, 42);
        assert!(!ev.pull_request.is_merged());
    }

    #[test]
    fn test_extracts_issue_references() {
        let ev = WebhookEvent::parse(EventKind::PullRequest, PR_OPENED.as_bytes()).unwrap();
        let WebhookEvent::PullRequest(ev) = ev else {
            panic!("wrong variant");
        };
        // #101 shorthand plus the same-repo issue URL. The cross-repo
        // shorthand "acme/other#9" names another repository's issue and
        // must not link here.
        let refs = ev.pull_request.referenced_issues("acme/widgets");
        assert_eq!(refs, vec![101, 102]);

        // Different repo: the URL reference drops out too.
        let refs = ev.pull_request.referenced_issues("acme/gadgets");
        assert_eq!(refs, vec![101]);
    }

    #[test]
    fn test_cross_repo_shorthand_is_not_a_reference() {
        let pr = GhPullRequest {
            id: 1,
            number: 1,
            title: None,
            body: Some("#5 fixed; ports acme/other#9, see also (#12) and x#13".into()),
            html_url: None,
            user: GhUser { id: 1, login: "x".into() },
            merged: None,
            merged_at: None,
            closed_at: None,
        };
        // Leading shorthand and parenthesized shorthand count; anything
        // glued to a word character or a slash does not.
        assert_eq!(pr.referenced_issues("acme/widgets"), vec![5, 12]);
    }

    #[test]
    fn test_reference_extraction_dedupes() {
        let pr = GhPullRequest {
            id: 1,
            number: 1,
            title: None,
            body: Some("Fixes #7, closes #7, see github.com/a/b/issues/7".into()),
            html_url: None,
            user: GhUser { id: 1, login: "x".into() },
            merged: None,
            merged_at: None,
            closed_at: None,
        };
        assert_eq!(pr.referenced_issues("a/b"), vec![7]);
        let empty = GhPullRequest { body: None, ..pr };
        assert!(empty.referenced_issues("a/b").is_empty());
    }

    #[test]
    fn test_unknown_action_parses_as_other() {
        let body = r#"{
            "action": "ready_for_review",
            "pull_request": {
                "id": 1, "number": 2, "title": null, "body": null,
                "html_url": null,
                "user": { "id": 3, "login": "octocat" },
                "merged": null, "merged_at": null, "closed_at": null
            },
            "repository": { "id": 42, "full_name": "acme/widgets" }
        }"#;
        let ev = WebhookEvent::parse(EventKind::PullRequest, body.as_bytes()).unwrap();
        let WebhookEvent::PullRequest(ev) = ev else {
            panic!("wrong variant");
        };
        assert_eq!(ev.action, PullRequestAction::Other);
    }

    #[test]
    fn test_merged_flag_falls_back_to_timestamp() {
        let body = r#"{
            "action": "closed",
            "pull_request": {
                "id": 1, "number": 2, "title": "t", "body": null,
                "html_url": null,
                "user": { "id": 3, "login": "octocat" },
                "merged_at": "2024-05-01T12:00:00Z",
                "closed_at": "2024-05-01T12:00:00Z"
            },
            "repository": { "id": 42, "full_name": "acme/widgets" }
        }"#;
        let ev = WebhookEvent::parse(EventKind::PullRequest, body.as_bytes()).unwrap();
        let WebhookEvent::PullRequest(ev) = ev else {
            panic!("wrong variant");
        };
        assert!(ev.pull_request.is_merged());
    }

    #[test]
    fn test_issues_closed_payload() {
        let body = r#"{
            "action": "closed",
            "issue": { "id": 700101, "number": 101, "title": "Leak", "closed_at": "2024-05-02T08:00:00Z" },
            "repository": { "id": 42, "full_name": "acme/widgets" }
        }"#;
        let ev = WebhookEvent::parse(EventKind::Issues, body.as_bytes()).unwrap();
        let WebhookEvent::Issues(ev) = ev else {
            panic!("wrong variant");
        };
        assert_eq!(ev.action, IssuesAction::Closed);
        assert_eq!(ev.issue.number, 101);
    }

    #[test]
    fn test_repo_probe() {
        assert_eq!(probe_repo_id(PR_OPENED.as_bytes()).unwrap(), Some(42));
        assert_eq!(probe_repo_id(br#"{"zen": "Design for failure."}"#).unwrap(), None);
        assert_eq!(probe_repo_id(br#"{"repository": {}}"#).unwrap(), None);
        assert!(probe_repo_id(b"not json {").is_err());
    }
}
