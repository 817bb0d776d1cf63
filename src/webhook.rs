//! Webhook ingress pipeline.
//!
//! Each GitHub delivery runs the same gauntlet: classify the event
//! header, pick the signing secret (the app secret for installation
//! events, the repository's secret otherwise), verify the HMAC against
//! the raw body, parse the typed payload, then hand it to the engine.
//! Unknown events and unregistered repositories are acknowledged with
//! 200 so GitHub does not retry deliveries we will never want.

use thiserror::Error;
use tracing::{debug, info};

use crate::auth;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::events::{self, EventKind, WebhookEvent};
use crate::models::RepoSettings;

/// Headers of one delivery, as received.
#[derive(Debug, Clone, Default)]
pub struct DeliveryHeaders {
    /// `x-github-event`
    pub event: Option<String>,
    /// `x-hub-signature-256`
    pub signature: Option<String>,
    /// `x-github-delivery`
    pub delivery_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    Processed { summary: String },
    /// Acknowledged without processing; GitHub must not retry.
    Ignored { reason: String },
}

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("missing required header {0}")]
    MissingHeader(&'static str),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("payload carries no repository id")]
    MissingRepoId,
    #[error("signature verification failed")]
    SignatureMismatch,
    #[error("no app webhook secret configured for installation events")]
    MissingAppSecret,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IngressError {
    /// HTTP status GitHub should see. Retryable engine failures answer
    /// 500 so the delivery is redelivered; everything else is final.
    pub fn status(&self) -> u16 {
        match self {
            IngressError::MissingHeader(_)
            | IngressError::MalformedPayload(_)
            | IngressError::MissingRepoId => 400,
            IngressError::SignatureMismatch => 401,
            IngressError::MissingAppSecret => 500,
            IngressError::Engine(e) => {
                if e.is_retryable() {
                    500
                } else {
                    400
                }
            }
        }
    }
}

/// Run one delivery through the full pipeline.
pub async fn handle_delivery(
    engine: &Engine,
    headers: &DeliveryHeaders,
    body: &[u8],
) -> Result<IngressOutcome, IngressError> {
    let event_header = headers
        .event
        .as_deref()
        .ok_or(IngressError::MissingHeader("x-github-event"))?;
    let Some(kind) = EventKind::from_header(event_header) else {
        debug!(event = event_header, "unsupported event kind; acknowledging");
        return Ok(IngressOutcome::Ignored {
            reason: format!("event {event_header} is not handled"),
        });
    };
    let signature = headers
        .signature
        .as_deref()
        .ok_or(IngressError::MissingHeader("x-hub-signature-256"))?;

    let (secret, repo) = select_secret(engine, kind, body).await?;
    let (secret, repo) = match (secret, repo) {
        (Some(secret), repo) => (secret, repo),
        (None, _) => {
            return Ok(IngressOutcome::Ignored {
                reason: "repository not registered".into(),
            });
        }
    };

    if !auth::verify_webhook_signature(&secret, body, signature) {
        return Err(IngressError::SignatureMismatch);
    }

    let event = WebhookEvent::parse(kind, body)
        .map_err(|e| IngressError::MalformedPayload(e.to_string()))?;
    let summary = engine.dispatch(event, repo.as_ref()).await?;
    info!(
        event = kind.as_str(),
        delivery = headers.delivery_id.as_deref().unwrap_or("-"),
        summary = %summary,
        "webhook delivery processed"
    );
    Ok(IngressOutcome::Processed { summary })
}

/// Secret selection. `Ok((None, _))` means the delivery is unverifiable
/// because the repository is unknown to us; the caller acknowledges it.
async fn select_secret(
    engine: &Engine,
    kind: EventKind,
    body: &[u8],
) -> Result<(Option<String>, Option<RepoSettings>), IngressError> {
    if kind.is_app_level() {
        let secret = engine
            .app_webhook_secret()
            .ok_or(IngressError::MissingAppSecret)?;
        return Ok((Some(secret.to_string()), None));
    }
    let repo_id = events::probe_repo_id(body)
        .map_err(|e| IngressError::MalformedPayload(e.to_string()))?
        .ok_or(IngressError::MissingRepoId)?;
    let repo = engine
        .storage()
        .repo_by_github_id(repo_id as i64)
        .await
        .map_err(IngressError::Engine)?;
    match repo {
        Some(repo) => Ok((Some(repo.webhook_secret.clone()), Some(repo))),
        None => Ok((None, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GitHubConfig;
    use crate::github::GitHubClient;
    use crate::notify::NoopNotifier;
    use crate::sqlite_storage::SqliteStorage;
    use std::sync::Arc;

    const APP_SECRET: &str = "app-secret";

    fn engine() -> Engine {
        let storage = Arc::new(SqliteStorage::in_memory().unwrap());
        let github = Arc::new(
            GitHubClient::new(&GitHubConfig {
                api_base: "https://api.github.com".into(),
                app_webhook_secret: String::new(),
                token: String::new(),
                request_timeout_secs: 10,
                installation_token_ttl_secs: 3300,
            })
            .unwrap(),
        );
        Engine::new(
            storage,
            github,
            Arc::new(NoopNotifier),
            None,
            Some(APP_SECRET.into()),
        )
    }

    async fn registered_repo(engine: &Engine) -> RepoSettings {
        let admin = engine.register_user("alice", None).await.unwrap();
        engine
            .register_repo(&admin, 42, "acme", "widgets", false)
            .await
            .unwrap()
    }

    fn headers(event: &str, signature: Option<String>) -> DeliveryHeaders {
        DeliveryHeaders {
            event: Some(event.to_string()),
            signature,
            delivery_id: Some("d-1".into()),
        }
    }

    const PING: &str = r#"{
        "zen": "Design for failure.",
        "hook_id": 1,
        "repository": { "id": 42, "full_name": "acme/widgets" }
    }"#;

    #[tokio::test]
    async fn test_valid_delivery_is_processed() {
        let engine = engine();
        let repo = registered_repo(&engine).await;
        let sig = auth::sign_payload(&repo.webhook_secret, PING.as_bytes());
        let outcome = handle_delivery(&engine, &headers("ping", Some(sig)), PING.as_bytes())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            IngressOutcome::Processed {
                summary: "pong".into()
            }
        );
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let engine = engine();
        registered_repo(&engine).await;
        let sig = auth::sign_payload("wrong-secret", PING.as_bytes());
        let err = handle_delivery(&engine, &headers("ping", Some(sig)), PING.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, IngressError::SignatureMismatch));
        assert_eq!(err.status(), 401);
    }

    #[tokio::test]
    async fn test_missing_headers_are_400() {
        let engine = engine();
        let err = handle_delivery(&engine, &DeliveryHeaders::default(), PING.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, IngressError::MissingHeader("x-github-event")));
        assert_eq!(err.status(), 400);

        let err = handle_delivery(&engine, &headers("ping", None), PING.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngressError::MissingHeader("x-hub-signature-256")
        ));
    }

    #[tokio::test]
    async fn test_unsupported_event_is_acknowledged_unverified() {
        let engine = engine();
        // No signature needed: classification happens first.
        let outcome = handle_delivery(
            &engine,
            &headers("workflow_run", None),
            b"{}",
        )
        .await
        .unwrap();
        assert!(matches!(outcome, IngressOutcome::Ignored { .. }));
    }

    #[tokio::test]
    async fn test_unregistered_repo_is_acknowledged() {
        let engine = engine();
        let sig = auth::sign_payload("whatever", PING.as_bytes());
        let outcome = handle_delivery(&engine, &headers("ping", Some(sig)), PING.as_bytes())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            IngressOutcome::Ignored {
                reason: "repository not registered".into()
            }
        );
    }

    #[tokio::test]
    async fn test_payload_without_repo_id_is_400() {
        let engine = engine();
        let body = br#"{"zen": "no repository here"}"#;
        let sig = auth::sign_payload("s", body);
        let err = handle_delivery(&engine, &headers("ping", Some(sig)), body)
            .await
            .unwrap_err();
        assert!(matches!(err, IngressError::MissingRepoId));
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_malformed_json_is_400() {
        let engine = engine();
        let err = handle_delivery(
            &engine,
            &headers("ping", Some("sha256=00".into())),
            b"not json {",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IngressError::MalformedPayload(_)));
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_installation_event_uses_app_secret() {
        let engine = engine();
        registered_repo(&engine).await;
        let body = r#"{
            "action": "created",
            "installation": { "id": 77 },
            "repositories": [{ "id": 42, "full_name": "acme/widgets" }]
        }"#;
        let sig = auth::sign_payload(APP_SECRET, body.as_bytes());
        let outcome = handle_delivery(
            &engine,
            &headers("installation", Some(sig)),
            body.as_bytes(),
        )
        .await
        .unwrap();
        let IngressOutcome::Processed { summary } = outcome else {
            panic!("expected processed");
        };
        assert_eq!(summary, "installation recorded on 1 repo(s)");

        // Repo secret does not verify app-level deliveries.
        let repo = engine
            .storage()
            .repo_by_github_id(42)
            .await
            .unwrap()
            .unwrap();
        let sig = auth::sign_payload(&repo.webhook_secret, body.as_bytes());
        let err = handle_delivery(
            &engine,
            &headers("installation", Some(sig)),
            body.as_bytes(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IngressError::SignatureMismatch));
    }

    #[tokio::test]
    async fn test_signed_pr_delivery_reaches_the_engine() {
        let engine = engine();
        let repo = registered_repo(&engine).await;
        let funder = engine
            .storage()
            .user_by_github_login("alice")
            .await
            .unwrap()
            .unwrap();
        engine
            .fund_bounty(&funder, 42, 101, 500, "0xusdc")
            .await
            .unwrap();
        engine.register_user("bob", None).await.unwrap();

        let body = r#"{
            "action": "opened",
            "pull_request": {
                "id": 900145, "number": 145,
                "title": "Fix", "body": "Fixes #101",
                "html_url": "https://github.com/acme/widgets/pull/145",
                "user": { "id": 5555, "login": "bob" },
                "merged": false, "merged_at": null, "closed_at": null
            },
            "repository": { "id": 42, "full_name": "acme/widgets" }
        }"#;
        let sig = auth::sign_payload(&repo.webhook_secret, body.as_bytes());
        let outcome = handle_delivery(
            &engine,
            &headers("pull_request", Some(sig)),
            body.as_bytes(),
        )
        .await
        .unwrap();
        assert_eq!(
            outcome,
            IngressOutcome::Processed {
                summary: "linked 1 submission(s)".into()
            }
        );
    }
}
