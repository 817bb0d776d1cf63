//! Outbound notifications.
//!
//! Notifications are fire-and-forget: delivery failure is logged and
//! never fails the transaction that produced the event. The HTTP sink
//! posts one JSON document per event; deployments without a sink run
//! the no-op implementation.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    SubmissionReceived,
    SubmissionRejected,
    PayoutRequiresSignature,
    PayoutConfirmed,
    BountyCancelled,
    BountyCompleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Marketplace user the event concerns, when one is known.
    pub recipient_user_id: Option<i64>,
    pub bounty_id: Option<i64>,
    pub submission_id: Option<i64>,
    pub payout_id: Option<String>,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            recipient_user_id: None,
            bounty_id: None,
            submission_id: None,
            payout_id: None,
            message: message.into(),
        }
    }

    pub fn recipient(mut self, user_id: i64) -> Self {
        self.recipient_user_id = Some(user_id);
        self
    }

    pub fn bounty(mut self, bounty_id: i64) -> Self {
        self.bounty_id = Some(bounty_id);
        self
    }

    pub fn submission(mut self, submission_id: i64) -> Self {
        self.submission_id = Some(submission_id);
        self
    }

    pub fn payout(mut self, payout_id: &str) -> Self {
        self.payout_id = Some(payout_id.to_string());
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// POSTs each notification to the configured sink.
pub struct HttpNotifier {
    client: reqwest::Client,
    sink_url: String,
}

impl HttpNotifier {
    pub fn new(sink_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, sink_url })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.sink_url)
            .json(notification)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("notification sink returned {}", response.status());
        }
        Ok(())
    }
}

/// Used when no sink is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        debug!(
            "notification (no sink): {:?} {}",
            notification.kind, notification.message
        );
        Ok(())
    }
}

/// Deliver without letting sink trouble reach the caller.
pub async fn dispatch_best_effort(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.notify(&notification).await {
        warn!(
            "failed to deliver {:?} notification: {}",
            notification.kind, e
        );
    }
}
