//! Payout planning and the automated signing path.
//!
//! When a submission becomes payable, one payout row per active
//! commitment is planned. The runner then tries to sign each payout
//! through the funder's delegated access key: cached limit precheck,
//! atomic reservation, on-chain re-verification, then the signer call.
//! Any failure along that path releases the reservation and leaves the
//! payout on the manual signature path with the funder notified. A
//! payout is never blocked by automation trouble.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access_keys;
use crate::error::Result;
use crate::models::{FundingCommitment, Payout, PayoutMethod, PayoutStatus, Submission};
use crate::notify::{self, Notification, NotificationKind, Notifier};
use crate::signer::{PayoutSigner, TransferRequest};
use crate::storage::{NewPayout, SpendReservation, Storage};

/// One payout per active commitment, splitting the bounty by what each
/// funder actually put in.
pub fn plan_payouts(
    submission: &Submission,
    commitments: &[FundingCommitment],
) -> Vec<NewPayout> {
    commitments
        .iter()
        .filter(|c| !c.is_withdrawn())
        .map(|c| NewPayout {
            id: Uuid::new_v4().to_string(),
            submission_id: submission.id,
            commitment_id: c.id,
            funder_id: c.funder_id,
            contributor_id: submission.contributor_id,
            amount: c.amount,
            token_address: c.token_address.clone(),
        })
        .collect()
}

/// Result of one automation attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// Signed and broadcast by the backend signer.
    Signed(Payout),
    /// Left on the manual signature path.
    Manual { payout: Payout, reason: String },
}

pub struct PayoutRunner {
    storage: Arc<dyn Storage>,
    signer: Option<Arc<dyn PayoutSigner>>,
    notifier: Arc<dyn Notifier>,
}

impl PayoutRunner {
    pub fn new(
        storage: Arc<dyn Storage>,
        signer: Option<Arc<dyn PayoutSigner>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            storage,
            signer,
            notifier,
        }
    }

    /// Attempt automated signing for every payout of the submission
    /// still awaiting a signature. Attempts run concurrently; each
    /// payout settles independently.
    pub async fn execute(&self, submission_id: i64) -> Result<Vec<AttemptOutcome>> {
        let payouts = self.storage.payouts_for_submission(submission_id).await?;
        let pending: Vec<Payout> = payouts
            .into_iter()
            .filter(|p| {
                p.status == PayoutStatus::AwaitingSignature && p.method == PayoutMethod::Manual
            })
            .collect();
        let outcomes = join_all(pending.into_iter().map(|p| self.attempt(p))).await;
        outcomes.into_iter().collect()
    }

    async fn attempt(&self, payout: Payout) -> Result<AttemptOutcome> {
        let contributor = self
            .storage
            .user_by_id(payout.contributor_id)
            .await?
            .ok_or(crate::error::EngineError::NotFound("contributor"))?;
        let Some(wallet) = contributor.wallet_address.clone() else {
            return self
                .leave_manual(payout, "contributor has no wallet address".into())
                .await;
        };
        let Some(signer) = self.signer.clone() else {
            return self
                .leave_manual(payout, "automated signing is not configured".into())
                .await;
        };

        let key = self.storage.active_access_key(payout.funder_id).await?;
        let check = access_keys::precheck(
            key.as_ref(),
            &payout.token_address,
            payout.amount,
            Utc::now(),
        );
        if !check.is_ok() {
            return self
                .leave_manual(payout, check.manual_reason().into())
                .await;
        }
        let key = key.expect("precheck passed without a key");

        match self
            .storage
            .reserve_spend(&key.key_id, &payout.token_address, payout.amount)
            .await?
        {
            SpendReservation::Reserved => {}
            SpendReservation::InsufficientRemaining => {
                return self
                    .leave_manual(payout, "spend limit exhausted".into())
                    .await;
            }
            SpendReservation::NotAvailable => {
                return self
                    .leave_manual(payout, "no spend limit for the bounty token".into())
                    .await;
            }
        }

        // The chain is authoritative; the reserved cache amount only
        // prevents concurrent local overspend.
        match signer
            .authorized_remaining(&key.key_id, &payout.token_address)
            .await
        {
            Ok(remaining) if remaining >= payout.amount => {}
            Ok(remaining) => {
                self.storage
                    .release_spend(&key.key_id, &payout.token_address, payout.amount)
                    .await?;
                return self
                    .leave_manual(
                        payout,
                        format!(
                            "on-chain authorization has only {remaining} of the token remaining"
                        ),
                    )
                    .await;
            }
            Err(e) => {
                self.storage
                    .release_spend(&key.key_id, &payout.token_address, payout.amount)
                    .await?;
                return self
                    .leave_manual(payout, format!("authorization check failed: {e}"))
                    .await;
            }
        }

        let request = TransferRequest {
            reference: payout.id.clone(),
            key_id: key.key_id.clone(),
            token_address: payout.token_address.clone(),
            amount: payout.amount,
            recipient_wallet: wallet,
        };
        match signer.sign_transfer(&request).await {
            Ok(tx_hash) => {
                let signed = self
                    .storage
                    .mark_payout_signed(&payout.id, &tx_hash, Utc::now())
                    .await?;
                info!(
                    payout_id = %signed.id,
                    tx_hash = %tx_hash,
                    "payout signed through access key"
                );
                Ok(AttemptOutcome::Signed(signed))
            }
            Err(e) => {
                self.storage
                    .release_spend(&key.key_id, &payout.token_address, payout.amount)
                    .await?;
                self.leave_manual(payout, format!("signing failed: {e}"))
                    .await
            }
        }
    }

    async fn leave_manual(&self, payout: Payout, reason: String) -> Result<AttemptOutcome> {
        warn!(
            payout_id = %payout.id,
            funder_id = payout.funder_id,
            "payout needs a manual signature: {reason}"
        );
        notify::dispatch_best_effort(
            self.notifier.as_ref(),
            Notification::new(
                NotificationKind::PayoutRequiresSignature,
                format!("payout of {} requires your signature: {reason}", payout.amount),
            )
            .recipient(payout.funder_id)
            .submission(payout.submission_id)
            .payout(&payout.id),
        )
        .await;
        Ok(AttemptOutcome::Manual { payout, reason })
    }
}
