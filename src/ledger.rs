//! Funding ledger derivations.
//!
//! A bounty's `total_funded` and `primary_funder_id` are never mutated
//! directly. Storage backends recompute them with [`snapshot`] from the
//! full commitment set inside the same transaction that adds or
//! withdraws a commitment, so the stored values always agree with the
//! ledger rows.

use crate::models::FundingCommitment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Sum of all non-withdrawn commitment amounts.
    pub total_funded: i64,
    /// Funder of the earliest-created non-withdrawn commitment.
    /// Ties on created_at break on the lower commitment id.
    pub primary_funder_id: Option<i64>,
    pub active_commitments: usize,
}

impl LedgerSnapshot {
    /// No active funding left: the bounty moves to cancelled.
    pub fn is_drained(&self) -> bool {
        self.active_commitments == 0
    }
}

pub fn snapshot(commitments: &[FundingCommitment]) -> LedgerSnapshot {
    let mut total: i64 = 0;
    let mut primary: Option<&FundingCommitment> = None;
    let mut active = 0usize;
    for c in commitments {
        if c.is_withdrawn() {
            continue;
        }
        active += 1;
        total += c.amount;
        primary = match primary {
            None => Some(c),
            Some(p) if (c.created_at, c.id) < (p.created_at, p.id) => Some(c),
            Some(p) => Some(p),
        };
    }
    LedgerSnapshot {
        total_funded: total,
        primary_funder_id: primary.map(|c| c.funder_id),
        active_commitments: active,
    }
}

/// The funder's non-withdrawn commitment on this bounty, if any.
/// At most one exists; storage enforces that with a partial unique index.
pub fn active_commitment_for<'a>(
    commitments: &'a [FundingCommitment],
    funder_id: i64,
) -> Option<&'a FundingCommitment> {
    commitments
        .iter()
        .find(|c| c.funder_id == funder_id && !c.is_withdrawn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn commitment(id: i64, funder: i64, amount: i64, at: DateTime<Utc>) -> FundingCommitment {
        FundingCommitment {
            id,
            bounty_id: 1,
            funder_id: funder,
            amount,
            token_address: "0xusdc".into(),
            created_at: at,
            withdrawn_at: None,
        }
    }

    #[test]
    fn test_totals_and_primary_follow_commitments() {
        // Funder A pledges 1500, then funder B pledges 800.
        let a = commitment(1, 100, 1500, ts(0));
        let b = commitment(2, 200, 800, ts(60));

        let snap = snapshot(&[a.clone(), b.clone()]);
        assert_eq!(snap.total_funded, 2300);
        assert_eq!(snap.primary_funder_id, Some(100));
        assert_eq!(snap.active_commitments, 2);

        // A withdraws: total drops, primacy passes to B.
        let mut a2 = a;
        a2.withdrawn_at = Some(ts(120));
        let snap = snapshot(&[a2.clone(), b.clone()]);
        assert_eq!(snap.total_funded, 800);
        assert_eq!(snap.primary_funder_id, Some(200));
        assert!(!snap.is_drained());

        // B withdraws too: ledger drains and the bounty must cancel.
        let mut b2 = b;
        b2.withdrawn_at = Some(ts(180));
        let snap = snapshot(&[a2, b2]);
        assert_eq!(snap.total_funded, 0);
        assert_eq!(snap.primary_funder_id, None);
        assert!(snap.is_drained());
    }

    #[test]
    fn test_withdrawn_amounts_never_count() {
        let mut a = commitment(1, 100, 1500, ts(0));
        a.withdrawn_at = Some(ts(5));
        let b = commitment(2, 200, 800, ts(60));
        assert_eq!(snapshot(&[a, b]).total_funded, 800);
    }

    #[test]
    fn test_created_at_tie_breaks_on_id() {
        // Two commitments landing in the same instant: the lower row id
        // was inserted first.
        let a = commitment(7, 100, 500, ts(0));
        let b = commitment(3, 200, 500, ts(0));
        assert_eq!(snapshot(&[a, b]).primary_funder_id, Some(200));
    }

    #[test]
    fn test_rewritten_commitment_does_not_restore_primacy() {
        // A withdraws and re-pledges: the new commitment is a new row
        // with a later created_at, so B stays primary.
        let mut a = commitment(1, 100, 1500, ts(0));
        a.withdrawn_at = Some(ts(100));
        let b = commitment(2, 200, 800, ts(60));
        let a_again = commitment(3, 100, 1500, ts(200));
        let snap = snapshot(&[a, b, a_again]);
        assert_eq!(snap.total_funded, 2300);
        assert_eq!(snap.primary_funder_id, Some(200));
    }

    #[test]
    fn test_active_commitment_lookup_skips_withdrawn() {
        let mut old = commitment(1, 100, 1500, ts(0));
        old.withdrawn_at = Some(ts(10));
        let current = commitment(2, 100, 900, ts(20));
        let rows = [old, current];
        let found = active_commitment_for(&rows, 100).unwrap();
        assert_eq!(found.id, 2);
        assert!(active_commitment_for(&rows, 999).is_none());
    }

    #[test]
    fn test_empty_ledger_snapshot() {
        let snap = snapshot(&[]);
        assert_eq!(snap.total_funded, 0);
        assert_eq!(snap.primary_funder_id, None);
        assert!(snap.is_drained());
    }
}
