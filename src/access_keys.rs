//! Access-key authorization checks for automated payouts.
//!
//! The key rows and their per-token limits are a cache of what the
//! funder authorized on-chain; the signer re-verifies before any
//! transfer. A failed check here never blocks a payout, it downgrades
//! it to the manual signature path with the reason recorded.

use chrono::{DateTime, Utc};

use crate::models::{AccessKey, AccessKeyStatus};

/// Outcome of checking a spend against the cached key state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendPrecheck {
    Ok,
    NoActiveKey,
    KeyInactive(AccessKeyStatus),
    KeyExpired,
    NoLimitForToken,
    InsufficientRemaining { remaining: i64 },
}

impl SpendPrecheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, SpendPrecheck::Ok)
    }

    /// Human-readable reason attached to the manual-payout notification.
    pub fn manual_reason(&self) -> &'static str {
        match self {
            SpendPrecheck::Ok => "automated payout available",
            SpendPrecheck::NoActiveKey => "funder has no active access key",
            SpendPrecheck::KeyInactive(AccessKeyStatus::Revoked) => "access key was revoked",
            SpendPrecheck::KeyInactive(_) => "access key is not active",
            SpendPrecheck::KeyExpired => "access key has expired",
            SpendPrecheck::NoLimitForToken => "no spend limit for the bounty token",
            SpendPrecheck::InsufficientRemaining { .. } => "spend limit exhausted",
        }
    }
}

/// Active and unexpired at `now`.
pub fn usable(key: &AccessKey, now: DateTime<Utc>) -> bool {
    key.status == AccessKeyStatus::Active
        && key.expires_at.map(|exp| exp > now).unwrap_or(true)
}

pub fn remaining_for(key: &AccessKey, token_address: &str) -> Option<i64> {
    key.limits
        .iter()
        .find(|l| l.token_address == token_address)
        .map(|l| l.remaining)
}

/// Check a prospective spend of `amount` of `token_address`.
pub fn precheck(
    key: Option<&AccessKey>,
    token_address: &str,
    amount: i64,
    now: DateTime<Utc>,
) -> SpendPrecheck {
    let Some(key) = key else {
        return SpendPrecheck::NoActiveKey;
    };
    if key.status != AccessKeyStatus::Active {
        return SpendPrecheck::KeyInactive(key.status);
    }
    if let Some(expires_at) = key.expires_at {
        if expires_at <= now {
            return SpendPrecheck::KeyExpired;
        }
    }
    match remaining_for(key, token_address) {
        None => SpendPrecheck::NoLimitForToken,
        Some(remaining) if remaining < amount => {
            SpendPrecheck::InsufficientRemaining { remaining }
        }
        Some(_) => SpendPrecheck::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SpendLimit;
    use chrono::{TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn key(status: AccessKeyStatus, expires_at: Option<DateTime<Utc>>) -> AccessKey {
        AccessKey {
            id: 1,
            user_id: 100,
            key_id: "key_abc123".into(),
            status,
            expires_at,
            created_at: ts(0),
            revoked_at: None,
            limits: vec![SpendLimit {
                token_address: "0xusdc".into(),
                initial: 2000,
                remaining: 1500,
            }],
        }
    }

    #[test]
    fn test_active_key_with_headroom_passes() {
        let k = key(AccessKeyStatus::Active, Some(ts(3600)));
        assert_eq!(precheck(Some(&k), "0xusdc", 1500, ts(60)), SpendPrecheck::Ok);
    }

    #[test]
    fn test_overspend_reports_remaining() {
        let k = key(AccessKeyStatus::Active, None);
        assert_eq!(
            precheck(Some(&k), "0xusdc", 1501, ts(60)),
            SpendPrecheck::InsufficientRemaining { remaining: 1500 }
        );
    }

    #[test]
    fn test_missing_key_and_missing_limit() {
        assert_eq!(precheck(None, "0xusdc", 1, ts(0)), SpendPrecheck::NoActiveKey);
        let k = key(AccessKeyStatus::Active, None);
        assert_eq!(
            precheck(Some(&k), "0xdai", 1, ts(0)),
            SpendPrecheck::NoLimitForToken
        );
    }

    #[test]
    fn test_revoked_and_expired_keys_fail_closed() {
        let revoked = key(AccessKeyStatus::Revoked, None);
        assert_eq!(
            precheck(Some(&revoked), "0xusdc", 1, ts(0)),
            SpendPrecheck::KeyInactive(AccessKeyStatus::Revoked)
        );
        assert_eq!(revoked_reason(&revoked), "access key was revoked");

        let expired = key(AccessKeyStatus::Active, Some(ts(10)));
        assert_eq!(precheck(Some(&expired), "0xusdc", 1, ts(10)), SpendPrecheck::KeyExpired);
        assert_eq!(precheck(Some(&expired), "0xusdc", 1, ts(11)), SpendPrecheck::KeyExpired);
        assert_eq!(precheck(Some(&expired), "0xusdc", 1, ts(9)), SpendPrecheck::Ok);
    }

    fn revoked_reason(k: &AccessKey) -> &'static str {
        precheck(Some(k), "0xusdc", 1, ts(0)).manual_reason()
    }

    #[test]
    fn test_usable_matches_precheck_gate() {
        let k = key(AccessKeyStatus::Active, Some(ts(100)));
        assert!(usable(&k, ts(99)));
        assert!(!usable(&k, ts(100)));
        assert!(!usable(&key(AccessKeyStatus::Expired, None), ts(0)));
    }
}
