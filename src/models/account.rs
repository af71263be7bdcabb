// src/models/account.rs
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use subtle::ConstantTimeEq;

/// Outcome of checking a presented token against an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    Valid,
    Mismatch,
    Expired,
}

/// One player identity known to the master. At most one token is active at
/// a time; issuing a new one invalidates the previous token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub uid: String,
    pub token: Option<String>,
    pub token_issued_at: Option<SystemTime>,
}

impl Account {
    pub fn new(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            token: None,
            token_issued_at: None,
        }
    }

    /// Replaces the active token.
    pub fn issue_token(&mut self, token: String, now: SystemTime) {
        self.token = Some(token);
        self.token_issued_at = Some(now);
    }

    /// Checks `candidate` against the active token. The comparison itself
    /// is constant-time; the match is checked before the expiry window so
    /// a wrong token never learns whether a session existed.
    pub fn check_token(&self, candidate: &str, now: SystemTime, expiry: Duration) -> TokenCheck {
        let (token, issued_at) = match (&self.token, self.token_issued_at) {
            (Some(t), Some(at)) => (t, at),
            _ => return TokenCheck::Mismatch,
        };
        if !bool::from(token.as_bytes().ct_eq(candidate.as_bytes())) {
            return TokenCheck::Mismatch;
        }
        match now.duration_since(issued_at) {
            Ok(age) if age >= expiry => TokenCheck::Expired,
            _ => TokenCheck::Valid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRY: Duration = Duration::from_secs(3600);

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn no_token_is_a_mismatch() {
        let acct = Account::new("1001");
        assert_eq!(acct.check_token("anything", t(0), EXPIRY), TokenCheck::Mismatch);
    }

    #[test]
    fn token_valid_inside_window_expired_after() {
        let mut acct = Account::new("1001");
        acct.issue_token("tok-a".into(), t(100));
        assert_eq!(acct.check_token("tok-a", t(100 + 3599), EXPIRY), TokenCheck::Valid);
        assert_eq!(acct.check_token("tok-a", t(100 + 3601), EXPIRY), TokenCheck::Expired);
    }

    #[test]
    fn reissue_invalidates_previous_token() {
        let mut acct = Account::new("1001");
        acct.issue_token("tok-a".into(), t(100));
        acct.issue_token("tok-b".into(), t(200));
        assert_eq!(acct.check_token("tok-a", t(201), EXPIRY), TokenCheck::Mismatch);
        assert_eq!(acct.check_token("tok-b", t(201), EXPIRY), TokenCheck::Valid);
    }

    #[test]
    fn wrong_token_mismatches_even_when_expired() {
        let mut acct = Account::new("1001");
        acct.issue_token("tok-a".into(), t(100));
        assert_eq!(acct.check_token("tok-x", t(100 + 7200), EXPIRY), TokenCheck::Mismatch);
    }
}
