//! In-memory verification store.

use super::{is_expired, AddressStatus, StoreStats, VerificationRecord, VerificationState, VerificationStore};
use crate::error::{VerifyError, VerifyResult};
use crate::token;
use chrono::{Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, info, warn};

/// Verification store backed by concurrent maps.
///
/// Lock order is always `records` before `tokens`. `consume` never holds both:
/// it first removes the token from the index (which picks a single winner),
/// then checks the record under its entry lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// address -> record
    records: DashMap<String, VerificationRecord>,

    /// token -> address, for live pending tokens only
    tokens: DashMap<String, String>,

    token_ttl: Option<Duration>,
}

impl MemoryStore {
    /// Create an empty store. `token_ttl` of `None` disables expiry.
    pub fn new(token_ttl: Option<Duration>) -> Self {
        Self {
            records: DashMap::new(),
            tokens: DashMap::new(),
            token_ttl,
        }
    }

    fn fresh_token(&self) -> String {
        loop {
            let token = token::generate();
            if !self.tokens.contains_key(&token) {
                return token;
            }
        }
    }
}

impl VerificationStore for MemoryStore {
    fn issue(&self, address: &str) -> VerifyResult<String> {
        let token = self.fresh_token();
        let now = Utc::now();

        match self.records.entry(address.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if let Some(previous) = record.token.take() {
                    self.tokens.remove(&previous);
                    debug!("Superseded pending token for {}", address);
                }
                record.token = Some(token.clone());
                record.state = VerificationState::Pending;
                record.issued_at = now;
                record.verified_at = None;
                self.tokens.insert(token.clone(), address.to_string());
            }
            Entry::Vacant(vacant) => {
                self.tokens.insert(token.clone(), address.to_string());
                vacant.insert(VerificationRecord::pending(address, &token, now));
            }
        }

        debug!("Issued token for {}", address);
        Ok(token)
    }

    fn consume(&self, token: &str) -> VerifyResult<String> {
        let (_, address) = self.tokens.remove(token).ok_or(VerifyError::TokenNotFound)?;
        let now = Utc::now();

        let expired = {
            let Some(mut record) = self.records.get_mut(&address) else {
                return Err(VerifyError::TokenNotFound);
            };
            if record.state != VerificationState::Pending || record.token.as_deref() != Some(token) {
                return Err(VerifyError::TokenNotFound);
            }

            if is_expired(record.issued_at, self.token_ttl, now) {
                true
            } else {
                record.state = VerificationState::Verified;
                record.token = None;
                record.verified_at = Some(now);
                false
            }
        };

        if expired {
            self.records.remove_if(&address, |_, record| {
                record.state == VerificationState::Pending && record.token.as_deref() == Some(token)
            });
            warn!("Attempted to use expired token for {}", address);
            return Err(VerifyError::TokenNotFound);
        }

        debug!("Consumed token for {}", address);
        Ok(address)
    }

    fn status(&self, address: &str) -> VerifyResult<AddressStatus> {
        Ok(self
            .records
            .get(address)
            .map(|record| record.state.into())
            .unwrap_or(AddressStatus::Unknown))
    }

    fn record(&self, address: &str) -> VerifyResult<Option<VerificationRecord>> {
        Ok(self.records.get(address).map(|record| record.clone()))
    }

    fn purge_expired(&self) -> VerifyResult<u64> {
        if self.token_ttl.is_none() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut expired = Vec::new();
        for entry in self.records.iter() {
            let record = entry.value();
            if record.state == VerificationState::Pending
                && is_expired(record.issued_at, self.token_ttl, now)
            {
                expired.push(entry.key().clone());
            }
        }

        let mut purged = 0;
        for address in expired {
            let removed = self.records.remove_if(&address, |_, record| {
                record.state == VerificationState::Pending
                    && is_expired(record.issued_at, self.token_ttl, now)
            });
            if let Some((_, record)) = removed {
                if let Some(token) = record.token {
                    self.tokens.remove(&token);
                }
                purged += 1;
            }
        }

        info!("Purged {} expired pending records", purged);
        Ok(purged)
    }

    fn stats(&self) -> VerifyResult<StoreStats> {
        let mut stats = StoreStats::default();
        for entry in self.records.iter() {
            match entry.value().state {
                VerificationState::Pending => stats.pending += 1,
                VerificationState::Verified => stats.verified += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn test_issue_and_consume_token() {
        let store = MemoryStore::new(None);
        let email = "test@example.com";

        let token = store.issue(email).unwrap();
        assert!(!token.is_empty());
        assert_eq!(store.status(email).unwrap(), AddressStatus::Pending);

        assert_eq!(store.consume(&token).unwrap(), email);
        assert_eq!(store.status(email).unwrap(), AddressStatus::Verified);

        // Token should be gone now
        assert!(matches!(store.consume(&token), Err(VerifyError::TokenNotFound)));
    }

    #[test]
    fn test_verified_record_keeps_no_token() {
        let store = MemoryStore::new(None);
        let token = store.issue("test@example.com").unwrap();
        store.consume(&token).unwrap();

        let record = store.record("test@example.com").unwrap().unwrap();
        assert_eq!(record.state, VerificationState::Verified);
        assert!(record.token.is_none());
        assert!(record.verified_at.is_some());
    }

    #[test]
    fn test_reissue_supersedes_previous_token() {
        let store = MemoryStore::new(None);
        let first = store.issue("test@example.com").unwrap();
        let second = store.issue("test@example.com").unwrap();
        assert_ne!(first, second);

        assert!(store.consume(&first).is_err());
        assert_eq!(store.consume(&second).unwrap(), "test@example.com");
    }

    #[test]
    fn test_reissue_after_verification_returns_to_pending() {
        let store = MemoryStore::new(None);
        let token = store.issue("test@example.com").unwrap();
        store.consume(&token).unwrap();

        let again = store.issue("test@example.com").unwrap();
        assert_eq!(store.status("test@example.com").unwrap(), AddressStatus::Pending);
        assert!(store.consume(&token).is_err());
        assert!(store.consume(&again).is_ok());
    }

    #[test]
    fn test_unknown_address_and_token() {
        let store = MemoryStore::new(None);
        assert_eq!(store.status("nobody@example.com").unwrap(), AddressStatus::Unknown);
        assert!(store.record("nobody@example.com").unwrap().is_none());
        assert!(store.consume("nonexistent-token").is_err());
    }

    #[test]
    fn test_expired_token() {
        let store = MemoryStore::new(Some(Duration::zero()));
        let token = store.issue("test@example.com").unwrap();

        thread::sleep(StdDuration::from_millis(10));

        assert!(matches!(store.consume(&token), Err(VerifyError::TokenNotFound)));
        assert_eq!(store.status("test@example.com").unwrap(), AddressStatus::Unknown);
    }

    #[test]
    fn test_purge_keeps_verified_records() {
        let store = MemoryStore::new(Some(Duration::milliseconds(5)));
        let verified = store.issue("done@example.com").unwrap();
        store.consume(&verified).unwrap();
        let stale = store.issue("stale@example.com").unwrap();

        thread::sleep(StdDuration::from_millis(20));

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.status("done@example.com").unwrap(), AddressStatus::Verified);
        assert_eq!(store.status("stale@example.com").unwrap(), AddressStatus::Unknown);
        assert!(store.consume(&stale).is_err());
    }

    #[test]
    fn test_purge_without_expiry_is_noop() {
        let store = MemoryStore::new(None);
        store.issue("test@example.com").unwrap();
        assert_eq!(store.purge_expired().unwrap(), 0);
        assert_eq!(store.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_store_stats() {
        let store = MemoryStore::new(None);
        assert_eq!(store.stats().unwrap(), StoreStats::default());

        let token = store.issue("a@example.com").unwrap();
        store.issue("b@example.com").unwrap();
        store.consume(&token).unwrap();

        assert_eq!(store.stats().unwrap(), StoreStats { pending: 1, verified: 1 });
    }

    #[test]
    fn test_concurrent_consume_has_single_winner() {
        let store = Arc::new(MemoryStore::new(None));
        let token = store.issue("race@example.com").unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                let token = token.clone();
                thread::spawn(move || store.consume(&token).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_issue_leaves_one_live_token() {
        let store = Arc::new(MemoryStore::new(None));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.issue("same@example.com").unwrap())
            })
            .collect();
        let tokens: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let record = store.record("same@example.com").unwrap().unwrap();
        let live = record.token.unwrap();
        assert!(tokens.contains(&live));
        assert_eq!(store.tokens.len(), 1);

        for token in tokens.iter().filter(|t| **t != live) {
            assert!(store.consume(token).is_err());
        }
        assert!(store.consume(&live).is_ok());
    }
}
