//! Storage for verification records.
//!
//! A [`VerificationStore`] keeps exactly one [`VerificationRecord`] per
//! normalized address. Every operation is atomic with respect to the others:
//! two `issue` calls for the same address never interleave, and two `consume`
//! calls presenting the same token never both succeed.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::VerifyResult;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Persisted verification state of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationState {
    Pending,
    Verified,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Pending => "pending",
            VerificationState::Verified => "verified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(VerificationState::Pending),
            "verified" => Some(VerificationState::Verified),
            _ => None,
        }
    }
}

/// Status of an address as seen from outside the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressStatus {
    Unknown,
    Pending,
    Verified,
}

impl From<VerificationState> for AddressStatus {
    fn from(state: VerificationState) -> Self {
        match state {
            VerificationState::Pending => AddressStatus::Pending,
            VerificationState::Verified => AddressStatus::Verified,
        }
    }
}

/// One record per normalized email address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    pub address: String,
    /// Present only while `state` is pending
    pub token: Option<String>,
    pub state: VerificationState,
    pub issued_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl VerificationRecord {
    fn pending(address: &str, token: &str, issued_at: DateTime<Utc>) -> Self {
        Self {
            address: address.to_string(),
            token: Some(token.to_string()),
            state: VerificationState::Pending,
            issued_at,
            verified_at: None,
        }
    }
}

/// Record counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub pending: usize,
    pub verified: usize,
}

/// Durable mapping from address to its current token and state
pub trait VerificationStore: Send + Sync {
    /// Issue a new token for `address`, replacing any earlier token.
    fn issue(&self, address: &str) -> VerifyResult<String>;

    /// Consume a pending token, marking its address verified.
    ///
    /// Unknown, already used, superseded and expired tokens all yield
    /// [`VerifyError::TokenNotFound`](crate::VerifyError::TokenNotFound).
    fn consume(&self, token: &str) -> VerifyResult<String>;

    /// Current status of an address
    fn status(&self, address: &str) -> VerifyResult<AddressStatus>;

    /// Full record for an address, if any
    fn record(&self, address: &str) -> VerifyResult<Option<VerificationRecord>>;

    /// Remove pending records whose token has expired. Verified records stay.
    fn purge_expired(&self) -> VerifyResult<u64>;

    /// Counts of pending and verified records
    fn stats(&self) -> VerifyResult<StoreStats>;
}

/// Whether a token issued at `issued_at` is past its lifetime at `now`
pub(crate) fn is_expired(issued_at: DateTime<Utc>, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
    match ttl {
        Some(ttl) => now - issued_at >= ttl,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in [VerificationState::Pending, VerificationState::Verified] {
            assert_eq!(VerificationState::parse(state.as_str()), Some(state));
        }
        assert_eq!(VerificationState::parse("unknown"), None);
    }

    #[test]
    fn test_expiry_check() {
        let now = Utc::now();
        assert!(!is_expired(now - Duration::days(365), None, now));
        assert!(!is_expired(now - Duration::minutes(5), Some(Duration::minutes(15)), now));
        assert!(is_expired(now - Duration::minutes(15), Some(Duration::minutes(15)), now));
    }
}
