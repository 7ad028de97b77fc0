//! The verification state machine.
//!
//! Per address: `Unknown -> Pending -> Verified`. A validated submission moves
//! any state to `Pending` with a fresh token (newest submission wins); a
//! successful confirmation moves `Pending` to `Verified`. Every other attempt
//! reports the same generic failure.

use crate::error::{VerifyError, VerifyResult};
use crate::notify::{DispatchOutcome, Notifier};
use crate::store::{AddressStatus, StoreStats, VerificationStore};
use crate::validation::{self, EmailValidator};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONFIRM_SUCCESS_MESSAGE: &str = "Your email address has been verified.";
const CONFIRM_ERROR_MESSAGE: &str = "This verification link is invalid or has already been used.";

/// Outcome of the syntax and deliverability check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Valid { deliverability_checked: bool },
    Invalid { reason: String },
}

/// Whether a token was issued for the submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceOutcome {
    Issued,
    NotIssued,
}

/// Composite result of a submission, one entry per stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReport {
    pub normalized_address: String,
    pub validation: ValidationOutcome,
    pub issuance: IssuanceOutcome,
    pub dispatch: DispatchOutcome,
}

impl SubmissionReport {
    fn rejected(address: &str, reason: String) -> Self {
        Self {
            normalized_address: address.to_string(),
            validation: ValidationOutcome::Invalid { reason },
            issuance: IssuanceOutcome::NotIssued,
            dispatch: DispatchOutcome::Skipped,
        }
    }

    pub fn is_issued(&self) -> bool {
        self.issuance == IssuanceOutcome::Issued
    }
}

impl fmt::Display for SubmissionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.normalized_address)?;

        match &self.validation {
            ValidationOutcome::Valid {
                deliverability_checked: true,
            } => write!(f, " → Syntax + MX OK")?,
            ValidationOutcome::Valid {
                deliverability_checked: false,
            } => write!(f, " → Syntax OK")?,
            ValidationOutcome::Invalid { reason } => return write!(f, " → Invalid ({})", reason),
        }

        match &self.dispatch {
            DispatchOutcome::Sent => write!(f, " → Verification email sent"),
            DispatchOutcome::Scheduled => write!(f, " → Verification email scheduled"),
            DispatchOutcome::Failed { reason } => {
                write!(f, " → Failed to send verification email ({})", reason)
            }
            DispatchOutcome::Skipped => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Success,
    Error,
}

/// Result of presenting a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confirmation {
    pub status: ConfirmationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub message: String,
}

impl Confirmation {
    fn success(address: String) -> Self {
        Self {
            status: ConfirmationStatus::Success,
            address: Some(address),
            message: CONFIRM_SUCCESS_MESSAGE.to_string(),
        }
    }

    fn failure() -> Self {
        Self {
            status: ConfirmationStatus::Error,
            address: None,
            message: CONFIRM_ERROR_MESSAGE.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ConfirmationStatus::Success
    }
}

/// Orchestrates validation, issuance, notification and consumption
pub struct VerificationService {
    store: Arc<dyn VerificationStore>,
    validator: Arc<dyn EmailValidator>,
    notifier: Notifier,
}

impl VerificationService {
    pub fn new(
        store: Arc<dyn VerificationStore>,
        validator: Arc<dyn EmailValidator>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            validator,
            notifier,
        }
    }

    /// Validate `raw_address`, issue a token and send the verification link.
    ///
    /// Validation and dispatch failures are reported inside the returned
    /// report. Only storage faults and other internal errors are returned as
    /// `Err`. A dispatch failure never revokes the issued token.
    pub async fn submit(&self, raw_address: &str) -> VerifyResult<SubmissionReport> {
        let checked = match self.validator.check(raw_address).await {
            Ok(checked) => checked,
            Err(VerifyError::ValidationFailed(reason)) => {
                info!("Rejected submission {:?}: {}", raw_address.trim(), reason);
                return Ok(SubmissionReport::rejected(raw_address.trim(), reason));
            }
            Err(e) => return Err(e),
        };

        let address = checked.address;
        let token = self.store.issue(&address)?;
        info!("Issued verification token for {}", address);

        // The store lock is released before dispatch starts
        let dispatch = self.notifier.notify(&address, &token).await;
        if let DispatchOutcome::Failed { reason } = &dispatch {
            warn!("Verification email for {} not sent: {}", address, reason);
        }

        Ok(SubmissionReport {
            normalized_address: address,
            validation: ValidationOutcome::Valid {
                deliverability_checked: checked.deliverability_checked,
            },
            issuance: IssuanceOutcome::Issued,
            dispatch,
        })
    }

    /// Consume `token`. Unknown, used, superseded and expired tokens all give
    /// the same error confirmation; only storage faults are returned as `Err`.
    pub async fn confirm(&self, token: &str) -> VerifyResult<Confirmation> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(Confirmation::failure());
        }

        match self.store.consume(token) {
            Ok(address) => {
                info!("Verified {}", address);
                Ok(Confirmation::success(address))
            }
            Err(VerifyError::TokenNotFound) => {
                debug!("Rejected verification attempt with unknown token");
                Ok(Confirmation::failure())
            }
            Err(e) => Err(e),
        }
    }

    /// Status of an address; malformed input is simply unknown
    pub fn status(&self, raw_address: &str) -> VerifyResult<AddressStatus> {
        match validation::normalize(raw_address) {
            Ok(address) => self.store.status(&address),
            Err(_) => Ok(AddressStatus::Unknown),
        }
    }

    pub fn purge_expired(&self) -> VerifyResult<u64> {
        self.store.purge_expired()
    }

    pub fn stats(&self) -> VerifyResult<StoreStats> {
        self.store.stats()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Drain pending background dispatches
    pub async fn shutdown(&self) {
        self.notifier.shutdown().await;
    }
}
