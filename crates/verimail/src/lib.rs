//! verimail - email address verification with single-use links
//!
//! This crate provides an HTTP server that implements the verification flow:
//! 1. A user submits an email address
//! 2. The address is checked for syntax and, optionally, DNS deliverability
//! 3. A single-use token is issued and a link carrying it is emailed out
//! 4. Visiting the link consumes the token and marks the address verified
//!
//! Re-submitting an address replaces its outstanding token. A token is
//! accepted at most once, even under concurrent visits.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod notify;
pub mod service;
pub mod store;
pub mod token;
pub mod validation;

pub use config::VerimailConfig;
pub use error::{VerifyError, VerifyResult};
pub use service::{Confirmation, ConfirmationStatus, SubmissionReport, VerificationService};
pub use validation::{CheckedAddress, EmailValidator};
