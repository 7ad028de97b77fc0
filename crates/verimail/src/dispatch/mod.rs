//! Mail dispatch abstractions

pub mod console;
pub mod outbox;
pub mod smtp;

pub use console::ConsoleDispatcher;
pub use outbox::{OutboundMessage, OutboxDispatcher};
pub use smtp::SmtpDispatcher;

use crate::error::VerifyResult;
use async_trait::async_trait;

/// Delivers a single message over some mail transport.
///
/// Failures are reported as [`VerifyError::DispatchFailed`](crate::VerifyError::DispatchFailed);
/// callers do not inspect transport-specific detail.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailDispatcher: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> VerifyResult<()>;
}
