//! In-memory outbox, for tests and local development.

use super::MailDispatcher;
use crate::error::{VerifyError, VerifyResult};
use async_trait::async_trait;
use std::sync::Mutex;

/// A message handed to a dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Dispatcher that keeps every message instead of delivering it.
///
/// A failing outbox rejects every message with the configured reason.
#[derive(Debug, Default)]
pub struct OutboxDispatcher {
    sent: Mutex<Vec<OutboundMessage>>,
    failure: Option<String>,
}

impl OutboxDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// An outbox whose every send fails with `reason`
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failure: Some(reason.into()),
        }
    }

    /// All messages sent so far
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Most recent message sent to `to`
    pub fn last_to(&self, to: &str) -> Option<OutboundMessage> {
        self.messages().into_iter().rev().find(|message| message.to == to)
    }
}

#[async_trait]
impl MailDispatcher for OutboxDispatcher {
    async fn send(&self, to: &str, subject: &str, body: &str) -> VerifyResult<()> {
        if let Some(reason) = &self.failure {
            return Err(VerifyError::DispatchFailed(reason.clone()));
        }

        self.sent
            .lock()
            .map_err(|_| VerifyError::DispatchFailed("outbox lock poisoned".to_string()))?
            .push(OutboundMessage {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        Ok(())
    }
}
