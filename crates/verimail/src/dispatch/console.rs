//! Console dispatcher for development

use super::MailDispatcher;
use crate::error::VerifyResult;
use async_trait::async_trait;
use tracing::info;

/// Dispatcher that writes messages to the log instead of sending them
#[derive(Debug, Default)]
pub struct ConsoleDispatcher;

impl ConsoleDispatcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MailDispatcher for ConsoleDispatcher {
    async fn send(&self, to: &str, subject: &str, body: &str) -> VerifyResult<()> {
        info!(to = %to, subject = %subject, "Console email dispatch:\n{}", body);
        Ok(())
    }
}
