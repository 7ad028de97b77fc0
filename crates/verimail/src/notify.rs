//! Verification message delivery.
//!
//! The [`Notifier`] turns an issued token into a verification link and a
//! message, then hands it to a [`MailDispatcher`]. In [`DispatchMode::Sync`]
//! the caller waits for the transport; in [`DispatchMode::Queued`] the message
//! goes onto a bounded channel drained by a background task, and the caller
//! only learns that delivery was scheduled.

use crate::config::DispatchMode;
use crate::dispatch::{MailDispatcher, OutboundMessage};
use crate::error::{VerifyError, VerifyResult};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Result of handing a verification message to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Delivered to the transport
    Sent,
    /// Accepted by the background queue
    Scheduled,
    Failed { reason: String },
    /// Nothing was issued, so nothing was sent
    Skipped,
}

struct DispatchQueue {
    tx: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Builds verification messages and routes them to the dispatcher
pub struct Notifier {
    dispatcher: Arc<dyn MailDispatcher>,
    base_url: Url,
    subject: String,
    token_expiry_minutes: Option<u64>,
    queue: Option<DispatchQueue>,
}

impl Notifier {
    /// Notifier that waits for every delivery
    pub fn sync(dispatcher: Arc<dyn MailDispatcher>, base_url: &str, subject: &str) -> VerifyResult<Self> {
        Ok(Self {
            dispatcher,
            base_url: parse_base_url(base_url)?,
            subject: subject.to_string(),
            token_expiry_minutes: None,
            queue: None,
        })
    }

    /// Notifier backed by a background worker. Must be called within a Tokio runtime.
    pub fn queued(
        dispatcher: Arc<dyn MailDispatcher>,
        base_url: &str,
        subject: &str,
        capacity: usize,
    ) -> VerifyResult<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(Arc::clone(&dispatcher), rx));

        Ok(Self {
            dispatcher,
            base_url: parse_base_url(base_url)?,
            subject: subject.to_string(),
            token_expiry_minutes: None,
            queue: Some(DispatchQueue {
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn new(
        mode: DispatchMode,
        dispatcher: Arc<dyn MailDispatcher>,
        base_url: &str,
        subject: &str,
        capacity: usize,
    ) -> VerifyResult<Self> {
        match mode {
            DispatchMode::Sync => Self::sync(dispatcher, base_url, subject),
            DispatchMode::Queued => Self::queued(dispatcher, base_url, subject, capacity),
        }
    }

    /// Mention the token lifetime in outgoing messages
    pub fn with_token_expiry(mut self, minutes: Option<u64>) -> Self {
        self.token_expiry_minutes = minutes;
        self
    }

    pub fn mode(&self) -> DispatchMode {
        if self.queue.is_some() {
            DispatchMode::Queued
        } else {
            DispatchMode::Sync
        }
    }

    /// Link that consumes `token` when visited
    pub fn verification_link(&self, token: &str) -> String {
        let mut link = self.base_url.clone();
        link.query_pairs_mut().append_pair("token", token);
        link.to_string()
    }

    fn build_message(&self, address: &str, token: &str) -> OutboundMessage {
        let expiry = match self.token_expiry_minutes {
            Some(minutes) => format!("This link will expire in {} minutes.\n\n", minutes),
            None => String::new(),
        };

        let body = format!(
            r#"Hello,

Please confirm that {} is your email address by opening the link below:

{}

{}If you did not request this, you can safely ignore this email.
"#,
            address,
            self.verification_link(token),
            expiry
        );

        OutboundMessage {
            to: address.to_string(),
            subject: self.subject.clone(),
            body,
        }
    }

    /// Deliver (or schedule) the verification message for `address`
    pub async fn notify(&self, address: &str, token: &str) -> DispatchOutcome {
        let message = self.build_message(address, token);

        let Some(queue) = &self.queue else {
            return match self.dispatcher.send(&message.to, &message.subject, &message.body).await {
                Ok(()) => DispatchOutcome::Sent,
                Err(VerifyError::DispatchFailed(reason)) => DispatchOutcome::Failed { reason },
                Err(e) => DispatchOutcome::Failed { reason: e.to_string() },
            };
        };

        let tx = queue.tx.lock().ok().and_then(|tx| tx.clone());
        let Some(tx) = tx else {
            return DispatchOutcome::Failed {
                reason: "dispatch queue is closed".to_string(),
            };
        };

        match tx.try_send(message) {
            Ok(()) => {
                debug!("Queued verification email for {}", address);
                DispatchOutcome::Scheduled
            }
            Err(TrySendError::Full(_)) => {
                warn!("Dispatch queue full, dropping verification email for {}", address);
                DispatchOutcome::Failed {
                    reason: "dispatch queue is full".to_string(),
                }
            }
            Err(TrySendError::Closed(_)) => DispatchOutcome::Failed {
                reason: "dispatch queue is closed".to_string(),
            },
        }
    }

    /// Close the queue and wait for already scheduled messages to go out
    pub async fn shutdown(&self) {
        let Some(queue) = &self.queue else {
            return;
        };

        drop(queue.tx.lock().ok().and_then(|mut tx| tx.take()));
        let worker = queue.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Dispatch worker ended abnormally: {}", e);
            }
        }
        info!("Dispatch queue drained");
    }
}

fn parse_base_url(base_url: &str) -> VerifyResult<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| VerifyError::Internal(anyhow::anyhow!("Invalid base URL {}: {}", base_url, e)))?;

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    url.join("verify")
        .map_err(|e| VerifyError::Internal(anyhow::anyhow!("Invalid base URL {}: {}", base_url, e)))
}

async fn run_worker(dispatcher: Arc<dyn MailDispatcher>, mut rx: mpsc::Receiver<OutboundMessage>) {
    while let Some(message) = rx.recv().await {
        match dispatcher.send(&message.to, &message.subject, &message.body).await {
            Ok(()) => debug!("Background dispatch to {} succeeded", message.to),
            Err(e) => warn!("Background dispatch to {} failed: {}", message.to, e),
        }
    }
    debug!("Dispatch queue closed");
}
