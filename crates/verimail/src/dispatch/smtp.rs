//! SMTP dispatcher for production use.

use super::MailDispatcher;
use crate::config::SmtpConfig;
use crate::error::{VerifyError, VerifyResult};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use tracing::{debug, error, info};

/// Sends messages through an authenticated SMTP relay
#[derive(Debug)]
pub struct SmtpDispatcher {
    transport: SmtpTransport,
    from_address: Mailbox,
}

impl SmtpDispatcher {
    /// Create a new SMTP dispatcher
    pub fn new(config: &SmtpConfig) -> VerifyResult<Self> {
        let from_address: Mailbox = config.from_address.parse()
            .map_err(|e| VerifyError::Internal(anyhow::anyhow!("Invalid from address: {}", e)))?;

        let credentials = Credentials::new(config.username.clone(), config.password.clone());

        // Port 587 submission expects STARTTLS, 465 expects implicit TLS
        let builder = if config.starttls {
            SmtpTransport::starttls_relay(&config.server)
        } else {
            SmtpTransport::relay(&config.server)
        };

        let transport = builder
            .map_err(|e| VerifyError::Internal(anyhow::anyhow!("Failed to create SMTP transport: {}", e)))?
            .port(config.port)
            .credentials(credentials)
            .build();

        Ok(Self {
            transport,
            from_address,
        })
    }

    /// Test the SMTP connection
    pub async fn test_connection(&self) -> VerifyResult<()> {
        debug!("Testing SMTP connection");

        let transport = self.transport.clone();
        let result = tokio::task::spawn_blocking(move || transport.test_connection()).await
            .map_err(|e| VerifyError::Internal(anyhow::anyhow!("Task join error: {}", e)))?;

        match result {
            Ok(true) => {
                info!("SMTP connection test successful");
                Ok(())
            }
            Ok(false) => {
                error!("SMTP connection test failed");
                Err(VerifyError::DispatchFailed("SMTP connection test failed".to_string()))
            }
            Err(e) => {
                error!("SMTP connection error: {}", e);
                Err(VerifyError::DispatchFailed(e.to_string()))
            }
        }
    }

    fn build_message(&self, to: &str, subject: &str, body: &str) -> VerifyResult<Message> {
        let to_address: Mailbox = to.parse()
            .map_err(|e| VerifyError::DispatchFailed(format!("Invalid recipient address: {}", e)))?;

        Message::builder()
            .from(self.from_address.clone())
            .to(to_address)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| VerifyError::DispatchFailed(format!("Failed to build email: {}", e)))
    }
}

#[async_trait]
impl MailDispatcher for SmtpDispatcher {
    async fn send(&self, to: &str, subject: &str, body: &str) -> VerifyResult<()> {
        let email = self.build_message(to, subject, body)?;

        debug!("Sending verification email to: {}", to);

        // SmtpTransport is blocking; keep it off the async runtime threads
        let transport = self.transport.clone();
        let result = tokio::task::spawn_blocking(move || transport.send(&email)).await
            .map_err(|e| VerifyError::Internal(anyhow::anyhow!("Task join error: {}", e)))?;

        match result {
            Ok(response) => {
                info!("Successfully sent email to: {} (response: {:?})", to, response.code());
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", to, e);
                Err(VerifyError::DispatchFailed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_test_smtp_config() -> SmtpConfig {
        SmtpConfig {
            server: "smtp.example.com".to_string(),
            port: 587,
            username: "test@example.com".to_string(),
            password: "password".to_string(),
            from_address: "verify@example.com".to_string(),
            subject: "Verify your email address".to_string(),
            starttls: true,
        }
    }

    #[test]
    fn test_dispatcher_creation() {
        let config = get_test_smtp_config();
        assert!(SmtpDispatcher::new(&config).is_ok());

        let mut implicit_tls = config.clone();
        implicit_tls.starttls = false;
        implicit_tls.port = 465;
        assert!(SmtpDispatcher::new(&implicit_tls).is_ok());
    }

    #[test]
    fn test_dispatcher_creation_invalid_from() {
        let mut config = get_test_smtp_config();
        config.from_address = "invalid-email".to_string();

        assert!(SmtpDispatcher::new(&config).is_err());
    }

    #[test]
    fn test_build_message() {
        let dispatcher = SmtpDispatcher::new(&get_test_smtp_config()).unwrap();

        let message = dispatcher
            .build_message("user@example.com", "Subject", "Body text")
            .unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("To: user@example.com"));
        assert!(formatted.contains("Subject: Subject"));

        assert!(matches!(
            dispatcher.build_message("not an address", "Subject", "Body"),
            Err(VerifyError::DispatchFailed(_))
        ));
    }

    // Actual delivery needs real SMTP credentials and network access.
}
