//! Configuration management for the verification server.

use crate::error::VerifyResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Longest accepted token lifetime (one year)
pub const MAX_TOKEN_EXPIRY_MINUTES: u64 = 366 * 24 * 60;

/// Longest accepted interval between purges (one week)
pub const MAX_CLEANUP_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// Configuration for the verification server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerimailConfig {
    /// HTTP server configuration
    pub http: HttpConfig,

    /// SMTP email configuration
    pub smtp: SmtpConfig,

    /// Mail transport and dispatch mode
    pub mail: MailConfig,

    /// Token lifecycle and link configuration
    pub verification: VerificationConfig,

    /// Storage backend configuration
    pub storage: StorageConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Port to bind to
    pub port: u16,

    /// Address to bind to
    pub bind_address: String,
}

/// SMTP configuration for sending emails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server hostname
    pub server: String,

    /// SMTP server port
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Password for authentication
    pub password: String,

    /// From email address
    pub from_address: String,

    /// Email subject line
    pub subject: String,

    /// Upgrade a plain connection with STARTTLS instead of connecting with TLS
    #[serde(default = "default_starttls")]
    pub starttls: bool,
}

fn default_starttls() -> bool {
    true
}

/// Which transport delivers verification mail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailTransport {
    Smtp,
    Console,
}

/// Whether submissions wait for delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Await the dispatcher and report its result
    Sync,
    /// Hand the message to a background worker and report it as scheduled
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    pub transport: MailTransport,
    pub dispatch_mode: DispatchMode,
    /// Capacity of the background dispatch queue
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Public base URL of this service, used to build verification links
    pub base_url: String,

    /// Require the domain to publish MX (or A/AAAA) records
    pub check_deliverability: bool,

    /// Token lifetime in minutes, 0 for tokens that never expire
    pub token_expiry_minutes: u64,

    /// Interval between purges of expired pending records, in minutes
    pub cleanup_interval_minutes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Database file, used by the sqlite backend
    pub path: String,
}

impl Default for VerimailConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig {
                port: 3030,
                bind_address: "127.0.0.1".to_string(),
            },
            smtp: SmtpConfig {
                server: "smtp.example.com".to_string(),
                port: 587,
                username: "your_smtp_username".to_string(),
                password: "your_smtp_password".to_string(),
                from_address: "verify@example.com".to_string(),
                subject: "Verify your email address".to_string(),
                starttls: true,
            },
            mail: MailConfig {
                transport: MailTransport::Smtp,
                dispatch_mode: DispatchMode::Queued,
                queue_capacity: 256,
            },
            verification: VerificationConfig {
                base_url: "http://localhost:3030".to_string(),
                check_deliverability: true,
                token_expiry_minutes: 1440,
                cleanup_interval_minutes: 30,
            },
            storage: StorageConfig {
                backend: StorageBackend::Sqlite,
                path: "verimail.db".to_string(),
            },
        }
    }
}

impl VerimailConfig {
    /// Load configuration from a TOML file, with `VERIMAIL__SECTION__KEY`
    /// environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> VerifyResult<Self> {
        Self::load(path, environment())
    }

    fn load<P: AsRef<Path>>(path: P, env: config::Environment) -> VerifyResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(env)
            .build()?;

        Ok(settings.try_deserialize::<Self>()?)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mail.transport == MailTransport::Smtp {
            if self.smtp.username == "your_smtp_username" {
                return Err(anyhow::anyhow!("SMTP configuration must be set"));
            }

            if self.smtp.from_address.parse::<lettre::message::Mailbox>().is_err() {
                return Err(anyhow::anyhow!("SMTP from_address is not a valid mailbox"));
            }
        }

        let base_url = url::Url::parse(&self.verification.base_url)
            .map_err(|e| anyhow::anyhow!("Invalid verification base_url: {}", e))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow::anyhow!("Verification base_url must be an http(s) URL"));
        }

        if self.mail.dispatch_mode == DispatchMode::Queued && self.mail.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Dispatch queue capacity must be greater than 0"));
        }

        if self.verification.token_expiry_minutes > MAX_TOKEN_EXPIRY_MINUTES {
            return Err(anyhow::anyhow!(
                "Token expiry must be at most {} minutes",
                MAX_TOKEN_EXPIRY_MINUTES
            ));
        }

        if self.verification.token_expiry_minutes > 0 {
            if self.verification.cleanup_interval_minutes == 0 {
                return Err(anyhow::anyhow!("Cleanup interval must be greater than 0"));
            }
            if self.verification.cleanup_interval_minutes > MAX_CLEANUP_INTERVAL_MINUTES {
                return Err(anyhow::anyhow!(
                    "Cleanup interval must be at most {} minutes",
                    MAX_CLEANUP_INTERVAL_MINUTES
                ));
            }
        }

        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.is_empty() {
            return Err(anyhow::anyhow!("Storage path must be set for the sqlite backend"));
        }

        Ok(())
    }

    /// Token lifetime, `None` when expiry is disabled
    pub fn token_ttl(&self) -> Option<chrono::Duration> {
        match self.verification.token_expiry_minutes {
            0 => None,
            minutes => {
                let minutes = minutes.min(MAX_TOKEN_EXPIRY_MINUTES) as i64;
                chrono::Duration::try_minutes(minutes)
            }
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("VERIMAIL").separator("__")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> VerimailConfig {
        let mut config = VerimailConfig::default();
        config.smtp.username = "apikey".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = VerimailConfig::default();

        assert_eq!(config.http.port, 3030);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.smtp.port, 587);
        assert!(config.smtp.starttls);
        assert_eq!(config.mail.dispatch_mode, DispatchMode::Queued);
        assert_eq!(config.verification.token_expiry_minutes, 1440);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    }

    #[test]
    fn test_config_serialization() {
        let config = VerimailConfig::default();

        let serialized = toml::to_string(&config).unwrap();
        let deserialized: VerimailConfig = toml::from_str(&serialized).unwrap();

        assert_eq!(config.http.port, deserialized.http.port);
        assert_eq!(config.mail.transport, deserialized.mail.transport);
        assert_eq!(config.storage.path, deserialized.storage.path);
    }

    #[test]
    fn test_config_from_file() -> anyhow::Result<()> {
        let toml_content = r#"
[http]
port = 8080
bind_address = "0.0.0.0"

[smtp]
server = "smtp.sendgrid.net"
port = 465
username = "apikey"
password = "secret"
from_address = "verify@example.com"
subject = "Confirm your address"
starttls = false

[mail]
transport = "console"
dispatch_mode = "sync"
queue_capacity = 16

[verification]
base_url = "https://verify.example.com"
check_deliverability = false
token_expiry_minutes = 60
cleanup_interval_minutes = 5

[storage]
backend = "memory"
path = ""
"#;

        let temp_dir = tempfile::tempdir()?;
        let temp_path = temp_dir.path().join("test_config.toml");
        std::fs::write(&temp_path, toml_content)?;

        let config = VerimailConfig::from_file(&temp_path)?;

        assert_eq!(config.http.port, 8080);
        assert_eq!(config.http.bind_address, "0.0.0.0");
        assert!(!config.smtp.starttls);
        assert_eq!(config.mail.transport, MailTransport::Console);
        assert_eq!(config.mail.dispatch_mode, DispatchMode::Sync);
        assert_eq!(config.verification.base_url, "https://verify.example.com");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.validate().is_ok());

        Ok(())
    }

    #[test]
    fn test_config_validation() {
        // Should fail with default SMTP placeholders
        assert!(VerimailConfig::default().validate().is_err());

        let mut config = configured();
        assert!(config.validate().is_ok());

        config.verification.base_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = configured();
        config.mail.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = configured();
        config.storage.path = String::new();
        assert!(config.validate().is_err());

        let mut config = configured();
        config.verification.token_expiry_minutes = u64::MAX;
        assert!(config.validate().is_err());
        config.verification.token_expiry_minutes = MAX_TOKEN_EXPIRY_MINUTES;
        assert!(config.validate().is_ok());

        let mut config = configured();
        config.verification.cleanup_interval_minutes = u64::MAX;
        assert!(config.validate().is_err());

        // The cleanup interval is unused when expiry is off
        config.verification.token_expiry_minutes = 0;
        assert!(config.validate().is_ok());

        // Console transport does not need SMTP credentials
        let mut config = VerimailConfig::default();
        config.mail.transport = MailTransport::Console;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_token_ttl() {
        let mut config = VerimailConfig::default();
        assert_eq!(config.token_ttl(), Some(chrono::Duration::minutes(1440)));

        config.verification.token_expiry_minutes = 0;
        assert_eq!(config.token_ttl(), None);

        config.verification.token_expiry_minutes = u64::MAX;
        let ttl = config.token_ttl().unwrap();
        assert_eq!(ttl, chrono::Duration::minutes(MAX_TOKEN_EXPIRY_MINUTES as i64));
        assert!(ttl > chrono::Duration::zero());
    }

    #[test]
    fn test_environment_overrides_file() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let temp_path = temp_dir.path().join("env_config.toml");
        configured().save_to_file(&temp_path)?;

        let overrides = std::collections::HashMap::from([
            ("VERIMAIL__HTTP__PORT".to_string(), "8181".to_string()),
            ("VERIMAIL__MAIL__DISPATCH_MODE".to_string(), "sync".to_string()),
            (
                "VERIMAIL__VERIFICATION__BASE_URL".to_string(),
                "https://verify.example.org".to_string(),
            ),
            ("UNRELATED__HTTP__PORT".to_string(), "1".to_string()),
        ]);
        let config = VerimailConfig::load(&temp_path, environment().source(Some(overrides)))?;

        assert_eq!(config.http.port, 8181);
        assert_eq!(config.mail.dispatch_mode, DispatchMode::Sync);
        assert_eq!(config.verification.base_url, "https://verify.example.org");
        // Untouched keys still come from the file
        assert_eq!(config.smtp.username, "apikey");
        assert_eq!(config.http.bind_address, "127.0.0.1");

        Ok(())
    }

    #[test]
    fn test_malformed_file_is_config_error() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let temp_path = temp_dir.path().join("broken.toml");
        std::fs::write(&temp_path, "[http]\nport = \"not a number\"\n")?;

        let result = VerimailConfig::from_file(&temp_path);
        assert!(matches!(result, Err(crate::error::VerifyError::Config(_))));

        Ok(())
    }

    #[test]
    fn test_save_and_load_config() -> anyhow::Result<()> {
        let mut config = configured();
        config.http.port = 8080;

        let temp_dir = tempfile::tempdir()?;
        let temp_path = temp_dir.path().join("test_save_config.toml");
        config.save_to_file(&temp_path)?;

        let loaded_config = VerimailConfig::from_file(&temp_path)?;

        assert_eq!(config.http.port, loaded_config.http.port);
        assert_eq!(config.smtp.username, loaded_config.smtp.username);
        assert_eq!(config.mail.dispatch_mode, loaded_config.mail.dispatch_mode);

        Ok(())
    }
}
