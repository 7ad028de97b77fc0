//! Main entry point for the verification server.

use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use verimail::{
    config::{DispatchMode, MailTransport, StorageBackend, VerimailConfig},
    http::start_server,
};

const DEFAULT_CONFIG_PATH: &str = "verimail-config.toml";

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let matches = cli().get_matches();
    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    if matches.get_flag("generate-config") {
        return match generate_config(config_path) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Failed to write {}: {}", config_path, e);
                ExitCode::FAILURE
            }
        };
    }

    info!("Starting verimail v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(config_path).and_then(|config| {
        config.validate()?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration in {}: {}", config_path, e);
            error!("Use --generate-config to create a default configuration file");
            return ExitCode::from(2);
        }
    };

    for line in startup_summary(&config) {
        info!("{}", line);
    }
    if config.mail.transport == MailTransport::Console {
        warn!("Console transport: verification links are only written to the log");
    }

    match start_server(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn cli() -> Command {
    Command::new("verimail")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Email address verification server - issues single-use links and records verified addresses")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file (overridable with VERIMAIL__SECTION__KEY variables)")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a default configuration file and exit")
                .action(ArgAction::SetTrue),
        )
}

/// Load configuration from file
fn load_config(path: &str) -> Result<VerimailConfig> {
    if !Path::new(path).exists() {
        return Err(anyhow::anyhow!(
            "Configuration file '{}' not found. Use --generate-config to create one.",
            path
        ));
    }

    Ok(VerimailConfig::from_file(path)?)
}

/// What the server is about to do, one line per concern
fn startup_summary(config: &VerimailConfig) -> Vec<String> {
    let transport = match config.mail.transport {
        MailTransport::Smtp => format!(
            "SMTP via {}:{} ({})",
            config.smtp.server,
            config.smtp.port,
            if config.smtp.starttls { "STARTTLS" } else { "implicit TLS" }
        ),
        MailTransport::Console => "console".to_string(),
    };
    let dispatch = match config.mail.dispatch_mode {
        DispatchMode::Sync => "sync dispatch".to_string(),
        DispatchMode::Queued => format!("queued dispatch, capacity {}", config.mail.queue_capacity),
    };
    let storage = match config.storage.backend {
        StorageBackend::Memory => "in-memory (records are lost on restart)".to_string(),
        StorageBackend::Sqlite => format!("sqlite at {}", config.storage.path),
    };
    let expiry = match config.verification.token_expiry_minutes {
        0 => "tokens never expire".to_string(),
        minutes => format!(
            "tokens expire after {} minutes, purged every {} minutes",
            minutes, config.verification.cleanup_interval_minutes
        ),
    };

    vec![
        format!("Listening on {}:{}", config.http.bind_address, config.http.port),
        format!("Verification links: {}/verify?token=...", config.verification.base_url.trim_end_matches('/')),
        format!(
            "Address checks: {}",
            if config.verification.check_deliverability { "syntax + MX" } else { "syntax only" }
        ),
        format!("Mail: {}, {}", transport, dispatch),
        format!("Storage: {}", storage),
        format!("Expiry: {}", expiry),
    ]
}

/// Generate a default configuration file
fn generate_config(path: &str) -> Result<()> {
    VerimailConfig::default().save_to_file(path)?;

    println!("Generated default configuration file: {}", path);
    println!();
    println!("Before starting the server:");
    println!("1. Configure your SMTP settings (smtp section), or set mail.transport = \"console\"");
    println!("2. Set the public base URL used in verification links (verification.base_url)");
    println!("3. Choose a storage backend (storage section)");
    println!();
    println!("Then run: verimail --config {}", path);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::Builder;

    #[test]
    fn test_generate_and_load_config() -> Result<()> {
        let temp_file = Builder::new().suffix(".toml").tempfile()?;
        let temp_path = temp_file.path().to_str().unwrap();

        generate_config(temp_path)?;
        let config = load_config(temp_path)?;

        assert_eq!(config.http.port, 3030);
        assert_eq!(config.verification.token_expiry_minutes, 1440);

        // Default config should fail validation (missing real credentials)
        assert!(config.validate().is_err());

        Ok(())
    }

    #[test]
    fn test_load_nonexistent_config() {
        let result = load_config("nonexistent-file.toml");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not found"));
    }

    #[test]
    fn test_cli_defaults_and_flags() {
        let matches = cli().try_get_matches_from(["verimail"]).unwrap();
        assert_eq!(matches.get_one::<String>("config").unwrap(), DEFAULT_CONFIG_PATH);
        assert!(!matches.get_flag("generate-config"));

        let matches = cli()
            .try_get_matches_from(["verimail", "-c", "custom.toml", "--generate-config"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("config").unwrap(), "custom.toml");
        assert!(matches.get_flag("generate-config"));
    }

    #[test]
    fn test_startup_summary() {
        let mut config = VerimailConfig::default();
        config.verification.base_url = "https://verify.example.com/".to_string();

        let summary = startup_summary(&config);
        assert!(summary.contains(&"Verification links: https://verify.example.com/verify?token=...".to_string()));
        assert!(summary.contains(&"Address checks: syntax + MX".to_string()));
        assert!(summary.iter().any(|line| line.starts_with("Mail: SMTP via smtp.example.com:587 (STARTTLS)")));

        config.mail.transport = MailTransport::Console;
        config.storage.backend = StorageBackend::Memory;
        config.verification.token_expiry_minutes = 0;
        let summary = startup_summary(&config);
        assert!(summary.contains(&"Mail: console, queued dispatch, capacity 256".to_string()));
        assert!(summary.contains(&"Expiry: tokens never expire".to_string()));
        assert!(summary.iter().any(|line| line.starts_with("Storage: in-memory")));
    }
}
