//! Email address validation: syntax plus optional DNS deliverability.

use crate::error::{VerifyError, VerifyResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    proto::op::ResponseCode,
    TokioAsyncResolver,
};

/// An address that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedAddress {
    /// Trimmed address with a lowercased domain
    pub address: String,
    /// Whether DNS confirmed that the domain accepts mail
    pub deliverability_checked: bool,
}

/// Checks an address and returns its normalized form.
///
/// Failures are reported as [`VerifyError::ValidationFailed`] carrying a
/// human-readable reason.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailValidator: Send + Sync {
    async fn check(&self, address: &str) -> VerifyResult<CheckedAddress>;
}

/// Validate syntax and return the normalized address.
///
/// The domain is lowercased; the local part keeps its case since mail
/// servers may treat it case-sensitively.
pub fn normalize(raw: &str) -> VerifyResult<String> {
    let address = raw.trim();

    if address.is_empty() {
        return Err(VerifyError::ValidationFailed(
            "The email address is empty.".to_string(),
        ));
    }

    if address.matches('@').count() != 1 {
        return Err(VerifyError::ValidationFailed(
            "The email address is not valid. It must have exactly one @-sign.".to_string(),
        ));
    }

    let (local, domain) = address.rsplit_once('@').unwrap_or((address, ""));
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(VerifyError::ValidationFailed(
            "The part after the @-sign is not valid. It should have a period.".to_string(),
        ));
    }

    if !validator::validate_email(address) {
        return Err(VerifyError::ValidationFailed(
            "The email address is not valid.".to_string(),
        ));
    }

    Ok(format!("{}@{}", local, domain.to_lowercase()))
}

fn domain_of(address: &str) -> &str {
    address.rsplit_once('@').map(|(_, domain)| domain).unwrap_or("")
}

/// A single MX answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: String,
}

impl MxRecord {
    pub fn new(preference: u16, exchange: impl Into<String>) -> Self {
        Self {
            preference,
            exchange: exchange.into(),
        }
    }

    /// RFC 7505 null MX: the domain accepts no mail
    pub fn is_null(&self) -> bool {
        self.exchange.is_empty() || self.exchange == "."
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// NXDOMAIN
    NoSuchDomain,
    /// The name exists but has no records of the requested type
    NoRecords,
    /// Timeouts, SERVFAIL, unreachable nameservers
    Transient(String),
}

impl From<ResolveError> for LookupError {
    fn from(err: ResolveError) -> Self {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                if *response_code == ResponseCode::NXDomain {
                    LookupError::NoSuchDomain
                } else {
                    LookupError::NoRecords
                }
            }
            _ => LookupError::Transient(err.to_string()),
        }
    }
}

/// DNS queries needed for the deliverability check
#[async_trait]
pub trait DomainLookup: Send + Sync {
    async fn mx_records(&self, domain: &str) -> Result<Vec<MxRecord>, LookupError>;

    /// Whether the domain has at least one A or AAAA record
    async fn has_address(&self, domain: &str) -> Result<bool, LookupError>;
}

#[async_trait]
impl DomainLookup for TokioAsyncResolver {
    async fn mx_records(&self, domain: &str) -> Result<Vec<MxRecord>, LookupError> {
        // Fully qualified so that resolver search domains are not appended
        let lookup = self.mx_lookup(format!("{}.", domain).as_str()).await?;
        Ok(lookup
            .iter()
            .map(|mx| {
                let exchange = if mx.exchange().is_root() {
                    String::new()
                } else {
                    mx.exchange().to_utf8()
                };
                MxRecord::new(mx.preference(), exchange)
            })
            .collect())
    }

    async fn has_address(&self, domain: &str) -> Result<bool, LookupError> {
        let lookup = self.lookup_ip(format!("{}.", domain).as_str()).await?;
        Ok(lookup.iter().next().is_some())
    }
}

/// Validator used in production: syntax check, then (optionally) confirms
/// the domain publishes MX records, falling back to A/AAAA.
pub struct DnsValidator {
    lookup: Option<Arc<dyn DomainLookup>>,
}

impl DnsValidator {
    /// Syntax checks only; never touches the network
    pub fn syntax_only() -> Self {
        Self { lookup: None }
    }

    /// Syntax plus deliverability using the system resolver configuration
    pub fn with_system_resolver() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!("Failed to read system resolver configuration ({}), using defaults", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self::with_lookup(Arc::new(resolver))
    }

    pub fn with_lookup(lookup: Arc<dyn DomainLookup>) -> Self {
        Self { lookup: Some(lookup) }
    }

    pub fn new(check_deliverability: bool) -> Self {
        if check_deliverability {
            Self::with_system_resolver()
        } else {
            Self::syntax_only()
        }
    }

    /// `Ok(true)` when DNS confirms mail is accepted, `Ok(false)` when the
    /// resolver could not answer and the address is let through unchecked.
    async fn check_deliverability(lookup: &dyn DomainLookup, domain: &str) -> VerifyResult<bool> {
        match lookup.mx_records(domain).await {
            Ok(records) if !records.is_empty() => {
                if records.iter().all(MxRecord::is_null) {
                    return Err(does_not_accept_email(domain));
                }
                debug!("Domain {} has MX records", domain);
                return Ok(true);
            }
            Ok(_) | Err(LookupError::NoRecords) => {}
            Err(LookupError::NoSuchDomain) => return Err(does_not_exist(domain)),
            Err(LookupError::Transient(reason)) => {
                warn!("MX lookup for {} failed ({}), deliverability unknown", domain, reason);
                return Ok(false);
            }
        }

        match lookup.has_address(domain).await {
            Ok(true) => {
                debug!("Domain {} has no MX records but resolves to an address", domain);
                Ok(true)
            }
            Ok(false) | Err(LookupError::NoRecords) => Err(does_not_accept_email(domain)),
            Err(LookupError::NoSuchDomain) => Err(does_not_exist(domain)),
            Err(LookupError::Transient(reason)) => {
                warn!("Address lookup for {} failed ({}), deliverability unknown", domain, reason);
                Ok(false)
            }
        }
    }
}

fn does_not_accept_email(domain: &str) -> VerifyError {
    VerifyError::ValidationFailed(format!("The domain name {} does not accept email.", domain))
}

fn does_not_exist(domain: &str) -> VerifyError {
    VerifyError::ValidationFailed(format!("The domain name {} does not exist.", domain))
}

#[async_trait]
impl EmailValidator for DnsValidator {
    async fn check(&self, address: &str) -> VerifyResult<CheckedAddress> {
        let address = normalize(address)?;

        let deliverability_checked = match &self.lookup {
            Some(lookup) => Self::check_deliverability(lookup.as_ref(), domain_of(&address)).await?,
            None => false,
        };

        Ok(CheckedAddress {
            address,
            deliverability_checked,
        })
    }
}
