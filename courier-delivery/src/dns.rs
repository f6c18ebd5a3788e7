//! MX resolution for mail delivery.
//!
//! # Caching Strategy
//!
//! - **No expiry**: the first successful answer for a domain is kept for the
//!   life of the process; exchanger sets are assumed stable.
//! - **Failures are not cached**: a later call retries the lookup.
//! - **One lock**: every get-or-resolve holds a single mutex across all
//!   domains, including while the lookup itself is in flight.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::tracing::{debug, warn};
use hickory_resolver::{
    TokioResolver,
    config::ResolverOpts,
    name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors that can occur during DNS resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The domain has no usable mail exchangers.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// Lookup failed for a reason reported by a non-hickory resolver.
    #[error("DNS lookup failed for {domain}: {reason}")]
    Other { domain: String, reason: String },
}

/// Configuration for DNS resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Treat a domain without MX records as its own exchanger (RFC 5321
    /// section 5.1). Off by default: such a domain fails to resolve.
    #[serde(default)]
    pub implicit_mx: bool,
}

const fn default_timeout_secs() -> u64 {
    5
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            implicit_mx: false,
        }
    }
}

/// A mail exchanger and its MX preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    /// Host name, without the trailing root dot.
    pub host: String,
    /// MX priority (lower value = higher priority). 0 for an implicit MX.
    pub priority: u16,
}

impl MailServer {
    #[must_use]
    pub fn new(host: impl Into<String>, priority: u16) -> Self {
        Self {
            host: host.into(),
            priority,
        }
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self, port: u16) -> String {
        if self.host.contains(':') {
            format!("[{}]:{port}", self.host)
        } else {
            format!("{}:{port}", self.host)
        }
    }
}

/// A source of MX answers.
///
/// Implementations return exchangers in the order the resolver reported
/// them; [`MxCache`] does the priority ordering.
#[async_trait]
pub trait MxLookup: Send + Sync {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MailServer>, DnsError>;
}

/// [`MxLookup`] backed by the system resolver configuration.
#[derive(Debug)]
pub struct HickoryLookup {
    resolver: TokioResolver,
    implicit_mx: bool,
}

impl HickoryLookup {
    /// Creates a lookup using the system DNS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            implicit_mx: config.implicit_mx,
        })
    }

    fn implicit(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        if self.implicit_mx {
            debug!("No MX records for {domain}, using the domain itself");
            Ok(vec![MailServer::new(domain, 0)])
        } else {
            Err(DnsError::NoMailServers(domain.to_string()))
        }
    }
}

#[async_trait]
impl MxLookup for HickoryLookup {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx_lookup) => {
                let servers: Vec<MailServer> = mx_lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        let host = host.trim_end_matches('.');
                        debug!("Found MX record: {host} (priority: {})", mx.preference());
                        MailServer::new(host, mx.preference())
                    })
                    .filter(|server| !server.host.is_empty())
                    .collect();

                if servers.is_empty() {
                    self.implicit(domain)
                } else {
                    Ok(servers)
                }
            }
            Err(err) if err.is_no_records_found() => self.implicit(domain),
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }
}

/// Process-wide MX cache.
///
/// Build one per process and hand an `Arc` of it to every engine.
pub struct MxCache {
    lookup: Box<dyn MxLookup>,
    entries: Mutex<HashMap<String, Arc<Vec<MailServer>>>>,
}

impl std::fmt::Debug for MxCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MxCache").finish_non_exhaustive()
    }
}

impl MxCache {
    /// Creates a cache in front of the system resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver cannot be initialized.
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        Ok(Self::with_lookup(HickoryLookup::new(config)?))
    }

    /// Creates a cache in front of any [`MxLookup`].
    pub fn with_lookup(lookup: impl MxLookup + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the exchangers for `domain`, ordered by priority with ties in
    /// resolver order, resolving and caching them on first use.
    ///
    /// # Errors
    ///
    /// Returns the lookup error; nothing is cached in that case.
    pub async fn get_or_resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        let key = domain.to_ascii_lowercase();
        let mut entries = self.entries.lock().await;

        if let Some(servers) = entries.get(&key) {
            debug!("Cache hit for {key}, {} server(s)", servers.len());
            return Ok(Arc::clone(servers));
        }

        let mut servers = self.lookup.lookup_mx(&key).await?;
        if servers.is_empty() {
            return Err(DnsError::NoMailServers(key));
        }
        servers.sort_by_key(|server| server.priority);

        let servers = Arc::new(servers);
        entries.insert(key.clone(), Arc::clone(&servers));
        debug!("Cached {} server(s) for {key}", servers.len());

        Ok(servers)
    }

    /// The cached exchangers for `domain`, without resolving.
    pub async fn cached(&self, domain: &str) -> Option<Arc<Vec<MailServer>>> {
        self.entries
            .lock()
            .await
            .get(&domain.to_ascii_lowercase())
            .cloned()
    }

    /// Number of cached domains.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
