//! Delivery planning: who to connect to, in which order, for which
//! recipients.

use std::sync::Arc;

use courier_common::{internal, tracing};
use thiserror::Error;

use crate::{
    ClientTimeouts, Credentials, DEFAULT_SMTP_PORT, MxCache,
    error::{CandidateFailure, DeliveryError},
    session::{SessionRequest, Transport},
};

/// A recipient address without an `@domain` part.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("recipient {0:?} has no domain part")]
pub struct MissingDomain(pub String);

/// Recipients partitioned by their (lower-cased) domain.
///
/// Domains keep the order in which they first appear; recipients keep their
/// configured order within a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainGroups {
    groups: Vec<(String, Vec<String>)>,
}

impl DomainGroups {
    /// Groups `recipients` by domain.
    ///
    /// # Errors
    ///
    /// Returns [`MissingDomain`] for an address without a domain.
    pub fn partition(recipients: &[String]) -> Result<Self, MissingDomain> {
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();

        for recipient in recipients {
            let domain = recipient
                .rsplit_once('@')
                .map(|(_, domain)| domain.trim())
                .filter(|domain| !domain.is_empty())
                .ok_or_else(|| MissingDomain(recipient.clone()))?
                .to_ascii_lowercase();

            match groups.iter_mut().find(|(existing, _)| *existing == domain) {
                Some((_, members)) => members.push(recipient.clone()),
                None => groups.push((domain, vec![recipient.clone()])),
            }
        }

        Ok(Self { groups })
    }

    /// `(domain, recipients)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.groups
            .iter()
            .map(|(domain, recipients)| (domain.as_str(), recipients.as_slice()))
    }

    /// Recipients for `domain`.
    #[must_use]
    pub fn get(&self, domain: &str) -> Option<&[String]> {
        self.iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(domain))
            .map(|(_, recipients)| recipients)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Where mail goes. Chosen once, when the engine is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTarget {
    /// Every message goes to one relay, optionally authenticated.
    Fixed {
        server: String,
        credentials: Option<Credentials>,
    },
    /// Each recipient domain is delivered to its own mail exchangers.
    PerDomain { groups: DomainGroups, port: u16 },
}

impl RelayTarget {
    /// A fixed relay at `address`, with port 25 appended when missing.
    #[must_use]
    pub fn fixed(address: &str, credentials: Option<Credentials>) -> Self {
        Self::Fixed {
            server: with_default_port(address),
            credentials,
        }
    }

    /// Per-domain delivery to port 25 of each exchanger.
    ///
    /// # Errors
    ///
    /// Returns [`MissingDomain`] for an address without a domain.
    pub fn per_domain(recipients: &[String]) -> Result<Self, MissingDomain> {
        Ok(Self::PerDomain {
            groups: DomainGroups::partition(recipients)?,
            port: DEFAULT_SMTP_PORT,
        })
    }
}

/// Appends `:25` to an address that carries no port.
fn with_default_port(address: &str) -> String {
    let address = address.trim();
    let has_port = if let Some(rest) = address.strip_prefix('[') {
        rest.contains("]:")
    } else {
        address.contains(':')
    };

    if has_port {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_SMTP_PORT}")
    }
}

/// Drives sessions for one engine's destination set.
pub struct DeliveryPlanner {
    target: RelayTarget,
    from: String,
    recipients: Vec<String>,
    cache: Arc<MxCache>,
    transport: Arc<dyn Transport>,
    timeouts: ClientTimeouts,
}

impl std::fmt::Debug for DeliveryPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPlanner")
            .field("target", &self.target)
            .field("from", &self.from)
            .field("recipients", &self.recipients)
            .finish_non_exhaustive()
    }
}

impl DeliveryPlanner {
    #[must_use]
    pub fn new(
        target: RelayTarget,
        from: impl Into<String>,
        recipients: Vec<String>,
        cache: Arc<MxCache>,
        transport: Arc<dyn Transport>,
        timeouts: ClientTimeouts,
    ) -> Self {
        Self {
            target,
            from: from.into(),
            recipients,
            cache,
            transport,
            timeouts,
        }
    }

    /// Startup self-test: the full delivery plan without DATA.
    ///
    /// # Errors
    ///
    /// Same as [`DeliveryPlanner::deliver`].
    pub async fn probe(&self) -> Result<(), DeliveryError> {
        self.execute(None).await
    }

    /// Delivers `body` to the whole destination set.
    ///
    /// In per-domain mode the domains are delivered one after another and
    /// the first failing domain ends the attempt. Domains handled before it
    /// have already received the message; the error does not say which.
    ///
    /// # Errors
    ///
    /// Returns the first domain (or the relay) that could not be delivered.
    pub async fn deliver(&self, body: &[u8]) -> Result<(), DeliveryError> {
        self.execute(Some(body)).await
    }

    async fn execute(&self, body: Option<&[u8]>) -> Result<(), DeliveryError> {
        let connect_timeout = self.timeouts.connect(body.is_none());

        match &self.target {
            RelayTarget::Fixed {
                server,
                credentials,
            } => {
                let request = SessionRequest {
                    server,
                    credentials: credentials.as_ref(),
                    from: &self.from,
                    recipients: &self.recipients,
                    body,
                    connect_timeout,
                };
                self.attempt(&request)
                    .await
                    .map_err(|source| DeliveryError::Relay {
                        from: self.from.clone(),
                        recipients: self.recipients.clone(),
                        server: server.clone(),
                        source,
                    })
            }
            RelayTarget::PerDomain { groups, port } => {
                for (domain, recipients) in groups.iter() {
                    self.deliver_domain(domain, recipients, *port, body, connect_timeout)
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn attempt(
        &self,
        request: &SessionRequest<'_>,
    ) -> Result<(), crate::error::SessionError> {
        let mode = if request.is_probe() { "test sending" } else { "sending" };
        tracing::info!(
            server = %request.server,
            recipients = ?request.recipients,
            "{mode} with {} to {:?}",
            request.server,
            request.recipients
        );
        let result = self.transport.deliver(request).await;
        match &result {
            Ok(()) => tracing::info!(server = %request.server, "{mode} result: ok"),
            Err(e) => tracing::warn!(server = %request.server, "{mode} result: {e}"),
        }
        result
    }

    #[tracing::instrument(level = "debug", skip(self, recipients, body, connect_timeout))]
    async fn deliver_domain(
        &self,
        domain: &str,
        recipients: &[String],
        port: u16,
        body: Option<&[u8]>,
        connect_timeout: std::time::Duration,
    ) -> Result<(), DeliveryError> {
        let servers =
            self.cache
                .get_or_resolve(domain)
                .await
                .map_err(|source| DeliveryError::Resolution {
                    domain: domain.to_string(),
                    source,
                })?;

        let mut attempts = Vec::new();
        for server in servers.iter() {
            let address = server.address(port);
            let request = SessionRequest {
                server: &address,
                credentials: None,
                from: &self.from,
                recipients,
                body,
                connect_timeout,
            };

            match self.attempt(&request).await {
                Ok(()) => {
                    internal!(
                        "Delivered to {:?} via {} after {} failed attempt(s)",
                        recipients,
                        address,
                        attempts.len()
                    );
                    return Ok(());
                }
                Err(error) => attempts.push(CandidateFailure {
                    server: address,
                    error,
                }),
            }
        }

        Err(DeliveryError::AllCandidatesFailed {
            domain: domain.to_string(),
            from: self.from.clone(),
            recipients: recipients.to_vec(),
            candidates: servers.iter().map(|server| server.host.clone()).collect(),
            attempts,
        })
    }
}
