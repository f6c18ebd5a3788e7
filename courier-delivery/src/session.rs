//! One SMTP conversation with one server.
//!
//! A session connects, greets, upgrades to TLS when offered, authenticates
//! when configured and offered, declares the envelope and, unless it is a
//! probe, transmits the message. The first failing step ends the session.
//! Trying another server is the planner's job.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use courier_common::{TlsConfig, internal, tracing};
use courier_smtp::{ClientError, Extensions, Mechanism, SmtpClient, client::is_local_host};

use crate::{ClientTimeouts, Credentials, error::SessionError};

/// Everything a single session needs to know.
#[derive(Debug, Clone, Copy)]
pub struct SessionRequest<'a> {
    /// `host:port` to connect to.
    pub server: &'a str,
    pub credentials: Option<&'a Credentials>,
    pub from: &'a str,
    pub recipients: &'a [String],
    /// The message. `None` makes this a probe: the envelope is negotiated
    /// and the session ends without DATA.
    pub body: Option<&'a [u8]>,
    pub connect_timeout: Duration,
}

impl SessionRequest<'_> {
    #[must_use]
    pub const fn is_probe(&self) -> bool {
        self.body.is_none()
    }

    /// The host part of `server`, used for TLS name checks and to decide
    /// whether credentials may be sent in the clear.
    #[must_use]
    pub fn host(&self) -> &str {
        host_of(self.server)
    }
}

fn host_of(server: &str) -> &str {
    let host = server
        .rsplit_once(':')
        .filter(|(_, port)| port.parse::<u16>().is_ok())
        .map_or(server, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Something that can run a session against one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs one session.
    ///
    /// # Errors
    ///
    /// Returns the first step that failed.
    async fn deliver(&self, request: &SessionRequest<'_>) -> Result<(), SessionError>;
}

/// [`Transport`] speaking SMTP over TCP.
#[derive(Debug, Clone)]
pub struct SmtpSession {
    helo_name: String,
    tls: TlsConfig,
    timeouts: ClientTimeouts,
}

impl Default for SmtpSession {
    fn default() -> Self {
        Self::new("localhost", TlsConfig::default(), ClientTimeouts::default())
    }
}

async fn timed<T>(
    duration: Duration,
    step: &str,
    fut: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| ClientError::Timeout(step.to_string(), duration))?
}

impl SmtpSession {
    #[must_use]
    pub fn new(helo_name: impl Into<String>, tls: TlsConfig, timeouts: ClientTimeouts) -> Self {
        Self {
            helo_name: helo_name.into(),
            tls,
            timeouts,
        }
    }

    #[must_use]
    pub const fn timeouts(&self) -> &ClientTimeouts {
        &self.timeouts
    }

    /// Reads the greeting and introduces ourselves. Servers that refuse
    /// EHLO get HELO and are assumed to offer no extensions.
    async fn handshake(&self, client: &mut SmtpClient) -> Result<Extensions, ClientError> {
        let timeout = Duration::from_secs(self.timeouts.ehlo_secs);
        timed(timeout, "greeting", client.read_greeting()).await?;

        match timed(timeout, "EHLO", client.ehlo(&self.helo_name)).await {
            Ok(response) => Ok(response.extensions()),
            Err(ClientError::SmtpError { code, .. }) if (500..600).contains(&code) => {
                tracing::debug!(code, "EHLO refused, falling back to HELO");
                timed(timeout, "HELO", client.helo(&self.helo_name)).await?;
                Ok(Extensions::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Upgrades via STARTTLS and re-issues EHLO, returning the extensions
    /// advertised over the encrypted channel.
    async fn starttls(&self, client: &mut SmtpClient) -> Result<Extensions, ClientError> {
        let timeout = Duration::from_secs(self.timeouts.starttls_secs);
        timed(timeout, "STARTTLS", client.starttls()).await?;

        let ehlo_timeout = Duration::from_secs(self.timeouts.ehlo_secs);
        let response = timed(
            ehlo_timeout,
            "EHLO after STARTTLS",
            client.ehlo(&self.helo_name),
        )
        .await?;

        Ok(response.extensions())
    }

    async fn authenticate(
        &self,
        client: &mut SmtpClient,
        host: &str,
        extensions: &Extensions,
        credentials: &Credentials,
    ) -> Result<(), ClientError> {
        if !client.is_tls() && !is_local_host(host) {
            return Err(ClientError::AuthError(format!(
                "refusing to send credentials to {host} over an unencrypted connection"
            )));
        }

        let mechanism = Mechanism::preferred(&extensions.auth_mechanisms()).ok_or_else(|| {
            ClientError::AuthError(format!(
                "no supported mechanism among {:?}",
                extensions.params("AUTH").unwrap_or_default()
            ))
        })?;

        let timeout = Duration::from_secs(self.timeouts.auth_secs);
        timed(
            timeout,
            "AUTH",
            client.auth(mechanism, &credentials.username, &credentials.password),
        )
        .await?;

        Ok(())
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(server = %request.server, probe = request.is_probe())
    )]
    async fn run(&self, request: &SessionRequest<'_>) -> Result<(), SessionError> {
        let server = request.server.to_string();
        let host = request.host();

        let mut client = SmtpClient::connect(request.server, host, request.connect_timeout)
            .await
            .map_err(|source| SessionError::Connect {
                server: server.clone(),
                source,
            })?
            .accept_invalid_certs(self.tls.accepts_invalid_certs());

        let mut extensions =
            self.handshake(&mut client)
                .await
                .map_err(|source| SessionError::Handshake {
                    server: server.clone(),
                    source,
                })?;

        if extensions.supports("STARTTLS") {
            extensions =
                self.starttls(&mut client)
                    .await
                    .map_err(|source| SessionError::Tls {
                        server: server.clone(),
                        source,
                    })?;
            internal!("TLS negotiated with {}", server);
        }

        if let Some(credentials) = request.credentials {
            if extensions.supports("AUTH") {
                self.authenticate(&mut client, host, &extensions, credentials)
                    .await
                    .map_err(|source| SessionError::Auth {
                        server: server.clone(),
                        source,
                    })?;
            } else {
                tracing::warn!(
                    server = %server,
                    username = %credentials.username,
                    "Server does not advertise AUTH, continuing unauthenticated"
                );
            }
        }

        let params: &[&str] = if request.body.is_some() && extensions.supports("8BITMIME") {
            &["BODY=8BITMIME"]
        } else {
            &[]
        };
        timed(
            Duration::from_secs(self.timeouts.mail_from_secs),
            "MAIL FROM",
            client.mail_from(request.from, params),
        )
        .await
        .map_err(|source| SessionError::Envelope {
            server: server.clone(),
            address: request.from.to_string(),
            source,
        })?;

        let rcpt_timeout = Duration::from_secs(self.timeouts.rcpt_to_secs);
        for recipient in request.recipients {
            timed(rcpt_timeout, "RCPT TO", client.rcpt_to(recipient))
                .await
                .map_err(|source| SessionError::Envelope {
                    server: server.clone(),
                    address: recipient.clone(),
                    source,
                })?;
        }

        if let Some(body) = request.body {
            let data_timeout = Duration::from_secs(self.timeouts.data_secs);
            let transmission = async {
                timed(data_timeout, "DATA", client.data()).await?;
                timed(data_timeout, "message data", client.send_data(body)).await
            };
            transmission
                .await
                .map_err(|source| SessionError::Transmission {
                    server: server.clone(),
                    source,
                })?;
        }

        let quit_timeout = Duration::from_secs(self.timeouts.quit_secs);
        if let Err(e) = timed(quit_timeout, "QUIT", client.quit()).await {
            tracing::warn!(server = %server, "QUIT failed after a successful session: {e}");
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for SmtpSession {
    async fn deliver(&self, request: &SessionRequest<'_>) -> Result<(), SessionError> {
        self.run(request).await
    }
}
