//! Typed errors for sessions and planned deliveries.
//!
//! A [`SessionError`] names the step of a single SMTP conversation that
//! failed. A [`DeliveryError`] is what a whole planned delivery reports: a
//! domain that could not be resolved, a relay that failed, or a domain whose
//! every exchanger failed.

use std::fmt::Write;

use courier_smtp::ClientError;
use thiserror::Error;

use crate::DnsError;

/// The failure categories a delivery can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Resolution,
    Connect,
    Handshake,
    Tls,
    Auth,
    Envelope,
    Transmission,
    AllCandidatesFailed,
}

/// Failure of one step of one SMTP session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not connect to {server}: {source}")]
    Connect {
        server: String,
        #[source]
        source: ClientError,
    },

    #[error("greeting or EHLO with {server} failed: {source}")]
    Handshake {
        server: String,
        #[source]
        source: ClientError,
    },

    #[error("STARTTLS with {server} failed: {source}")]
    Tls {
        server: String,
        #[source]
        source: ClientError,
    },

    #[error("authentication with {server} failed: {source}")]
    Auth {
        server: String,
        #[source]
        source: ClientError,
    },

    #[error("{server} rejected <{address}>: {source}")]
    Envelope {
        server: String,
        address: String,
        #[source]
        source: ClientError,
    },

    #[error("sending message data to {server} failed: {source}")]
    Transmission {
        server: String,
        #[source]
        source: ClientError,
    },
}

impl SessionError {
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Connect { .. } => FailureKind::Connect,
            Self::Handshake { .. } => FailureKind::Handshake,
            Self::Tls { .. } => FailureKind::Tls,
            Self::Auth { .. } => FailureKind::Auth,
            Self::Envelope { .. } => FailureKind::Envelope,
            Self::Transmission { .. } => FailureKind::Transmission,
        }
    }

    /// The `host:port` the session was talking to.
    #[must_use]
    pub fn server(&self) -> &str {
        match self {
            Self::Connect { server, .. }
            | Self::Handshake { server, .. }
            | Self::Tls { server, .. }
            | Self::Auth { server, .. }
            | Self::Envelope { server, .. }
            | Self::Transmission { server, .. } => server,
        }
    }

    /// The client error underneath this failure.
    #[must_use]
    pub const fn client_error(&self) -> &ClientError {
        match self {
            Self::Connect { source, .. }
            | Self::Handshake { source, .. }
            | Self::Tls { source, .. }
            | Self::Auth { source, .. }
            | Self::Envelope { source, .. }
            | Self::Transmission { source, .. } => source,
        }
    }
}

/// One exchanger that was tried and failed.
#[derive(Debug)]
pub struct CandidateFailure {
    pub server: String,
    pub error: SessionError,
}

/// Failure of a planned delivery (or of the startup probe).
///
/// In per-domain mode a failure reported for one domain does not undo
/// domains that were already delivered before it.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("error looking up MX record for {domain}: {source}")]
    Resolution {
        domain: String,
        #[source]
        source: DnsError,
    },

    #[error("error sending mail from {from} to {recipients:?} with {server}: {source}")]
    Relay {
        from: String,
        recipients: Vec<String>,
        server: String,
        #[source]
        source: SessionError,
    },

    #[error(
        "error sending mail from {from} to {recipients:?} for {domain} with {candidates:?}: {}",
        describe(.attempts)
    )]
    AllCandidatesFailed {
        domain: String,
        from: String,
        recipients: Vec<String>,
        candidates: Vec<String>,
        attempts: Vec<CandidateFailure>,
    },
}

fn describe(attempts: &[CandidateFailure]) -> String {
    let mut out = String::new();
    for (i, attempt) in attempts.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = write!(out, "{}", attempt.error);
    }
    out
}

impl DeliveryError {
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Resolution { .. } => FailureKind::Resolution,
            Self::Relay { source, .. } => source.kind(),
            Self::AllCandidatesFailed { .. } => FailureKind::AllCandidatesFailed,
        }
    }

    /// The last session failure behind this error, if any.
    #[must_use]
    pub fn last_session_error(&self) -> Option<&SessionError> {
        match self {
            Self::Resolution { .. } => None,
            Self::Relay { source, .. } => Some(source),
            Self::AllCandidatesFailed { attempts, .. } => {
                attempts.last().map(|attempt| &attempt.error)
            }
        }
    }
}
