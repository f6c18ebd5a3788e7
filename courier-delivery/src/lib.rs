//! Outbound delivery for courier.
//!
//! This crate provides:
//! - A process-wide MX cache in front of DNS resolution
//! - One-shot SMTP sessions (greeting, STARTTLS, AUTH, envelope, DATA, QUIT)
//! - A planner that groups recipients by domain and fails over across the
//!   mail exchangers of each domain

mod dns;
mod error;
mod planner;
mod session;
mod types;

pub use dns::{DnsConfig, DnsError, HickoryLookup, MailServer, MxCache, MxLookup};
pub use error::{CandidateFailure, DeliveryError, FailureKind, SessionError};
pub use planner::{DeliveryPlanner, DomainGroups, MissingDomain, RelayTarget};
pub use session::{SessionRequest, SmtpSession, Transport};
pub use types::{ClientTimeouts, Credentials, DEFAULT_SMTP_PORT};
