//! SASL mechanisms for the AUTH command (RFC 4954).

use std::{net::IpAddr, str::FromStr};

use base64::{Engine, engine::general_purpose::STANDARD};

/// SASL mechanisms the client can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// RFC 4616: one message carrying `\0username\0password`.
    Plain,
    /// The `LOGIN` exchange: username and password each answer a 334 prompt.
    Login,
}

impl Mechanism {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }

    /// Picks the mechanism to use from those a server offers; `PLAIN` wins
    /// when both are available.
    #[must_use]
    pub fn preferred(offered: &[Self]) -> Option<Self> {
        if offered.contains(&Self::Plain) {
            Some(Self::Plain)
        } else {
            offered.first().copied()
        }
    }
}

impl FromStr for Mechanism {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain),
            "LOGIN" => Ok(Self::Login),
            _ => Err(()),
        }
    }
}

/// The initial response for `AUTH PLAIN`, base64 encoded.
pub(super) fn plain_initial_response(username: &str, password: &str) -> String {
    STANDARD.encode(format!("\0{username}\0{password}"))
}

pub(super) fn encode(value: &str) -> String {
    STANDARD.encode(value)
}

/// Whether `host` names this machine. Credentials may cross an unencrypted
/// connection only to such a host.
#[must_use]
pub fn is_local_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}
