//! Shared configuration types for delivery.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Port used for mail exchangers and for relays given without one.
pub const DEFAULT_SMTP_PORT: u16 = 25;

/// SMTP client timeout configuration.
///
/// Every network step of a session is bounded; running out of time is an
/// ordinary failure of that step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimeouts {
    /// Timeout for establishing the TCP connection when sending a message.
    ///
    /// Default: 30 seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Timeout for establishing the TCP connection during the startup probe.
    ///
    /// Default: 10 seconds
    #[serde(default = "default_probe_connect_timeout")]
    pub probe_connect_secs: u64,

    /// Timeout for the greeting and EHLO/HELO.
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub ehlo_secs: u64,

    /// Timeout for STARTTLS and the TLS handshake.
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub starttls_secs: u64,

    /// Timeout for the whole AUTH exchange.
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub auth_secs: u64,

    /// Timeout for MAIL FROM.
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub mail_from_secs: u64,

    /// Timeout for each RCPT TO.
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub rcpt_to_secs: u64,

    /// Timeout for DATA and, separately, for transmitting the message.
    ///
    /// Default: 120 seconds
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    /// Timeout for QUIT. Running out does not fail a delivery.
    ///
    /// Default: 10 seconds
    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            probe_connect_secs: default_probe_connect_timeout(),
            ehlo_secs: default_command_timeout(),
            starttls_secs: default_command_timeout(),
            auth_secs: default_command_timeout(),
            mail_from_secs: default_command_timeout(),
            rcpt_to_secs: default_command_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

impl ClientTimeouts {
    /// Connect timeout for a real delivery (`probe == false`) or the probe.
    #[must_use]
    pub const fn connect(&self, probe: bool) -> Duration {
        Duration::from_secs(if probe {
            self.probe_connect_secs
        } else {
            self.connect_secs
        })
    }
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_probe_connect_timeout() -> u64 {
    10
}

const fn default_command_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

/// Username and password for SMTP AUTH.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
