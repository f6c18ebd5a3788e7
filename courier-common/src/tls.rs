//! TLS settings for outbound SMTP connections.
//!
//! STARTTLS is always opportunistic: it is used whenever a server advertises
//! it and skipped otherwise. The only tunable is certificate validation.

use serde::{Deserialize, Serialize};

/// Certificate handling applied when a session upgrades via STARTTLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    /// Whether to accept invalid TLS certificates (self-signed, expired,
    /// wrong host name).
    ///
    /// **SECURITY WARNING**: Setting this to `true` disables certificate
    /// validation and makes the connection vulnerable to man-in-the-middle
    /// attacks.
    ///
    /// Default: `false` (validate certificates)
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    /// Validate server certificates against the native root store.
    #[must_use]
    pub const fn verified() -> Self {
        Self {
            accept_invalid_certs: false,
        }
    }

    /// Accept any server certificate.
    #[must_use]
    pub const fn insecure() -> Self {
        Self {
            accept_invalid_certs: true,
        }
    }

    /// Builds the policy from the `no_cert_check` configuration switch.
    #[must_use]
    pub const fn from_no_cert_check(no_cert_check: bool) -> Self {
        if no_cert_check {
            Self::insecure()
        } else {
            Self::verified()
        }
    }

    /// Returns `true` if invalid certificates should be accepted.
    #[must_use]
    pub const fn accepts_invalid_certs(&self) -> bool {
        self.accept_invalid_certs
    }
}
