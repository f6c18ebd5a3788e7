//! Error types for the SMTP client.

use std::{io, time::Duration};

use thiserror::Error;

/// Errors that can occur when using the SMTP client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP response from the server.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server answered with a code other than the one the command needs.
    #[error("SMTP error: {code} - {message}")]
    SmtpError { code: u16, message: String },

    /// TLS/SSL error occurred.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// The server offered no mechanism we can use, or refused to run one.
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// A connect or command did not complete in time.
    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

impl ClientError {
    /// The SMTP reply code, when the error came from a server reply.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::SmtpError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
