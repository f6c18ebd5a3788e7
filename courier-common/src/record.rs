//! Inbound records and the message body built from each of them.

use chrono::{DateTime, SecondsFormat, Utc};

/// Number of payload characters copied into the subject line.
pub const SUBJECT_EXCERPT_CHARS: usize = 100;

/// A single inbound record handed to the forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    pub severity: i32,
    pub logger: String,
    pub hostname: String,
}

impl Record {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        payload: impl Into<String>,
        severity: i32,
        logger: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            payload: payload.into(),
            timestamp: Utc::now(),
            severity,
            logger: logger.into(),
            hostname: hostname.into(),
        }
    }

    /// Replaces the timestamp with one given in nanoseconds since the epoch.
    #[must_use]
    pub fn at_nanos(mut self, nanos: i64) -> Self {
        self.timestamp = DateTime::from_timestamp_nanos(nanos);
        self
    }

    /// The first [`SUBJECT_EXCERPT_CHARS`] characters of the payload.
    #[must_use]
    pub fn excerpt(&self) -> &str {
        match self.payload.char_indices().nth(SUBJECT_EXCERPT_CHARS) {
            Some((cut, _)) => &self.payload[..cut],
            None => &self.payload,
        }
    }

    /// The synthesized subject, without the `Subject:` header name.
    #[must_use]
    pub fn subject(&self) -> String {
        format!(
            "{} [{}] {}@{}: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.severity,
            self.logger,
            self.hostname,
            self.excerpt()
        )
    }

    /// Builds the outbound message: a `Subject` header, a blank line and the
    /// untruncated payload.
    #[must_use]
    pub fn to_message_body(&self) -> Vec<u8> {
        let subject = self.subject();
        let mut body = Vec::with_capacity(subject.len() + self.payload.len() + 16);
        body.extend_from_slice(b"Subject: ");
        body.extend_from_slice(subject.as_bytes());
        body.extend_from_slice(b"\r\n\r\n");
        body.extend_from_slice(self.payload.as_bytes());
        body
    }
}
