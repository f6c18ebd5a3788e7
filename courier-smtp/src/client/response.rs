//! SMTP reply parsing and representation.

use super::{
    error::{ClientError, Result},
    extensions::Extensions,
};

/// A single line of an SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    /// The SMTP status code (e.g., 220, 250, 550).
    pub code: u16,
    /// Whether this is the last line in a multi-line reply.
    pub is_last: bool,
    /// The text following the status code.
    pub message: String,
}

/// A complete SMTP reply, which may span several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The SMTP status code.
    pub code: u16,
    /// The text of every line, in order.
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// Returns the complete message as a single string with lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// Returns `true` for 2xx replies.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// Interprets this reply as an EHLO answer.
    #[must_use]
    pub fn extensions(&self) -> Extensions {
        Extensions::from_ehlo(self)
    }

    /// Converts a reply with an unexpected code into an error.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SmtpError`] when `accept` rejects the code.
    pub fn expect(self, accept: impl FnOnce(&Self) -> bool) -> Result<Self> {
        if accept(&self) {
            Ok(self)
        } else {
            Err(ClientError::SmtpError {
                code: self.code,
                message: self.message(),
            })
        }
    }

    /// Parses a single reply line, without its line terminator.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let Some(code_str) = line.get(..3) else {
            return Err(ClientError::ParseError(format!(
                "Response line too short: '{line}'"
            )));
        };

        let code = code_str
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code_str}'")))?;

        let is_last = match line[3..].chars().next() {
            None | Some(' ') => true,
            Some('-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{c}'"
                )));
            }
        };

        let message = line.get(4..).unwrap_or_default().to_string();

        Ok(ResponseLine {
            code,
            is_last,
            message,
        })
    }

    /// Parses one complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when the
    /// buffer does not yet hold a final line.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the reply is malformed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut first_code = None;

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let text = std::str::from_utf8(raw)
                .map_err(|e| ClientError::ParseError(format!("Reply is not UTF-8: {e}")))?;
            let parsed = Self::parse_line(text)?;

            match first_code {
                Some(code) if code != parsed.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        parsed.code
                    )));
                }
                Some(_) => {}
                None => first_code = Some(parsed.code),
            }

            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(Some((Self::new(parsed.code, lines), consumed)));
            }
        }

        Ok(None)
    }
}
