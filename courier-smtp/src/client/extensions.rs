//! ESMTP service extensions advertised in an EHLO reply.

use ahash::AHashMap;

use super::{auth::Mechanism, response::Response};

/// Keywords (upper-cased) and their parameters, as advertised by a server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    keywords: AHashMap<String, Vec<String>>,
}

impl Extensions {
    /// Reads the extensions out of an EHLO reply. The first line is the
    /// server's greeting and never names an extension.
    #[must_use]
    pub fn from_ehlo(response: &Response) -> Self {
        let keywords = response
            .lines
            .iter()
            .skip(1)
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let keyword = parts.next()?.to_ascii_uppercase();
                Some((keyword, parts.map(str::to_string).collect()))
            })
            .collect();

        Self { keywords }
    }

    /// Whether the server advertised `keyword` (case-insensitive).
    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.keywords.contains_key(&keyword.to_ascii_uppercase())
    }

    /// Parameters advertised alongside `keyword`.
    #[must_use]
    pub fn params(&self, keyword: &str) -> Option<&[String]> {
        self.keywords
            .get(&keyword.to_ascii_uppercase())
            .map(Vec::as_slice)
    }

    /// The AUTH mechanisms this client understands, in the server's order.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<Mechanism> {
        self.params("AUTH")
            .unwrap_or_default()
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }
}
