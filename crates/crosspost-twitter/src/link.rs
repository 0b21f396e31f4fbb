//! Status link parsing.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::TwitterError;

static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:^|[/.])(?:twitter|x)\.com/([^/\s]+)/status/(\d+)").unwrap());

/// A reference to a single status.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TweetRef {
    pub user: String,
    pub id: String,
}

impl TweetRef {
    /// Extract the author and status id from a link.
    pub fn parse(url: &str) -> Result<Self, TwitterError> {
        let captures = STATUS_RE
            .captures(url)
            .ok_or_else(|| TwitterError::InvalidLink(url.to_string()))?;
        Ok(Self {
            user: captures[1].to_string(),
            id: captures[2].to_string(),
        })
    }

    /// Canonical link to the status.
    pub fn url(&self) -> String {
        format!("https://x.com/{}/status/{}", self.user, self.id)
    }
}

impl fmt::Display for TweetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_both_domains() {
        for url in [
            "https://twitter.com/someone/status/1234567890",
            "https://x.com/someone/status/1234567890?s=20",
            "https://www.x.com/someone/status/1234567890/photo/1",
            "HTTPS://X.COM/someone/status/1234567890",
        ] {
            let tweet = TweetRef::parse(url).unwrap();
            assert_eq!(tweet.id, "1234567890", "{url}");
        }
    }

    #[test]
    fn test_parse_extracts_user() {
        let tweet = TweetRef::parse("https://x.com/rustlang/status/42").unwrap();
        assert_eq!(tweet.user, "rustlang");
        assert_eq!(tweet.url(), "https://x.com/rustlang/status/42");
        assert_eq!(tweet.to_string(), "rustlang/42");
    }

    #[test]
    fn test_parse_rejects_other_links() {
        for url in [
            "",
            "https://x.com/someone",
            "https://x.com/someone/status/",
            "https://example.com/someone/status/1",
            "https://x.com/someone/likes/1",
            "https://fox.com/someone/status/1",
        ] {
            assert!(
                matches!(TweetRef::parse(url), Err(TwitterError::InvalidLink(_))),
                "{url}"
            );
        }
    }
}
