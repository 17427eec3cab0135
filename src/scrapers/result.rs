use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::parser::{Listing, ParsedPage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScrapeStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrapeStatus::Success => f.write_str("success"),
            ScrapeStatus::PartialSuccess => f.write_str("partial success"),
            ScrapeStatus::Failed => f.write_str("failed"),
        }
    }
}

/// What one site scraper produced for one run.
///
/// Built once through the constructors below and read-only afterwards.
/// `error` is present exactly when the status is not `Success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    site: String,
    status: ScrapeStatus,
    listings: Vec<Listing>,
    error: Option<String>,
    #[serde(with = "humantime_serde")]
    elapsed: Duration,
    attempts: u32,
}

impl ScrapeResult {
    pub fn success(site: impl Into<String>, listings: Vec<Listing>, elapsed: Duration) -> Self {
        Self {
            site: site.into(),
            status: ScrapeStatus::Success,
            listings,
            error: None,
            elapsed,
            attempts: 1,
        }
    }

    pub fn failed(site: impl Into<String>, error: impl fmt::Display, elapsed: Duration) -> Self {
        Self {
            site: site.into(),
            status: ScrapeStatus::Failed,
            listings: Vec::new(),
            error: Some(error.to_string()),
            elapsed,
            attempts: 1,
        }
    }

    /// Malformed cards downgrade the result to `PartialSuccess`; a page where
    /// every card was malformed is a failure.
    pub fn from_page(site: impl Into<String>, page: ParsedPage, elapsed: Duration) -> Self {
        let site = site.into();
        if page.skipped.is_empty() {
            return Self::success(site, page.listings, elapsed);
        }

        let summary = format!(
            "skipped {} malformed listing(s), first: {}",
            page.skipped.len(),
            page.skipped[0]
        );
        if page.listings.is_empty() {
            return Self::failed(site, summary, elapsed);
        }

        Self {
            site,
            status: ScrapeStatus::PartialSuccess,
            listings: page.listings,
            error: Some(summary),
            elapsed,
            attempts: 1,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn status(&self) -> ScrapeStatus {
        self.status
    }

    pub fn listings(&self) -> &[Listing] {
        &self.listings
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_failed(&self) -> bool {
        self.status == ScrapeStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(n: u32) -> Listing {
        Listing::new("loopnet", format!("Listing {}", n), format!("https://www.loopnet.com/Listing/{}", n))
    }

    #[test]
    fn test_error_present_iff_not_success() {
        let ok = ScrapeResult::success("loopnet", vec![listing(1)], Duration::from_secs(3));
        assert_eq!(ok.status(), ScrapeStatus::Success);
        assert!(ok.error().is_none());

        let failed = ScrapeResult::failed("loopnet", "navigation failed", Duration::from_secs(3));
        assert_eq!(failed.status(), ScrapeStatus::Failed);
        assert_eq!(failed.error(), Some("navigation failed"));
        assert!(failed.listings().is_empty());
    }

    #[test]
    fn test_page_with_skipped_cards_is_partial() {
        let page = ParsedPage {
            listings: vec![listing(1), listing(2)],
            skipped: vec!["card has no link".to_string()],
        };
        let result = ScrapeResult::from_page("loopnet", page, Duration::from_secs(1));
        assert_eq!(result.status(), ScrapeStatus::PartialSuccess);
        assert_eq!(result.listings().len(), 2);
        assert!(result.error().unwrap().contains("skipped 1 malformed"));
    }

    #[test]
    fn test_page_with_only_malformed_cards_fails() {
        let page = ParsedPage {
            listings: vec![],
            skipped: vec!["a".to_string(), "b".to_string()],
        };
        let result = ScrapeResult::from_page("loopnet", page, Duration::from_secs(1));
        assert_eq!(result.status(), ScrapeStatus::Failed);
        assert!(result.error().is_some());
    }

    #[test]
    fn test_empty_page_is_success_with_zero_listings() {
        let result = ScrapeResult::from_page("loopnet", ParsedPage::default(), Duration::from_secs(1));
        assert_eq!(result.status(), ScrapeStatus::Success);
        assert!(result.listings().is_empty());
        assert_eq!(result.attempts(), 1);
    }
}
