use scraper::{ElementRef, Selector};
use url::Url;

use crate::error::CrawlerError;
use crate::parser::Listing;

/// Outcome of parsing one search results page. Cards that looked like
/// listings but could not be turned into one are reported in `skipped`
/// instead of failing the page.
#[derive(Debug, Default)]
pub struct ParsedPage {
    pub listings: Vec<Listing>,
    pub skipped: Vec<String>,
}

impl ParsedPage {
    pub fn is_empty(&self) -> bool {
        self.listings.is_empty() && self.skipped.is_empty()
    }
}

/// Turns a results page's HTML into listings for one site
pub trait ListingPageParser: Send + Sync {
    fn site(&self) -> &'static str;
    fn parse_results(&self, html: &str) -> ParsedPage;
}

pub(crate) fn selector(css: &str) -> Result<Selector, CrawlerError> {
    Selector::parse(css).map_err(|e| CrawlerError::Parse(format!("Invalid selector '{}': {:?}", css, e)))
}

/// Text content with runs of whitespace collapsed to single spaces.
pub(crate) fn element_text(element: ElementRef) -> String {
    element
        .text()
        .flat_map(|chunk| chunk.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn first_text(scope: ElementRef, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .map(element_text)
        .find(|text| !text.is_empty())
}

pub(crate) fn absolute_url(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") {
        return None;
    }
    let joined = base.join(href).ok()?;
    match joined.scheme() {
        "http" | "https" => Some(joined.to_string()),
        _ => None,
    }
}

/// Asking price in whole dollars.
///
/// Handles `$1,250,000`, `$1.2M`, `$850K` and ranges (first bound wins).
/// Lease rates such as `$24/SF/YR` and text like `Price Not Disclosed` have
/// no sale price and return `None`.
pub fn parse_price(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    if ["/sf", "/mo", "/yr", "/ac"].iter().any(|rate| lower.contains(rate)) {
        return None;
    }

    let start = lower.find(|c: char| c.is_ascii_digit())?;
    let rest = &lower[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == ',' || c == '.'))
        .unwrap_or(rest.len());
    let digits: String = rest[..end].chars().filter(|c| *c != ',').collect();
    let value: f64 = digits.trim_end_matches('.').parse().ok()?;

    let suffix = rest[end..].trim_start();
    let multiplier = if suffix.starts_with('m') {
        1_000_000.0
    } else if suffix.starts_with('k') {
        1_000.0
    } else if suffix.starts_with('b') {
        1_000_000_000.0
    } else {
        1.0
    };

    let dollars = (value * multiplier).round();
    if dollars.is_finite() && dollars >= 0.0 {
        Some(dollars as u64)
    } else {
        None
    }
}
