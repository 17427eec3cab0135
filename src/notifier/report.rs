use chrono::Local;
use std::fmt::Write;

use crate::parser::Listing;
use crate::scrapers::AggregateRun;

const RULE: &str = "==================================================";
const SEPARATOR: &str = "----------------------------------------";
const DESCRIPTION_LIMIT: usize = 200;

/// Plain-text email rendering of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub subject: String,
    pub body: String,
}

impl Report {
    /// `previous` is the run stored before this one, used to call out
    /// listings that were not seen last time.
    pub fn build(run: &AggregateRun, previous: Option<&AggregateRun>) -> Self {
        let total = run.total_listings();
        let subject = format!("Commercial Real Estate Search Results - {} Properties Found", total);

        // writing into a String cannot fail
        let mut body = String::new();
        let _ = writeln!(body, "Commercial Real Estate Search Results");
        let _ = writeln!(body, "=====================================");
        let _ = writeln!(body);
        let _ = writeln!(
            body,
            "Search completed: {}",
            run.finished_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(body, "Location: {}", run.criteria.location);
        let _ = writeln!(body, "Overall status: {}", run.status);
        let _ = writeln!(body, "Total properties found: {}", total);
        let _ = writeln!(body);

        if !run.results.is_empty() {
            let _ = writeln!(body, "Results by site:");
            for (site, count) in run.site_counts() {
                let _ = writeln!(body, "  {}: {}", site, count);
            }
            let _ = writeln!(body);
        }

        let failures = run.failures();
        if !failures.is_empty() {
            let _ = writeln!(body, "Problems:");
            for (site, error) in failures {
                let _ = writeln!(body, "  {}: {}", site, error);
            }
            let _ = writeln!(body);
        }

        for warning in &run.warnings {
            let _ = writeln!(body, "Note: {}", warning);
        }
        if !run.warnings.is_empty() {
            let _ = writeln!(body);
        }

        if total == 0 {
            let _ = writeln!(body, "No properties found matching your criteria.");
        } else {
            let fresh = run.new_since(previous);
            let _ = writeln!(body, "New since last run: {}", fresh.len());
            for listing in &fresh {
                let _ = writeln!(body, "  * {} ({})", listing.title, listing.source_site);
            }
            let _ = writeln!(body);

            for (site, count) in run.site_counts() {
                if count == 0 {
                    continue;
                }
                let _ = writeln!(body, "{}", RULE);
                let _ = writeln!(body, "{} - {} Properties", site.to_uppercase(), count);
                let _ = writeln!(body, "{}", RULE);
                let _ = writeln!(body);

                for (i, listing) in run.listings_for(site).enumerate() {
                    let _ = writeln!(body, "[{}] {}", i + 1, listing_details(listing).join("\n"));
                    let _ = writeln!(body);
                    let _ = writeln!(body, "{}", SEPARATOR);
                    let _ = writeln!(body);
                }
            }
        }

        let _ = writeln!(body);
        let _ = writeln!(body, "---");
        let _ = writeln!(body, "This email was automatically sent by the Commercial Real Estate Crawler.");
        let _ = writeln!(
            body,
            "To stop receiving these emails, set notification.enabled = false in the crawler configuration."
        );

        Self { subject, body }
    }
}

fn listing_details(listing: &Listing) -> Vec<String> {
    let mut details = vec![listing.title.clone()];

    if let Some(price) = listing.price {
        details.push(format!("Price: {}", format_price(price)));
    }
    if let Some(property_type) = listing.property_type {
        details.push(format!("Type: {}", property_type));
    }
    if let Some(size) = &listing.size {
        details.push(format!("Size: {}", size));
    }
    if let Some(address) = &listing.address {
        if address != &listing.title {
            details.push(format!("Address: {}", address));
        }
    }
    if let Some(description) = &listing.description {
        details.push(format!("Description: {}", truncate(description, DESCRIPTION_LIMIT)));
    }
    details.push(format!("URL: {}", listing.url));
    details
}

/// `1250000` → `$1,250,000`
pub fn format_price(price: u64) -> String {
    let digits = price.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    out.push('$');
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PropertyType, SearchCriteria};
    use crate::scrapers::ScrapeResult;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    fn office(n: u32) -> Listing {
        Listing::new("loopnet", format!("{} Pine St", n), format!("https://www.loopnet.com/Listing/{}/", n))
            .with_price(Some(1_250_000))
            .with_property_type(Some(PropertyType::Office))
            .with_size("12,000 SF")
    }

    fn run_with(results: Vec<ScrapeResult>) -> AggregateRun {
        AggregateRun::assemble(Uuid::new_v4(), Utc::now(), SearchCriteria::default(), results)
    }

    #[test]
    fn test_subject_counts_properties() {
        let run = run_with(vec![ScrapeResult::success("loopnet", vec![office(1), office(2)], Duration::from_secs(5))]);
        let report = Report::build(&run, None);
        assert_eq!(report.subject, "Commercial Real Estate Search Results - 2 Properties Found");
    }

    #[test]
    fn test_body_has_site_blocks_and_details() {
        let run = run_with(vec![
            ScrapeResult::success("loopnet", vec![office(1)], Duration::from_secs(5)),
            ScrapeResult::failed("commercialmls", "Timed out after 600s while searching", Duration::from_secs(600)),
        ]);
        let body = Report::build(&run, None).body;

        assert!(body.contains("Overall status: Partial success"));
        assert!(body.contains("  commercialmls: 0\n  loopnet: 1"));
        assert!(body.contains("Problems:\n  commercialmls: Timed out after 600s while searching"));
        assert!(body.contains("LOOPNET - 1 Properties"));
        assert!(!body.contains("COMMERCIALMLS - "));
        assert!(body.contains("[1] 1 Pine St\nPrice: $1,250,000\nType: Office\nSize: 12,000 SF\nURL: https://www.loopnet.com/Listing/1/"));
        assert!(body.trim_end().ends_with("crawler configuration."));
    }

    #[test]
    fn test_new_listings_are_called_out() {
        let previous = run_with(vec![ScrapeResult::success("loopnet", vec![office(1)], Duration::from_secs(5))]);
        let current = run_with(vec![ScrapeResult::success("loopnet", vec![office(1), office(2)], Duration::from_secs(5))]);

        let body = Report::build(&current, Some(&previous)).body;
        assert!(body.contains("New since last run: 1\n  * 2 Pine St (loopnet)"));
    }

    #[test]
    fn test_empty_run_says_so() {
        let run = run_with(vec![ScrapeResult::success("loopnet", vec![], Duration::from_secs(5))]);
        let report = Report::build(&run, None);
        assert!(report.subject.ends_with("0 Properties Found"));
        assert!(report.body.contains("No properties found matching your criteria."));
    }

    #[test]
    fn test_long_description_is_truncated() {
        let listing = office(1).with_description("é".repeat(250));
        let details = listing_details(&listing);
        let description = details.iter().find(|d| d.starts_with("Description: ")).unwrap();
        assert_eq!(description.chars().count(), "Description: ".len() + 200 + 3);
        assert!(description.ends_with("..."));
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(0), "$0");
        assert_eq!(format_price(950), "$950");
        assert_eq!(format_price(1_000), "$1,000");
        assert_eq!(format_price(1_250_000), "$1,250,000");
    }
}
