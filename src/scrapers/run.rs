use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::config::SearchCriteria;
use crate::parser::{new_since, Listing, ListingMerger};
use crate::scrapers::{ScrapeResult, ScrapeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl RunStatus {
    /// All sites fine → `Success`; every site failed → `Failed`; anything
    /// in between → `PartialSuccess`. A run with no sites did nothing wrong.
    pub fn from_results<'a, I>(results: I) -> Self
    where
        I: IntoIterator<Item = &'a ScrapeResult>,
    {
        let mut total = 0;
        let mut clean = 0;
        let mut failed = 0;
        for result in results {
            total += 1;
            match result.status() {
                ScrapeStatus::Success => clean += 1,
                ScrapeStatus::Failed => failed += 1,
                ScrapeStatus::PartialSuccess => {}
            }
        }

        if clean == total {
            RunStatus::Success
        } else if failed == total {
            RunStatus::Failed
        } else {
            RunStatus::PartialSuccess
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => f.write_str("Success"),
            RunStatus::PartialSuccess => f.write_str("Partial success"),
            RunStatus::Failed => f.write_str("Failed"),
        }
    }
}

/// Everything one invocation of the manager produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub criteria: SearchCriteria,
    pub status: RunStatus,
    pub results: BTreeMap<String, ScrapeResult>,
    /// Union of every site's listings, one per (site, url).
    pub listings: Vec<Listing>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl AggregateRun {
    /// Folds per-site results into a run. Sites are merged in name order and
    /// each site's listings in extraction order, so the merged list is
    /// deterministic regardless of which scraper finished first.
    pub fn assemble(
        id: Uuid,
        started_at: DateTime<Utc>,
        criteria: SearchCriteria,
        results: Vec<ScrapeResult>,
    ) -> Self {
        let results: BTreeMap<String, ScrapeResult> = results
            .into_iter()
            .map(|result| (result.site().to_string(), result))
            .collect();

        let mut merger = ListingMerger::new();
        for result in results.values() {
            merger.extend(result.listings().iter().cloned());
        }

        Self {
            id,
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::from_results(results.values()),
            criteria,
            results,
            listings: merger.finish(),
            warnings: Vec::new(),
        }
    }

    /// A run that had nothing to search for.
    pub fn empty(criteria: SearchCriteria, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            criteria,
            status: RunStatus::Success,
            results: BTreeMap::new(),
            listings: Vec::new(),
            warnings: vec![reason.into()],
        }
    }

    pub fn total_listings(&self) -> usize {
        self.listings.len()
    }

    pub fn listings_for<'a>(&'a self, site: &'a str) -> impl Iterator<Item = &'a Listing> + 'a {
        self.listings.iter().filter(move |l| l.source_site == site)
    }

    /// Per-site listing counts after merging, in site order.
    pub fn site_counts(&self) -> Vec<(&str, usize)> {
        self.results
            .keys()
            .map(|site| (site.as_str(), self.listings_for(site).count()))
            .collect()
    }

    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.results
            .values()
            .filter(|r| r.status() != ScrapeStatus::Success)
            .map(|r| (r.site(), r.error().unwrap_or("unknown error")))
            .collect()
    }

    pub fn new_since<'a>(&'a self, previous: Option<&AggregateRun>) -> Vec<&'a Listing> {
        match previous {
            Some(previous) => new_since(&self.listings, &previous.listings),
            None => self.listings.iter().collect(),
        }
    }
}
