pub mod commercialmls;
pub mod loopnet;
pub mod manager;
pub mod progress;
pub mod result;
pub mod run;


pub use commercialmls::CommercialMlsScraper;
pub use loopnet::LoopNetScraper;
pub use manager::ScraperManager;
pub use progress::{ProgressSink, RunEvent};
pub use result::{ScrapeResult, ScrapeStatus};
pub use run::{AggregateRun, RunStatus};

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{normalize_site_key, PropertyType, ScrapingConfig, SearchCriteria};
use crate::error::{RecoveryStrategy, Result};
use crate::parser::ParsedPage;

/// One listing site.
///
/// `search` never returns an error: every failure, including a browser
/// that would not start, is reported as a `Failed` result for this site.
#[async_trait]
pub trait SiteScraper: Send + Sync {
    /// Registry key, e.g. `loopnet`.
    fn site(&self) -> &'static str;

    /// Property types this site's search form can filter on.
    fn supports(&self, _property_type: PropertyType) -> bool {
        true
    }

    async fn search(&self, criteria: &SearchCriteria, progress: ProgressSink) -> ScrapeResult;
}

/// How often a whole site search is repeated after a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Duration::from_secs(3),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs `attempt` until it succeeds, fails permanently, or the retry
    /// budget is spent. Only transient errors are retried.
    pub async fn run<F, Fut>(&self, site: &'static str, progress: &ProgressSink, mut attempt: F) -> ScrapeResult
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<ParsedPage>>,
    {
        let started = Instant::now();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt(attempts).await {
                Ok(page) => {
                    let result = ScrapeResult::from_page(site, page, started.elapsed()).with_attempts(attempts);
                    info!(
                        "[{}] Search finished: {} with {} listing(s) in {:?}",
                        site,
                        result.status(),
                        result.listings().len(),
                        result.elapsed()
                    );
                    return result;
                }
                Err(e) if e.is_transient() && attempts <= self.max_retries => {
                    warn!("[{}] Attempt {} failed ({}), retrying", site, attempts, e);
                    progress.report(0, format!("retrying after: {}", e));
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => {
                    warn!("[{}] Search failed after {} attempt(s): {}", site, attempts, e);
                    return ScrapeResult::failed(site, e, started.elapsed()).with_attempts(attempts);
                }
            }
        }
    }
}

/// Runs a search-form step whose absence should not sink the whole search.
/// A missing element skips the step; anything else is passed up.
pub(crate) async fn optional_step<Fut>(site: &str, step: &str, fut: Fut) -> Result<()>
where
    Fut: Future<Output = Result<()>>,
{
    match fut.await {
        Ok(()) => Ok(()),
        Err(e) if e.recovery_strategy() == RecoveryStrategy::SkipStep => {
            warn!("[{}] Skipping {}: {}", site, step, e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Site key → scraper. Keys are normalised the same way as the criteria's
/// target sites.
#[derive(Default, Clone)]
pub struct ScraperRegistry {
    scrapers: HashMap<String, Arc<dyn SiteScraper>>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// LoopNet and CommercialMLS, both driving real browsers.
    pub fn with_default_sites(config: &ScrapingConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(LoopNetScraper::new(config)?));
        registry.register(Arc::new(CommercialMlsScraper::new(config)?));
        Ok(registry)
    }

    pub fn register(&mut self, scraper: Arc<dyn SiteScraper>) {
        self.scrapers.insert(normalize_site_key(scraper.site()), scraper);
    }

    pub fn get(&self, site: &str) -> Option<Arc<dyn SiteScraper>> {
        self.scrapers.get(&normalize_site_key(site)).cloned()
    }

    pub fn sites(&self) -> Vec<&str> {
        let mut sites: Vec<&str> = self.scrapers.keys().map(String::as_str).collect();
        sites.sort_unstable();
        sites
    }

    /// Scrapers for the criteria's target sites, plus the keys nobody registered.
    pub fn resolve(&self, criteria: &SearchCriteria) -> (Vec<Arc<dyn SiteScraper>>, Vec<String>) {
        let mut found = Vec::new();
        let mut unknown = Vec::new();
        for key in criteria.site_keys() {
            match self.scrapers.get(&key) {
                Some(scraper) => found.push(Arc::clone(scraper)),
                None => unknown.push(key),
            }
        }
        (found, unknown)
    }
}
