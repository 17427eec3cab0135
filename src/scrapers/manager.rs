use chrono::Utc;
use futures::future::join_all;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, SearchCriteria};
use crate::error::{CrawlerError, Result};
use crate::scrapers::{AggregateRun, ProgressSink, RunEvent, ScrapeResult, ScraperRegistry};
use crate::storage::ResultStore;

/// Runs every requested site scraper concurrently and folds the results
/// into one persisted `AggregateRun`.
///
/// Each scraper runs in its own task with its own copy of the criteria. A
/// scraper that outlives `site_timeout` is aborted, and the manager waits
/// for the abort to land so the scraper's browser is gone before results
/// are merged.
pub struct ScraperManager {
    registry: ScraperRegistry,
    store: Arc<dyn ResultStore>,
    site_timeout: Duration,
}

impl ScraperManager {
    pub fn new(registry: ScraperRegistry, store: Arc<dyn ResultStore>, site_timeout: Duration) -> Self {
        Self {
            registry,
            store,
            site_timeout,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn ResultStore>) -> Result<Self> {
        let registry = ScraperRegistry::with_default_sites(&config.scraping)?;
        Ok(Self::new(registry, store, config.scraping.site_timeout))
    }

    pub fn registry(&self) -> &ScraperRegistry {
        &self.registry
    }

    pub fn site_timeout(&self) -> Duration {
        self.site_timeout
    }

    /// Validates the criteria, runs the search and persists the outcome.
    ///
    /// Only invalid criteria produce an error. Site failures are recorded in
    /// the run, and a failed save becomes a warning on the returned run.
    pub async fn run(&self, criteria: SearchCriteria) -> Result<AggregateRun> {
        self.execute(criteria, None).await
    }

    /// Same as `run`, observed as a finite stream of events that ends with
    /// `RunFinished`, or `RunRejected` for invalid criteria, or `RunAborted`
    /// when the run task itself died.
    pub fn run_stream(self: Arc<Self>, criteria: SearchCriteria) -> impl Stream<Item = RunEvent> + Send + 'static {
        async_stream::stream! {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let manager = Arc::clone(&self);
            let run = tokio::spawn(async move { manager.execute(criteria, Some(tx)).await });

            // closes once the run and every scraper task have dropped their senders
            while let Some(event) = rx.recv().await {
                yield event;
            }

            match run.await {
                Ok(Ok(run)) => yield RunEvent::RunFinished { run: Box::new(run) },
                Ok(Err(CrawlerError::Validation(reason))) => yield RunEvent::RunRejected { reason },
                Ok(Err(e)) => yield RunEvent::RunAborted { error: e.to_string() },
                Err(e) => {
                    error!("Run task failed: {}", e);
                    yield RunEvent::RunAborted { error: format!("run task failed: {}", e) }
                }
            }
        }
    }

    async fn execute(&self, criteria: SearchCriteria, events: Option<mpsc::UnboundedSender<RunEvent>>) -> Result<AggregateRun> {
        criteria.validate()?;

        if criteria.is_noop() {
            info!("No property types or sites selected, nothing to search");
            return Ok(AggregateRun::empty(criteria, "no property types or target sites selected"));
        }

        let (scrapers, unknown) = self.registry.resolve(&criteria);
        let mut warnings: Vec<String> = unknown
            .iter()
            .map(|site| {
                warn!("No scraper registered for site '{}', skipping it", site);
                format!("no scraper registered for site '{}'", site)
            })
            .collect();

        // a site that cannot filter on any selected type would return everything
        let (scrapers, unsupported): (Vec<_>, Vec<_>) = scrapers
            .into_iter()
            .partition(|scraper| criteria.property_types.iter().any(|t| scraper.supports(*t)));
        for scraper in &unsupported {
            warn!("[{}] Supports none of the selected property types, skipping it", scraper.site());
            warnings.push(format!(
                "site '{}' supports none of the selected property types",
                scraper.site()
            ));
        }

        if scrapers.is_empty() {
            let mut run = AggregateRun::empty(criteria, "none of the target sites can run this search");
            run.warnings.append(&mut warnings);
            return Ok(run);
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("Starting run {} across {} site(s)", run_id, scrapers.len());

        let tasks: Vec<(&'static str, ProgressSink, JoinHandle<ScrapeResult>)> = scrapers
            .into_iter()
            .map(|scraper| {
                let site = scraper.site();
                let sink = match &events {
                    Some(tx) => ProgressSink::new(site, tx.clone()),
                    None => ProgressSink::disabled(site),
                };
                sink.emit(RunEvent::SiteStarted { site: site.to_string() });

                let criteria = criteria.clone();
                let task_sink = sink.clone();
                let handle = tokio::spawn(async move { scraper.search(&criteria, task_sink).await });
                (site, sink, handle)
            })
            .collect();
        drop(events);

        let results = join_all(
            tasks
                .into_iter()
                .map(|(site, sink, handle)| self.supervise(site, sink, handle)),
        )
        .await;

        let mut run = AggregateRun::assemble(run_id, started_at, criteria, results);
        run.warnings.append(&mut warnings);

        if let Err(e) = self.store.save(&run).await {
            error!("Failed to persist run {}: {}", run.id, e);
            run.warnings.push(format!("results were not saved: {}", e));
        }

        info!(
            "Run {} finished: {} with {} listing(s)",
            run.id,
            run.status,
            run.total_listings()
        );
        Ok(run)
    }

    async fn supervise(&self, site: &'static str, sink: ProgressSink, mut handle: JoinHandle<ScrapeResult>) -> ScrapeResult {
        let started = Instant::now();

        let result = match timeout(self.site_timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!("[{}] Scraper task crashed: {}", site, join_error);
                ScrapeResult::failed(site, format!("scraper crashed: {}", join_error), started.elapsed())
            }
            Err(_) => {
                warn!("[{}] Exceeded {:?}, cancelling", site, self.site_timeout);
                handle.abort();
                // resolves once the task has been dropped, browser session included
                let _ = handle.await;
                ScrapeResult::failed(
                    site,
                    CrawlerError::timeout("searching", self.site_timeout),
                    started.elapsed(),
                )
            }
        };

        sink.emit(RunEvent::SiteFinished {
            site: site.to_string(),
            status: result.status(),
            listings: result.listings().len(),
            error: result.error().map(str::to_string),
        });
        result
    }
}
