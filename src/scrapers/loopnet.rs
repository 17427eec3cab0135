use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::browser::{BrowserSession, BrowserSettings};
use crate::config::{PropertyType, ScrapingConfig, SearchCriteria};
use crate::error::Result;
use crate::parser::loopnet::{LOOPNET_BASE_URL, LOOPNET_SITE};
use crate::parser::{ListingPageParser, LoopNetParser, ParsedPage};
use crate::scrapers::{optional_step, ProgressSink, RetryPolicy, ScrapeResult, SiteScraper};

const DOMAIN: &str = "loopnet.com";

const LOCATION_INPUT: &str = "div.search-location-container div.typeahead-container input";
const SALE_LEASE_DROPDOWN: &str = "#quickSearchFilters div.search-type-container > div > button";
const FOR_SALE_OPTION: &str = "#quickSearchFilters div.search-type-container > div > ul > li:nth-child(2) > button";
const PROPERTY_TYPE_DROPDOWN: &str = "#quickSearchFilters > div.filters > div:nth-child(1) > div > button";
const OTHER_FILTERS_BUTTON: &str = "#quickSearchFilters > div.filters > div:nth-child(15) > button";
const MIN_PRICE_INPUT: &str = ".price-range .range-from input";
const MAX_PRICE_INPUT: &str = ".price-range .range-to input";
const CUSTOM_DATE_OPTION: &str = ".date-entered .pill-group > div:nth-child(2) label";
const START_DATE_INPUT: &str = ".date-entered .custom-time-period input";
const APPLY_FILTERS_BUTTON: &str = "div.csgp-modal.advanced-filters-modal button.button.primary.submit";
const FILTERS_CLOSE_BUTTON: &str = "div.csgp-modal.advanced-filters-modal button.csgp-modal-close";
const RESULTS_CONTAINER: &str = "div.placard-container";
const PLACARD: &str = "div.placard-content";

fn type_checkbox(property_type: PropertyType) -> Option<&'static str> {
    match property_type {
        PropertyType::Office => Some("#quickSearchFilters > div.filters > div:nth-child(1) ul > li:nth-child(2) > label > input"),
        PropertyType::Industrial => Some("#quickSearchFilters > div.filters > div:nth-child(1) ul > li:nth-child(3) > label > input"),
        PropertyType::Retail => Some("#quickSearchFilters > div.filters > div:nth-child(1) ul > li:nth-child(4) > label > input"),
        PropertyType::MultiFamily => Some("#quickSearchFilters > div.filters > div:nth-child(1) ul > li:nth-child(7) > label > input"),
        PropertyType::Land | PropertyType::Hotel => None,
    }
}

/// Drives loopnet.com's quick search and "other filters" modal
pub struct LoopNetScraper {
    settings: BrowserSettings,
    retry: RetryPolicy,
    parser: Arc<LoopNetParser>,
}

impl LoopNetScraper {
    pub fn new(config: &ScrapingConfig) -> Result<Self> {
        Ok(Self {
            settings: BrowserSettings::from(config),
            retry: RetryPolicy::new(config.max_retries),
            parser: Arc::new(LoopNetParser::new()?),
        })
    }

    async fn attempt(&self, criteria: &SearchCriteria, progress: &ProgressSink) -> Result<ParsedPage> {
        let session = BrowserSession::launch(LOOPNET_SITE, self.settings.clone()).await?;
        let outcome = self.drive(&session, criteria, progress).await;
        session.close().await;
        outcome
    }

    async fn drive(&self, session: &BrowserSession, criteria: &SearchCriteria, progress: &ProgressSink) -> Result<ParsedPage> {
        progress.report(10, "opening loopnet.com");
        session.goto(LOOPNET_BASE_URL, DOMAIN).await?;

        progress.report(20, format!("entering location {}", criteria.location));
        session.remove_overlays().await;
        session.fill(LOCATION_INPUT, &criteria.location).await?;
        session.press_key(LOCATION_INPUT, "Enter").await?;

        progress.report(25, "selecting For Sale");
        optional_step(LOOPNET_SITE, "sale/lease selector", async {
            session.click(SALE_LEASE_DROPDOWN).await?;
            session.click(FOR_SALE_OPTION).await
        })
        .await?;

        progress.report(30, "selecting property types");
        self.select_property_types(session, criteria).await?;

        progress.report(40, "applying filters");
        self.apply_other_filters(session, criteria).await?;

        progress.report(65, "waiting for results");
        session.wait_for_any(&[RESULTS_CONTAINER, PLACARD]).await?;
        session.pause().await;

        progress.report(80, "reading results");
        let html = session.content().await?;
        let page = self.parser.parse_results(&html);
        progress.report(100, format!("found {} listing(s)", page.listings.len()));
        Ok(page)
    }

    async fn select_property_types(&self, session: &BrowserSession, criteria: &SearchCriteria) -> Result<()> {
        let checkboxes: Vec<(PropertyType, &str)> = criteria
            .property_types
            .iter()
            .filter_map(|t| type_checkbox(*t).map(|css| (*t, css)))
            .collect();
        if checkboxes.is_empty() {
            debug!("[{}] No selected property type has a LoopNet filter", LOOPNET_SITE);
            return Ok(());
        }

        optional_step(LOOPNET_SITE, "property type dropdown", async {
            session.click(PROPERTY_TYPE_DROPDOWN).await?;
            for (property_type, css) in &checkboxes {
                optional_step(LOOPNET_SITE, property_type.label(), session.click(css)).await?;
                info!("[{}] Selected property type {}", LOOPNET_SITE, property_type);
            }
            // close the dropdown
            session.evaluate("document.activeElement && document.activeElement.blur();").await
        })
        .await
    }

    async fn apply_other_filters(&self, session: &BrowserSession, criteria: &SearchCriteria) -> Result<()> {
        let listed_since = criteria.listed_since_text();

        let applied = optional_step(LOOPNET_SITE, "other filters", async {
            session.click(OTHER_FILTERS_BUTTON).await?;

            if let Some(min) = criteria.min_price {
                optional_step(LOOPNET_SITE, "minimum price", async {
                    session.fill(MIN_PRICE_INPUT, &min.to_string()).await?;
                    session.press_key(MIN_PRICE_INPUT, "Tab").await
                })
                .await?;
            }
            if let Some(max) = criteria.max_price {
                optional_step(LOOPNET_SITE, "maximum price", async {
                    session.fill(MAX_PRICE_INPUT, &max.to_string()).await?;
                    session.press_key(MAX_PRICE_INPUT, "Tab").await
                })
                .await?;
            }

            optional_step(LOOPNET_SITE, "date entered filter", async {
                session.click(CUSTOM_DATE_OPTION).await?;
                session.fill(START_DATE_INPUT, &listed_since).await?;
                session.press_key(START_DATE_INPUT, "Tab").await
            })
            .await?;

            session.click(APPLY_FILTERS_BUTTON).await
        })
        .await;

        if applied.is_err() && session.exists(FILTERS_CLOSE_BUTTON).await {
            let _ = session.click(FILTERS_CLOSE_BUTTON).await;
        }
        applied
    }
}

#[async_trait]
impl SiteScraper for LoopNetScraper {
    fn site(&self) -> &'static str {
        LOOPNET_SITE
    }

    fn supports(&self, property_type: PropertyType) -> bool {
        type_checkbox(property_type).is_some()
    }

    async fn search(&self, criteria: &SearchCriteria, progress: ProgressSink) -> ScrapeResult {
        let sink = &progress;
        self.retry
            .run(LOOPNET_SITE, sink, move |attempt| {
                debug!("[{}] Starting attempt {}", LOOPNET_SITE, attempt);
                self.attempt(criteria, sink)
            })
            .await
    }
}
