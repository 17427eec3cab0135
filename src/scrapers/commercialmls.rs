use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::browser::{BrowserSession, BrowserSettings};
use crate::config::{PropertyType, ScrapingConfig, SearchCriteria};
use crate::error::Result;
use crate::parser::commercialmls::{COMMERCIALMLS_BASE_URL, COMMERCIALMLS_SITE};
use crate::parser::{CommercialMlsParser, ListingPageParser, ParsedPage};
use crate::scrapers::{optional_step, ProgressSink, RetryPolicy, ScrapeResult, SiteScraper};

const DOMAIN: &str = "commercialmls.com";

// the search panel is a row of dropdowns: location, type, price, more
const FILTER_BAR: &str = "#crroot div.js-main-content > div:nth-child(1) > div:nth-child(1) > div > div > div:nth-child(1)";

const START_SEARCH_BUTTON: &str = "#content div.title-container div.row.mt-3 > div:nth-child(1) > a";
const GRID_BUTTON: &str = "#crroot div.js-main-content div.float-right.p1.bgh--shade.pointer > a";
const GRID_CARD: &str = "div.grid-column.grid-card";

fn filter(section: u8, rest: &str) -> String {
    format!("{} > div:nth-child({}) {}", FILTER_BAR, section, rest)
}

fn type_checkbox(property_type: PropertyType) -> Option<u8> {
    match property_type {
        PropertyType::Retail => Some(1),
        PropertyType::Office => Some(2),
        PropertyType::Industrial => Some(3),
        PropertyType::MultiFamily => Some(9),
        PropertyType::Land | PropertyType::Hotel => None,
    }
}

/// Drives the commercialmls.com map search, then reads its grid view
pub struct CommercialMlsScraper {
    settings: BrowserSettings,
    retry: RetryPolicy,
    parser: Arc<CommercialMlsParser>,
}

impl CommercialMlsScraper {
    pub fn new(config: &ScrapingConfig) -> Result<Self> {
        Ok(Self {
            settings: BrowserSettings::from(config),
            retry: RetryPolicy::new(config.max_retries),
            parser: Arc::new(CommercialMlsParser::new()?),
        })
    }

    async fn attempt(&self, criteria: &SearchCriteria, progress: &ProgressSink) -> Result<ParsedPage> {
        let session = BrowserSession::launch(COMMERCIALMLS_SITE, self.settings.clone()).await?;
        let outcome = self.drive(&session, criteria, progress).await;
        session.close().await;
        outcome
    }

    async fn drive(&self, session: &BrowserSession, criteria: &SearchCriteria, progress: &ProgressSink) -> Result<ParsedPage> {
        progress.report(10, "opening commercialmls.com");
        session.goto(COMMERCIALMLS_BASE_URL, DOMAIN).await?;

        progress.report(20, "opening search");
        session.click(START_SEARCH_BUTTON).await?;

        progress.report(25, format!("entering location {}", criteria.location));
        let location_input = filter(1, "div.js-dropdown input");
        session.click(&filter(1, "> div")).await?;
        session.fill(&location_input, &criteria.location).await?;
        // first typeahead suggestion
        session.press_key(&location_input, "ArrowDown").await?;
        session.press_key(&location_input, "Enter").await?;

        progress.report(35, "selecting property types");
        self.select_property_types(session, criteria).await?;

        if criteria.min_price.is_some() || criteria.max_price.is_some() {
            progress.report(45, "setting price range");
            self.set_price_range(session, criteria).await?;
        }

        progress.report(55, "setting date added");
        let listed_since = criteria.listed_since_text();
        optional_step(COMMERCIALMLS_SITE, "date added filter", async {
            session.click(&filter(4, "> div.p2.js-dropdown-toggle")).await?;
            session
                .click(&filter(4, "div.js-dropdown div.span-12.border--right > div:nth-child(2) > label > span.control-indicator"))
                .await?;
            session
                .fill(&filter(4, "div.js-dropdown div.border--bottom.pb2.mb2 input"), &listed_since)
                .await
        })
        .await?;

        progress.report(60, "submitting search");
        session.press_key("body", "Enter").await?;

        progress.report(70, "switching to grid view");
        optional_step(COMMERCIALMLS_SITE, "grid view", session.click(GRID_BUTTON)).await?;
        session.wait_for(GRID_CARD).await?;
        session.pause().await;

        progress.report(80, "reading results");
        let html = session.content().await?;
        let page = self.parser.parse_results(&html);
        progress.report(100, format!("found {} listing(s)", page.listings.len()));
        Ok(page)
    }

    async fn select_property_types(&self, session: &BrowserSession, criteria: &SearchCriteria) -> Result<()> {
        session.click(&filter(2, "> div.p2.js-dropdown-toggle")).await?;
        optional_step(
            COMMERCIALMLS_SITE,
            "For Sale checkbox",
            session.click(&filter(2, "div.js-dropdown div.grid-column.span-6 div.control-group > div:nth-child(1) span.control-indicator")),
        )
        .await?;

        for property_type in &criteria.property_types {
            let Some(position) = type_checkbox(*property_type) else {
                debug!("[{}] {} has no CommercialMLS filter", COMMERCIALMLS_SITE, property_type);
                continue;
            };
            let css = filter(
                2,
                &format!("div.js-dropdown div.span-10.border--left > div > div:nth-child({}) span.control-indicator", position),
            );
            optional_step(COMMERCIALMLS_SITE, property_type.label(), session.click(&css)).await?;
            info!("[{}] Selected property type {}", COMMERCIALMLS_SITE, property_type);
        }
        Ok(())
    }

    async fn set_price_range(&self, session: &BrowserSession, criteria: &SearchCriteria) -> Result<()> {
        optional_step(COMMERCIALMLS_SITE, "price range", async {
            session.click(&filter(3, "> div.p2.js-dropdown-toggle")).await?;
            session
                .click(&filter(3, "div.js-dropdown > div > div:nth-child(1) label > span.control-indicator"))
                .await?;
            if let Some(min) = criteria.min_price {
                session.fill(&filter(3, "div.js-dropdown input:nth-child(2)"), &min.to_string()).await?;
            }
            if let Some(max) = criteria.max_price {
                let max_input = filter(3, "div.js-dropdown input:nth-child(4)");
                session.fill(&max_input, &max.to_string()).await?;
                session.press_key(&max_input, "Tab").await?;
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SiteScraper for CommercialMlsScraper {
    fn site(&self) -> &'static str {
        COMMERCIALMLS_SITE
    }

    fn supports(&self, property_type: PropertyType) -> bool {
        type_checkbox(property_type).is_some()
    }

    async fn search(&self, criteria: &SearchCriteria, progress: ProgressSink) -> ScrapeResult {
        let sink = &progress;
        self.retry
            .run(COMMERCIALMLS_SITE, sink, move |attempt| {
                debug!("[{}] Starting attempt {}", COMMERCIALMLS_SITE, attempt);
                self.attempt(criteria, sink)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_filter_selectors_are_scoped_to_bar() {
        let css = filter(3, "> div.p2.js-dropdown-toggle");
        assert!(css.starts_with(FILTER_BAR));
        assert!(css.ends_with("> div:nth-child(3) > div.p2.js-dropdown-toggle"));
    }

    #[test]
    fn test_supported_property_types() {
        let scraper = CommercialMlsScraper::new(&Config::default().scraping).unwrap();
        assert_eq!(scraper.site(), "commercialmls");
        assert!(scraper.supports(PropertyType::Retail));
        assert!(!scraper.supports(PropertyType::Hotel));
    }
}
