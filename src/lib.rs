pub mod browser;
pub mod cli;
pub mod config;
pub mod error;
pub mod notifier;
pub mod parser;
pub mod scheduler;
pub mod scrapers;
pub mod storage;

pub use config::{Config, PropertyType, SearchCriteria};
pub use error::{CrawlerError, Result};
pub use notifier::Notifier;
pub use parser::Listing;
pub use scheduler::Scheduler;
pub use scrapers::{AggregateRun, RunEvent, RunStatus, ScrapeResult, ScraperManager, SiteScraper};
pub use storage::{JsonResultStore, ResultStore};
