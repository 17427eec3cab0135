use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, ConfigManager, FileConfigManager, PropertyType, SearchCriteria};
use crate::error::CrawlerError;
use crate::notifier::Notifier;
use crate::scheduler::{next_slot, RegistrationStatus, ScheduleState, ScheduledJob, Scheduler, TaskCommand, TaskRegistrar};
use crate::scrapers::{AggregateRun, RunEvent, RunStatus, ScraperManager};
use crate::storage::{JsonResultStore, ResultStore};

/// Command-line adjustments to the saved search for a single run
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub location: Option<String>,
    pub property_types: Vec<PropertyType>,
    pub sites: Vec<String>,
    pub min_price: Option<u64>,
    pub max_price: Option<u64>,
    pub days: Option<u32>,
    pub headed: bool,
}

impl RunOverrides {
    pub fn apply(&self, config: &mut Config) {
        let criteria = &mut config.search;
        if let Some(location) = &self.location {
            criteria.location = location.clone();
        }
        if !self.property_types.is_empty() {
            criteria.property_types = self.property_types.iter().copied().collect();
        }
        if !self.sites.is_empty() {
            criteria.target_sites = self.sites.clone();
        }
        if self.min_price.is_some() {
            criteria.min_price = self.min_price;
        }
        if self.max_price.is_some() {
            criteria.max_price = self.max_price;
        }
        if let Some(days) = self.days {
            criteria.lookback_days = days;
        }
        if self.headed {
            config.scraping.headless = false;
        }
    }
}

/// Runs one search, persists it, and emails the report when `send_email`.
/// With `print_events` every progress event is written to stdout as JSON.
pub async fn execute_run(
    config: &Config,
    criteria: SearchCriteria,
    send_email: bool,
    print_events: bool,
) -> crate::error::Result<AggregateRun> {
    let store = Arc::new(JsonResultStore::new(config.output.results_path()));
    // read before the run overwrites it, for the "new since last run" section
    let previous = store.load().await;
    let manager = Arc::new(ScraperManager::from_config(config, store)?);

    let run = if print_events {
        criteria.validate()?;
        let mut events = Box::pin(manager.run_stream(criteria));
        let mut finished = None;
        while let Some(event) = events.next().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Could not serialize event: {}", e),
            }
            if let Some(outcome) = run_outcome(event) {
                finished = Some(outcome);
            }
        }
        finished.unwrap_or_else(|| Err(CrawlerError::Internal("run ended without a result".to_string())))?
    } else {
        manager.run(criteria).await?
    };

    if send_email {
        let outcome = Notifier::from_config(&config.notification)
            .notify(&run, previous.as_ref())
            .await;
        info!("{}", outcome);
    }
    Ok(run)
}

/// The result a terminal event carries; `None` for progress events.
fn run_outcome(event: RunEvent) -> Option<crate::error::Result<AggregateRun>> {
    match event {
        RunEvent::RunFinished { run } => Some(Ok(*run)),
        RunEvent::RunRejected { reason } => Some(Err(CrawlerError::Validation(reason))),
        RunEvent::RunAborted { error } => Some(Err(CrawlerError::Internal(error))),
        _ => None,
    }
}

fn print_summary(run: &AggregateRun, config: &Config) {
    println!(
        "Run {} finished: {} with {} listing(s)",
        run.id,
        run.status,
        run.total_listings()
    );
    for result in run.results.values() {
        match result.error() {
            None => println!(
                "  {}: {} listing(s) in {:.1?}",
                result.site(),
                result.listings().len(),
                result.elapsed()
            ),
            Some(error) => println!(
                "  {}: {} after {} attempt(s), {} listing(s): {}",
                result.site(),
                result.status(),
                result.attempts(),
                result.listings().len(),
                error
            ),
        }
    }
    for warning in &run.warnings {
        println!("  warning: {}", warning);
    }
    if !run.results.is_empty() {
        println!("Results saved to {}", config.output.results_path().display());
    }
}

pub async fn run_now(
    config_manager: &FileConfigManager,
    overrides: RunOverrides,
    send_email: bool,
    print_events: bool,
) -> Result<()> {
    let mut config = config_manager
        .load_config()
        .await
        .context("Failed to load configuration")?;
    overrides.apply(&mut config);

    let criteria = config.search.clone();
    let run = execute_run(&config, criteria, send_email, print_events)
        .await
        .context("Run did not complete")?;
    if !print_events {
        print_summary(&run, &config);
    }
    Ok(())
}

pub async fn run_scheduled(config_manager: &FileConfigManager) -> Result<()> {
    let config = config_manager
        .load_config()
        .await
        .context("Failed to load configuration")?;

    // keeps a resident daemon from repeating this slot
    if let Err(e) = ScheduleState::record(&config.output.schedule_state_path(), Local::now().naive_local()) {
        warn!("Could not record scheduled run: {}", e);
    }

    let run = execute_run(&config, config.search.clone(), true, false)
        .await
        .context("Scheduled run did not complete")?;
    print_summary(&run, &config);
    Ok(())
}

/// Runs the saved search with email, as the scheduler's job
pub struct CrawlJob;

#[async_trait]
impl ScheduledJob for CrawlJob {
    async fn run(&self, config: &Config) -> crate::error::Result<()> {
        let run = execute_run(config, config.search.clone(), true, false).await?;
        info!("Scheduled run {} finished: {}", run.id, run.status);
        Ok(())
    }
}

pub async fn daemon(config_manager: &FileConfigManager) -> Result<()> {
    let config = config_manager
        .load_config()
        .await
        .context("Failed to load configuration")?;
    if !config.schedule.enabled {
        warn!("schedule.enabled is false; idling until the configuration enables it");
    }

    let updates = config_manager.watch_config_changes().await?;
    let scheduler = Scheduler::new(config, CrawlJob);
    scheduler
        .run_until(updates, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C ({}), running until killed", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

/// Registers the OS task. Times given on the command line take precedence
/// over the configured ones; the configuration file is left untouched.
pub async fn install_schedule(
    config_manager: &FileConfigManager,
    times: &[String],
    registrar: &dyn TaskRegistrar,
) -> Result<()> {
    let mut schedule = config_manager
        .load_config()
        .await
        .context("Failed to load configuration")?
        .schedule;
    if !times.is_empty() {
        schedule.times = times.to_vec();
    }

    let parsed = schedule.parsed_times()?;
    if parsed.is_empty() {
        bail!("No run times given; pass --time HH:MM or set schedule.times");
    }

    let command = TaskCommand::current_exe(config_manager.path())?;
    registrar
        .install(&parsed, &command)
        .await
        .context("Could not register the scheduled task")?;

    let listed: Vec<String> = parsed.iter().map(|t| t.format("%H:%M").to_string()).collect();
    println!("Scheduled daily runs at {}", listed.join(", "));
    Ok(())
}

pub async fn remove_schedule(config_manager: &FileConfigManager, registrar: &dyn TaskRegistrar) -> Result<()> {
    info!("Removing scheduled task for {}", config_manager.path().display());
    registrar
        .remove()
        .await
        .context("Could not remove the scheduled task")?;
    println!("Scheduled task removed");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub total_listings: usize,
    pub sites: BTreeMap<String, usize>,
    pub failures: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

impl From<&AggregateRun> for RunSummary {
    fn from(run: &AggregateRun) -> Self {
        Self {
            id: run.id,
            finished_at: run.finished_at,
            status: run.status,
            total_listings: run.total_listings(),
            sites: run
                .site_counts()
                .into_iter()
                .map(|(site, count)| (site.to_string(), count))
                .collect(),
            failures: run
                .failures()
                .into_iter()
                .map(|(site, error)| (site.to_string(), error.to_string()))
                .collect(),
            warnings: run.warnings.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub registration: RegistrationStatus,
    pub schedule_enabled: bool,
    pub configured_times: Vec<String>,
    pub next_slot: Option<NaiveDateTime>,
    pub last_scheduled_run: Option<NaiveDateTime>,
    pub latest_run: Option<RunSummary>,
}

/// Registration failures are folded into the report rather than returned,
/// so the rest of the status is still shown.
pub async fn gather_status(config: &Config, registrar: &dyn TaskRegistrar, now: NaiveDateTime) -> StatusReport {
    let registration = match registrar.status().await {
        Ok(status) => status,
        Err(e) => {
            warn!("Could not query the scheduled task: {}", e);
            RegistrationStatus {
                detail: Some(e.to_string()),
                ..RegistrationStatus::default()
            }
        }
    };
    let times = config.schedule.parsed_times().unwrap_or_default();
    let state = ScheduleState::load(&config.output.schedule_state_path());
    let latest = JsonResultStore::new(config.output.results_path()).load().await;

    StatusReport {
        registration,
        schedule_enabled: config.schedule.enabled,
        configured_times: config.schedule.times.clone(),
        next_slot: next_slot(now, &times),
        last_scheduled_run: state.last_run,
        latest_run: latest.as_ref().map(RunSummary::from),
    }
}

fn print_status(report: &StatusReport) {
    let registration = &report.registration;
    if registration.installed {
        println!(
            "Scheduled task: installed ({})",
            if registration.enabled { "enabled" } else { "disabled" }
        );
        if !registration.times.is_empty() {
            println!("  times: {}", registration.times.join(", "));
        }
        if let Some(next) = &registration.next_run {
            println!("  next run: {}", next);
        }
        if let Some(last) = &registration.last_run {
            println!("  last run: {}", last);
        }
    } else {
        println!("Scheduled task: not installed");
    }
    if let Some(detail) = &registration.detail {
        println!("  {}", detail);
    }

    println!(
        "Daemon schedule: {} at {}",
        if report.schedule_enabled { "enabled" } else { "disabled" },
        report.configured_times.join(", ")
    );
    if let Some(next) = report.next_slot {
        println!("  next slot: {}", next.format("%Y-%m-%d %H:%M"));
    }
    match report.last_scheduled_run {
        Some(last) => println!("  last scheduled run: {}", last.format("%Y-%m-%d %H:%M")),
        None => println!("  last scheduled run: never"),
    }

    match &report.latest_run {
        Some(run) => {
            println!(
                "Latest run: {} {}, {} listing(s)",
                run.finished_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                run.status,
                run.total_listings
            );
            for (site, count) in &run.sites {
                match run.failures.get(site) {
                    Some(error) => println!("  {}: {} ({})", site, count, error),
                    None => println!("  {}: {}", site, count),
                }
            }
        }
        None => println!("Latest run: none"),
    }
}

pub async fn status(config_manager: &FileConfigManager, registrar: &dyn TaskRegistrar, json: bool) -> Result<()> {
    let config = config_manager
        .load_config()
        .await
        .context("Failed to load configuration")?;
    let report = gather_status(&config, registrar, Local::now().naive_local()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_status(&report);
    }
    Ok(())
}

pub async fn results(config_manager: &FileConfigManager, json: bool) -> Result<()> {
    let config = config_manager
        .load_config()
        .await
        .context("Failed to load configuration")?;
    let Some(run) = JsonResultStore::new(config.output.results_path()).load().await else {
        println!("No results yet; try `run-now`");
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!(
        "{} listing(s) from {} ({})",
        run.total_listings(),
        run.finished_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        run.status
    );
    for listing in &run.listings {
        let price = listing
            .price
            .map(crate::notifier::report::format_price)
            .unwrap_or_else(|| "-".to_string());
        println!("[{}] {} | {} | {}", listing.source_site, listing.title, price, listing.url);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_schedule_time;
    use crate::error::CrawlerError;
    use crate::parser::Listing;
    use crate::scheduler::registrar::MockTaskRegistrar;
    use crate::scrapers::ScrapeResult;
    use chrono::{NaiveDate, NaiveTime};
    use std::time::Duration;
    use tempfile::tempdir;

    fn t(text: &str) -> NaiveTime {
        parse_schedule_time(text).unwrap()
    }

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.output.directory = dir.to_path_buf();
        config.schedule.times = vec!["15:00".to_string(), "03:00".to_string()];
        config
    }

    #[test]
    fn test_overrides_replace_only_given_fields() {
        let mut config = Config::default();
        let overrides = RunOverrides {
            location: Some("Tacoma, WA".to_string()),
            property_types: vec![PropertyType::Retail],
            max_price: Some(3_000_000),
            headed: true,
            ..RunOverrides::default()
        };
        overrides.apply(&mut config);

        assert_eq!(config.search.location, "Tacoma, WA");
        assert_eq!(config.search.property_types.len(), 1);
        assert_eq!(config.search.max_price, Some(3_000_000));
        assert_eq!(config.search.min_price, None);
        assert_eq!(config.search.target_sites, SearchCriteria::default().target_sites);
        assert!(!config.scraping.headless);
    }

    #[test]
    fn test_terminal_events_map_to_matching_errors() {
        let rejected = run_outcome(RunEvent::RunRejected {
            reason: "location cannot be blank".to_string(),
        });
        assert!(matches!(rejected, Some(Err(CrawlerError::Validation(reason))) if reason == "location cannot be blank"));

        let aborted = run_outcome(RunEvent::RunAborted {
            error: "run task failed: task 7 panicked".to_string(),
        });
        assert!(matches!(aborted, Some(Err(CrawlerError::Internal(_)))));

        let progress = run_outcome(RunEvent::SiteStarted {
            site: "loopnet".to_string(),
        });
        assert!(progress.is_none());

        let run = AggregateRun::empty(SearchCriteria::default(), "nothing selected");
        let id = run.id;
        match run_outcome(RunEvent::RunFinished { run: Box::new(run) }) {
            Some(Ok(finished)) => assert_eq!(finished.id, id),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_install_uses_given_times_and_run_scheduled_entry() {
        let temp_dir = tempdir().unwrap();
        let manager = FileConfigManager::new(temp_dir.path().join("config.toml"));

        let mut registrar = MockTaskRegistrar::new();
        registrar
            .expect_install()
            .withf(|times, command| {
                times.len() == 2
                    && times[0] == t("03:00")
                    && times[1] == t("15:30")
                    && command.args.last().map(String::as_str) == Some("run-scheduled")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        install_schedule(&manager, &["15:30".to_string(), "03:00".to_string()], &registrar)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_install_rejects_bad_time() {
        let temp_dir = tempdir().unwrap();
        let manager = FileConfigManager::new(temp_dir.path().join("config.toml"));
        let mut registrar = MockTaskRegistrar::new();
        registrar.expect_install().never();

        let err = install_schedule(&manager, &["25:99".to_string()], &registrar).await.unwrap_err();
        assert!(err.to_string().contains("25:99"));
    }

    #[tokio::test]
    async fn test_registration_failure_is_reported() {
        let temp_dir = tempdir().unwrap();
        let manager = FileConfigManager::new(temp_dir.path().join("config.toml"));
        let mut registrar = MockTaskRegistrar::new();
        registrar
            .expect_install()
            .returning(|_, _| Err(CrawlerError::Schedule("access denied".to_string())));

        let err = install_schedule(&manager, &[], &registrar).await.unwrap_err();
        assert!(format!("{:#}", err).contains("access denied"));
    }

    #[tokio::test]
    async fn test_remove_delegates_to_registrar() {
        let temp_dir = tempdir().unwrap();
        let manager = FileConfigManager::new(temp_dir.path().join("config.toml"));
        let mut registrar = MockTaskRegistrar::new();
        registrar.expect_remove().times(1).returning(|| Ok(()));

        remove_schedule(&manager, &registrar).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_combines_registration_state_and_latest_run() {
        let temp_dir = tempdir().unwrap();
        let config = config_in(temp_dir.path());

        let listing = Listing::new("loopnet", "1 Pine St", "https://www.loopnet.com/Listing/1/");
        let run = AggregateRun::assemble(
            Uuid::new_v4(),
            Utc::now(),
            SearchCriteria::default(),
            vec![
                ScrapeResult::success("loopnet", vec![listing], Duration::from_secs(30)),
                ScrapeResult::failed("commercialmls", "navigation failed", Duration::from_secs(5)),
            ],
        );
        JsonResultStore::new(config.output.results_path()).save(&run).await.unwrap();

        let now = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap().and_hms_opt(12, 0, 0).unwrap();
        ScheduleState::record(&config.output.schedule_state_path(), now).unwrap();

        let mut registrar = MockTaskRegistrar::new();
        registrar.expect_status().returning(|| {
            Ok(RegistrationStatus {
                installed: true,
                enabled: true,
                times: vec!["03:00".to_string()],
                ..RegistrationStatus::default()
            })
        });

        let report = gather_status(&config, &registrar, now).await;

        assert!(report.registration.installed);
        assert_eq!(report.next_slot, Some(now.date().and_time(t("15:00"))));
        assert_eq!(report.last_scheduled_run, Some(now));
        let latest = report.latest_run.unwrap();
        assert_eq!(latest.id, run.id);
        assert_eq!(latest.status, RunStatus::PartialSuccess);
        assert_eq!(latest.sites.get("loopnet"), Some(&1));
        assert_eq!(latest.failures.get("commercialmls").map(String::as_str), Some("navigation failed"));
    }

    #[tokio::test]
    async fn test_status_without_anything_installed_or_run() {
        let temp_dir = tempdir().unwrap();
        let config = config_in(temp_dir.path());
        let mut registrar = MockTaskRegistrar::new();
        registrar
            .expect_status()
            .returning(|| Err(CrawlerError::Schedule("crontab not found".to_string())));

        let now = Local::now().naive_local();
        let report = gather_status(&config, &registrar, now).await;

        assert!(!report.registration.installed);
        assert!(report.registration.detail.unwrap().contains("crontab not found"));
        assert!(report.last_scheduled_run.is_none());
        assert!(report.latest_run.is_none());
        assert!(report.next_slot.is_some());
    }
}
