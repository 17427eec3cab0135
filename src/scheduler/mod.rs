pub mod registrar;

pub use registrar::{platform_registrar, CrontabRegistrar, RegistrationStatus, SchtasksRegistrar, TaskCommand, TaskRegistrar};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::storage::{read_json, write_json};

/// Latest slot at or before `now`, looking back as far as yesterday.
pub fn most_recent_slot(now: NaiveDateTime, times: &[NaiveTime]) -> Option<NaiveDateTime> {
    let today = now.date();
    let yesterday = today - ChronoDuration::days(1);
    times
        .iter()
        .flat_map(|t| [today.and_time(*t), yesterday.and_time(*t)])
        .filter(|slot| *slot <= now)
        .max()
}

/// First slot strictly after `now`.
pub fn next_slot(now: NaiveDateTime, times: &[NaiveTime]) -> Option<NaiveDateTime> {
    let today = now.date();
    let tomorrow = today + ChronoDuration::days(1);
    times
        .iter()
        .flat_map(|t| [today.and_time(*t), tomorrow.and_time(*t)])
        .filter(|slot| *slot > now)
        .min()
}

/// Whether a run is owed: the most recent slot passed after the last run.
///
/// However many slots were missed while the machine was off, this turns
/// false again as soon as one run is recorded, so catch-up happens once.
/// Without a recorded run nothing is owed.
pub fn is_due(now: NaiveDateTime, times: &[NaiveTime], last_run: Option<NaiveDateTime>) -> bool {
    match (most_recent_slot(now, times), last_run) {
        (Some(slot), Some(last)) => last < slot,
        _ => false,
    }
}

/// Contents of `schedule_state.json`. Times are local wall-clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub last_run: Option<NaiveDateTime>,
}

impl ScheduleState {
    pub fn load(path: &Path) -> Self {
        read_json(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// Records a scheduled run that started at `at`.
    pub fn record(path: &Path, at: NaiveDateTime) -> Result<Self> {
        let state = Self { last_run: Some(at) };
        state.save(path)?;
        Ok(state)
    }
}

/// The work done when a slot comes due.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run(&self, config: &Config) -> Result<()>;
}

/// In-process trigger that polls the configured slots and runs the job when
/// one is owed, catching up once after downtime.
pub struct Scheduler<J> {
    config: Config,
    state_path: PathBuf,
    state: ScheduleState,
    job: J,
}

impl<J: ScheduledJob> Scheduler<J> {
    pub fn new(config: Config, job: J) -> Self {
        let state_path = config.output.schedule_state_path();
        let state = ScheduleState::load(&state_path);
        Self {
            config,
            state_path,
            state,
            job,
        }
    }

    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    pub fn update_config(&mut self, config: Config) {
        let state_path = config.output.schedule_state_path();
        if state_path != self.state_path {
            self.state = ScheduleState::load(&state_path);
            self.state_path = state_path;
        }
        info!("Schedule updated: enabled={}, times={:?}", config.schedule.enabled, config.schedule.times);
        self.config = config;
    }

    /// One poll. Returns whether the job ran.
    pub async fn tick(&mut self, now: NaiveDateTime) -> Result<bool> {
        if !self.config.schedule.enabled {
            return Ok(false);
        }
        let times = self.config.schedule.parsed_times()?;

        if self.state.last_run.is_none() {
            info!("No previous scheduled run recorded, starting the schedule from {}", now);
            self.state = ScheduleState::record(&self.state_path, now)?;
            return Ok(false);
        }

        if !is_due(now, &times, self.state.last_run) {
            debug!("Nothing due at {}", now);
            return Ok(false);
        }

        info!(
            "Scheduled slot {:?} is due (last run {:?})",
            most_recent_slot(now, &times),
            self.state.last_run
        );
        // recorded first so a failing job is not retried every tick
        self.state = ScheduleState::record(&self.state_path, now)?;
        if let Err(e) = self.job.run(&self.config).await {
            error!("Scheduled run failed: {}", e);
        }
        Ok(true)
    }

    /// Polls until `shutdown` resolves, applying config updates as they arrive.
    ///
    /// Shutdown also interrupts a job in progress; the slot stays recorded, so
    /// the interrupted run is not repeated on restart. Config updates that
    /// arrive during a job are applied once it finishes.
    pub async fn run_until<F>(mut self, mut config_updates: mpsc::Receiver<Config>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(self.config.schedule.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("Scheduler started, polling every {:?}", self.config.schedule.poll_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler stopping");
                    return Ok(());
                }
                Some(config) = config_updates.recv() => {
                    let poll_interval = config.schedule.poll_interval;
                    if poll_interval != self.config.schedule.poll_interval {
                        ticker = interval(poll_interval);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                    self.update_config(config);
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = &mut shutdown => {
                            info!("Scheduler stopping, abandoning the run in progress");
                            return Ok(());
                        }
                        ticked = self.tick(Local::now().naive_local()) => {
                            if let Err(e) = ticked {
                                warn!("Scheduler tick failed: {}", e);
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn times(list: &[&str]) -> Vec<NaiveTime> {
        list.iter().map(|t| crate::config::parse_schedule_time(t).unwrap()).collect()
    }

    #[test]
    fn test_most_recent_slot() {
        let slots = times(&["03:00", "15:00"]);
        assert_eq!(most_recent_slot(at(10, 12, 0), &slots), Some(at(10, 3, 0)));
        assert_eq!(most_recent_slot(at(10, 15, 0), &slots), Some(at(10, 15, 0)));
        assert_eq!(most_recent_slot(at(10, 2, 59), &slots), Some(at(9, 15, 0)));
        assert_eq!(most_recent_slot(at(10, 2, 59), &[]), None);
    }

    #[test]
    fn test_next_slot_rolls_over_midnight() {
        let slots = times(&["03:00", "15:00"]);
        assert_eq!(next_slot(at(10, 3, 0), &slots), Some(at(10, 15, 0)));
        assert_eq!(next_slot(at(10, 16, 0), &slots), Some(at(11, 3, 0)));
    }

    #[test]
    fn test_due_after_slot_passes() {
        let slots = times(&["03:00"]);
        assert!(!is_due(at(10, 2, 0), &slots, Some(at(9, 3, 0))));
        assert!(is_due(at(10, 3, 0), &slots, Some(at(9, 3, 0))));
        assert!(!is_due(at(10, 3, 1), &slots, Some(at(10, 3, 0))));
    }

    #[test]
    fn test_missed_slots_catch_up_once() {
        let slots = times(&["03:00", "15:00"]);
        // machine was off for three days
        let now = at(13, 9, 0);
        assert!(is_due(now, &slots, Some(at(10, 3, 0))));
        // after the catch-up run nothing else is owed until the next slot
        assert!(!is_due(at(13, 9, 1), &slots, Some(now)));
        assert!(!is_due(at(13, 14, 59), &slots, Some(now)));
        assert!(is_due(at(13, 15, 0), &slots, Some(now)));
    }

    #[test]
    fn test_never_run_is_not_due() {
        assert!(!is_due(at(10, 12, 0), &times(&["03:00"]), None));
    }

    #[test]
    fn test_state_round_trip_and_corrupt_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("schedule_state.json");
        assert_eq!(ScheduleState::load(&path), ScheduleState::default());

        ScheduleState::record(&path, at(10, 3, 0)).unwrap();
        assert_eq!(ScheduleState::load(&path).last_run, Some(at(10, 3, 0)));

        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(ScheduleState::load(&path), ScheduleState::default());
    }

    struct CountingJob(Arc<AtomicUsize>);

    #[async_trait]
    impl ScheduledJob for CountingJob {
        async fn run(&self, _config: &Config) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scheduler_in(dir: &Path, runs: Arc<AtomicUsize>) -> Scheduler<CountingJob> {
        let mut config = Config::default();
        config.output.directory = dir.to_path_buf();
        config.schedule.enabled = true;
        config.schedule.times = vec!["03:00".to_string()];
        Scheduler::new(config, CountingJob(runs))
    }

    #[tokio::test]
    async fn test_first_start_only_records_baseline() {
        let temp_dir = tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = scheduler_in(temp_dir.path(), runs.clone());

        assert!(!scheduler.tick(at(10, 12, 0)).await.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.state().last_run, Some(at(10, 12, 0)));

        // next slot arrives
        assert!(scheduler.tick(at(11, 3, 0)).await.unwrap());
        assert!(!scheduler.tick(at(11, 3, 1)).await.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_after_downtime_runs_once() {
        let temp_dir = tempdir().unwrap();
        ScheduleState::record(&temp_dir.path().join("schedule_state.json"), at(5, 3, 0)).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = scheduler_in(temp_dir.path(), runs.clone());
        for minute in 0..10 {
            scheduler.tick(at(9, 8, minute)).await.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_schedule_never_runs() {
        let temp_dir = tempdir().unwrap();
        ScheduleState::record(&temp_dir.path().join("schedule_state.json"), at(5, 3, 0)).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = scheduler_in(temp_dir.path(), runs.clone());
        let mut config = Config::default();
        config.output.directory = temp_dir.path().to_path_buf();
        config.schedule.enabled = false;
        scheduler.update_config(config);

        assert!(!scheduler.tick(at(9, 8, 0)).await.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    struct StuckJob(Arc<AtomicUsize>);

    #[async_trait]
    impl ScheduledJob for StuckJob {
        async fn run(&self, _config: &Config) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<Result<()>>().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_a_running_job() {
        let temp_dir = tempdir().unwrap();
        let state_path = temp_dir.path().join("schedule_state.json");
        // last run two days ago, so the first poll is due
        ScheduleState::record(&state_path, Local::now().naive_local() - ChronoDuration::days(2)).unwrap();

        let mut config = Config::default();
        config.output.directory = temp_dir.path().to_path_buf();
        config.schedule.enabled = true;
        config.schedule.times = vec!["03:00".to_string()];
        let started = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(config, StuckJob(started.clone()));
        let (_tx, rx) = mpsc::channel(1);

        let stopped = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            scheduler.run_until(rx, tokio::time::sleep(std::time::Duration::from_millis(200))),
        )
        .await;

        assert!(matches!(stopped, Ok(Ok(()))));
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(ScheduleState::load(&state_path).last_run > Some(Local::now().naive_local() - ChronoDuration::hours(1)));
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let temp_dir = tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_in(temp_dir.path(), runs);
        let (_tx, rx) = mpsc::channel(1);

        let stopped = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            scheduler.run_until(rx, tokio::time::sleep(std::time::Duration::from_millis(50))),
        )
        .await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }
}
