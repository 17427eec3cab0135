pub mod criteria;

pub use criteria::{normalize_site_key, PropertyType, SearchCriteria};

use chrono::NaiveTime;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{CrawlerError, Result};

pub const DEFAULT_ENV_PREFIX: &str = "CRE_CRAWLER";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub search: SearchCriteria,
    pub scraping: ScrapingConfig,
    pub notification: NotificationConfig,
    pub schedule: ScheduleConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScrapingConfig {
    /// Hard ceiling for one site's whole search, retries included.
    #[serde(with = "humantime_serde")]
    pub site_timeout: Duration,
    /// Bound on any single wait for a page element.
    #[serde(with = "humantime_serde")]
    pub step_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub navigation_timeout: Duration,
    pub max_retries: u32,
    pub headless: bool,
    pub min_action_delay_ms: u64,
    pub max_action_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub recipient: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    // usually supplied through CRE_CRAWLER__NOTIFICATION__PASSWORD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl NotificationConfig {
    pub fn has_credentials(&self) -> bool {
        !self.username.trim().is_empty()
            && self.password.as_deref().map_or(false, |p| !p.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// Daily trigger times, `HH:MM` local time.
    pub times: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl ScheduleConfig {
    pub fn parsed_times(&self) -> Result<Vec<NaiveTime>> {
        let mut times = self
            .times
            .iter()
            .map(|t| parse_schedule_time(t))
            .collect::<Result<Vec<_>>>()?;
        times.sort();
        times.dedup();
        Ok(times)
    }
}

pub fn parse_schedule_time(text: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M").map_err(|_| {
        CrawlerError::Config(format!("invalid schedule time '{}', expected HH:MM", text))
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl OutputConfig {
    pub fn results_path(&self) -> PathBuf {
        self.directory.join("latest_results.json")
    }

    pub fn schedule_state_path(&self) -> PathBuf {
        self.directory.join("schedule_state.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search: SearchCriteria::default(),
            scraping: ScrapingConfig {
                site_timeout: Duration::from_secs(600),
                step_timeout: Duration::from_secs(15),
                navigation_timeout: Duration::from_secs(45),
                max_retries: 1,
                headless: true,
                min_action_delay_ms: 300,
                max_action_delay_ms: 1200,
            },
            notification: NotificationConfig {
                enabled: false,
                recipient: String::new(),
                smtp_host: "smtp.gmail.com".to_string(),
                smtp_port: 587,
                username: String::new(),
                password: None,
            },
            schedule: ScheduleConfig {
                enabled: false,
                times: vec!["03:00".to_string()],
                poll_interval: Duration::from_secs(30),
            },
            output: OutputConfig {
                directory: PathBuf::from("./crawler_data"),
            },
        }
    }
}

#[async_trait::async_trait]
pub trait ConfigManager {
    async fn load_config(&self) -> Result<Config>;
    async fn save_config(&self, config: &Config) -> Result<()>;
    async fn watch_config_changes(&self) -> Result<mpsc::Receiver<Config>>;
    fn validate_config(&self, config: &Config) -> Result<()>;
}

pub struct FileConfigManager {
    config_path: PathBuf,
    env_prefix: String,
}

impl FileConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.config_path
    }
}

#[async_trait::async_trait]
impl ConfigManager for FileConfigManager {
    async fn load_config(&self) -> Result<Config> {
        info!("Loading configuration from {:?}", self.config_path);

        if !self.config_path.exists() {
            warn!("Configuration file not found, creating default config at {:?}", self.config_path);
            self.create_default_config()?;
        }

        // file first, then CRE_CRAWLER__SECTION__KEY overrides
        let layered = ::config::Config::builder()
            .add_source(
                ::config::File::from(self.config_path.as_path())
                    .format(::config::FileFormat::Toml),
            )
            .add_source(
                ::config::Environment::with_prefix(&self.env_prefix)
                    .separator("__"),
            )
            .build()?;

        let config: Config = layered.try_deserialize()?;
        self.validate_config(&config)?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    async fn save_config(&self, config: &Config) -> Result<()> {
        info!("Saving configuration to {:?}", self.config_path);
        self.validate_config(config)?;

        let toml_content = toml::to_string_pretty(config)?;
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| CrawlerError::Config(format!("Failed to create config directory: {}", e)))?;
            }
        }
        fs::write(&self.config_path, toml_content)
            .map_err(|e| CrawlerError::Config(format!("Failed to write config file: {}", e)))?;

        info!("Configuration saved successfully");
        Ok(())
    }

    async fn watch_config_changes(&self) -> Result<mpsc::Receiver<Config>> {
        let (tx, rx) = mpsc::channel(10);
        let config_path = self.config_path.clone();
        let reloader = FileConfigManager::new(config_path.clone()).with_env_prefix(self.env_prefix.clone());

        tokio::spawn(async move {
            if let Err(e) = Self::watch_config_file(config_path, tx, reloader).await {
                error!("Configuration file watcher error: {}", e);
            }
        });

        Ok(rx)
    }

    fn validate_config(&self, config: &Config) -> Result<()> {
        debug!("Validating configuration");

        config
            .search
            .validate()
            .map_err(|e| CrawlerError::Config(format!("[search] {}", e)))?;

        let scraping = &config.scraping;
        if scraping.site_timeout.is_zero() {
            return Err(CrawlerError::Config("site_timeout must be greater than 0".to_string()));
        }
        if scraping.step_timeout.is_zero() || scraping.navigation_timeout.is_zero() {
            return Err(CrawlerError::Config("step and navigation timeouts must be greater than 0".to_string()));
        }
        if scraping.max_retries > 3 {
            return Err(CrawlerError::Config("max_retries cannot exceed 3".to_string()));
        }
        if scraping.min_action_delay_ms > scraping.max_action_delay_ms {
            return Err(CrawlerError::Config("action delay minimum must not exceed maximum".to_string()));
        }

        let notification = &config.notification;
        if notification.enabled {
            if !notification.recipient.contains('@') {
                return Err(CrawlerError::Config(format!(
                    "notification recipient '{}' is not an email address",
                    notification.recipient
                )));
            }
            if notification.username.trim().is_empty() {
                return Err(CrawlerError::Config("notification username is required when notifications are enabled".to_string()));
            }
            if notification.smtp_host.trim().is_empty() {
                return Err(CrawlerError::Config("smtp_host cannot be empty".to_string()));
            }
        }

        let times = config.schedule.parsed_times()?;
        if config.schedule.enabled && times.is_empty() {
            return Err(CrawlerError::Config("an enabled schedule needs at least one time".to_string()));
        }
        if config.schedule.poll_interval.is_zero() {
            return Err(CrawlerError::Config("poll_interval must be greater than 0".to_string()));
        }

        debug!("Configuration validation passed");
        Ok(())
    }
}

impl FileConfigManager {
    fn create_default_config(&self) -> Result<()> {
        let toml_content = toml::to_string_pretty(&Config::default())?;

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| CrawlerError::Config(format!("Failed to create config directory: {}", e)))?;
            }
        }

        fs::write(&self.config_path, toml_content)
            .map_err(|e| CrawlerError::Config(format!("Failed to write default config: {}", e)))?;

        info!("Default configuration file created at {:?}", self.config_path);
        Ok(())
    }

    async fn watch_config_file(
        config_path: PathBuf,
        tx: mpsc::Sender<Config>,
        reloader: FileConfigManager,
    ) -> Result<()> {
        let (file_tx, mut file_rx) = mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Err(e) = file_tx.blocking_send(event) {
                    error!("Failed to send file system event: {}", e);
                }
            }
            Err(e) => error!("File system watcher error: {}", e),
        })?;

        let watch_path = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&watch_path, RecursiveMode::NonRecursive)?;

        info!("Started watching configuration file: {:?}", config_path);
        let file_name = config_path.file_name().map(|n| n.to_os_string());

        while let Some(event) = file_rx.recv().await {
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                continue;
            }
            let ours = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if !ours {
                continue;
            }

            debug!("Configuration file changed, reloading...");
            // editors write in several steps
            tokio::time::sleep(Duration::from_millis(100)).await;

            match reloader.load_config().await {
                Ok(new_config) => {
                    info!("Configuration reloaded successfully");
                    if tx.send(new_config).await.is_err() {
                        debug!("Config receiver dropped, stopping watcher");
                        break;
                    }
                }
                Err(e) => error!("Failed to reload configuration: {}", e),
            }
        }

        Ok(())
    }
}
