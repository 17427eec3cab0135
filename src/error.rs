use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrawlerError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrawlerError {
    #[error("Invalid search criteria: {0}")]
    Validation(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Navigation error: {0}")]
    Navigation(String),

    #[error("Timed out after {after:?} while {operation}")]
    Timeout { operation: String, after: Duration },

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Tear the browser session down and try the whole site once more.
    RetryOnce,
    /// Skip the current UI step and carry on with the rest of the flow.
    SkipStep,
    /// Give up on this site; other sites are unaffected.
    FailSite,
    /// Surface to whoever invoked the command.
    ReportToCaller,
}

impl CrawlerError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        CrawlerError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            CrawlerError::Navigation(_) => RecoveryStrategy::RetryOnce,
            CrawlerError::Timeout { .. } => RecoveryStrategy::RetryOnce,
            CrawlerError::Browser(_) => RecoveryStrategy::RetryOnce,
            CrawlerError::ElementNotFound(_) => RecoveryStrategy::SkipStep,
            CrawlerError::Parse(_) => RecoveryStrategy::FailSite,
            CrawlerError::Validation(_) => RecoveryStrategy::ReportToCaller,
            CrawlerError::Storage(_) => RecoveryStrategy::ReportToCaller,
            CrawlerError::Config(_) => RecoveryStrategy::ReportToCaller,
            CrawlerError::Notification(_) => RecoveryStrategy::ReportToCaller,
            CrawlerError::Schedule(_) => RecoveryStrategy::ReportToCaller,
            CrawlerError::Internal(_) => RecoveryStrategy::ReportToCaller,
        }
    }

    /// Whether a fresh browser session could plausibly succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        self.recovery_strategy() == RecoveryStrategy::RetryOnce
    }
}

impl From<std::io::Error> for CrawlerError {
    fn from(err: std::io::Error) -> Self {
        CrawlerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CrawlerError {
    fn from(err: serde_json::Error) -> Self {
        CrawlerError::Parse(err.to_string())
    }
}

impl From<toml::de::Error> for CrawlerError {
    fn from(err: toml::de::Error) -> Self {
        CrawlerError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for CrawlerError {
    fn from(err: toml::ser::Error) -> Self {
        CrawlerError::Config(err.to_string())
    }
}

impl From<config::ConfigError> for CrawlerError {
    fn from(err: config::ConfigError) -> Self {
        CrawlerError::Config(err.to_string())
    }
}

impl From<notify::Error> for CrawlerError {
    fn from(err: notify::Error) -> Self {
        CrawlerError::Config(format!("file watcher: {}", err))
    }
}

impl From<chromiumoxide::error::CdpError> for CrawlerError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        CrawlerError::Browser(err.to_string())
    }
}

impl From<lettre::error::Error> for CrawlerError {
    fn from(err: lettre::error::Error) -> Self {
        CrawlerError::Notification(err.to_string())
    }
}

impl From<lettre::address::AddressError> for CrawlerError {
    fn from(err: lettre::address::AddressError) -> Self {
        CrawlerError::Notification(format!("invalid address: {}", err))
    }
}

impl From<lettre::transport::smtp::Error> for CrawlerError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        CrawlerError::Notification(err.to_string())
    }
}
