pub mod report;
pub mod smtp;

pub use report::Report;
pub use smtp::SmtpMailer;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::error::Result;
use crate::scrapers::AggregateRun;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent { recipient: String },
    Skipped(String),
    Failed(String),
}

impl fmt::Display for NotifyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyOutcome::Sent { recipient } => write!(f, "report emailed to {}", recipient),
            NotifyOutcome::Skipped(reason) => write!(f, "email skipped: {}", reason),
            NotifyOutcome::Failed(error) => write!(f, "email failed: {}", error),
        }
    }
}

/// Emails the report for a finished run.
///
/// Never returns an error; a send failure is logged and reported as
/// `NotifyOutcome::Failed` so it cannot affect the run it describes.
pub struct Notifier {
    config: NotificationConfig,
    transport: Arc<dyn MailTransport>,
}

impl Notifier {
    pub fn new(config: NotificationConfig, transport: Arc<dyn MailTransport>) -> Self {
        Self { config, transport }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(config.clone(), Arc::new(SmtpMailer::new(config)))
    }

    /// Configured recipient, or the sending account when none is set.
    pub fn recipient(&self) -> &str {
        if self.config.recipient.trim().is_empty() {
            self.config.username.trim()
        } else {
            self.config.recipient.trim()
        }
    }

    pub async fn notify(&self, run: &AggregateRun, previous: Option<&AggregateRun>) -> NotifyOutcome {
        if !self.config.enabled {
            return NotifyOutcome::Skipped("notifications are disabled".to_string());
        }
        if !self.config.has_credentials() {
            warn!("Email credentials not configured, skipping report");
            return NotifyOutcome::Skipped("email credentials are not configured".to_string());
        }

        let recipient = self.recipient().to_string();
        let report = Report::build(run, previous);
        let mail = OutgoingMail {
            to: recipient.clone(),
            subject: report.subject,
            body: report.body,
        };

        match self.transport.send(&mail).await {
            Ok(()) => {
                info!("Emailed results of run {} to {}", run.id, recipient);
                NotifyOutcome::Sent { recipient }
            }
            Err(e) => {
                warn!("Failed to email results of run {}: {}", run.id, e);
                NotifyOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SearchCriteria};
    use crate::error::CrawlerError;

    fn enabled_config() -> NotificationConfig {
        let mut config = Config::default().notification;
        config.enabled = true;
        config.username = "crawler@example.com".to_string();
        config.password = Some("app-password".to_string());
        config
    }

    fn run() -> AggregateRun {
        AggregateRun::empty(SearchCriteria::default(), "nothing selected")
    }

    #[tokio::test]
    async fn test_disabled_is_skipped_without_sending() {
        let mut transport = MockMailTransport::new();
        transport.expect_send().never();
        let mut config = enabled_config();
        config.enabled = false;

        let outcome = Notifier::new(config, Arc::new(transport)).notify(&run(), None).await;
        assert!(matches!(outcome, NotifyOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_skipped() {
        let mut transport = MockMailTransport::new();
        transport.expect_send().never();
        let mut config = enabled_config();
        config.password = None;

        let outcome = Notifier::new(config, Arc::new(transport)).notify(&run(), None).await;
        assert_eq!(outcome, NotifyOutcome::Skipped("email credentials are not configured".to_string()));
    }

    #[tokio::test]
    async fn test_sends_report_to_account_when_no_recipient() {
        let mut transport = MockMailTransport::new();
        transport
            .expect_send()
            .withf(|mail| mail.to == "crawler@example.com" && mail.subject.ends_with("0 Properties Found"))
            .times(1)
            .returning(|_| Ok(()));

        let outcome = Notifier::new(enabled_config(), Arc::new(transport)).notify(&run(), None).await;
        assert_eq!(
            outcome,
            NotifyOutcome::Sent {
                recipient: "crawler@example.com".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_explicit_recipient_wins() {
        let mut config = enabled_config();
        config.recipient = "broker@example.com".to_string();
        let notifier = Notifier::new(config, Arc::new(MockMailTransport::new()));
        assert_eq!(notifier.recipient(), "broker@example.com");
    }

    #[tokio::test]
    async fn test_send_failure_is_reported_not_raised() {
        let mut transport = MockMailTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Err(CrawlerError::Notification("535 authentication failed".to_string())));

        let outcome = Notifier::new(enabled_config(), Arc::new(transport)).notify(&run(), None).await;
        match outcome {
            NotifyOutcome::Failed(error) => assert!(error.contains("535")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
