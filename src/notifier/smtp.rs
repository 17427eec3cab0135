use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::debug;

use crate::config::NotificationConfig;
use crate::error::{CrawlerError, Result};
use crate::notifier::{MailTransport, OutgoingMail};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// STARTTLS submission with username/password login, sending as the
/// authenticated account.
pub struct SmtpMailer {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
}

impl SmtpMailer {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    fn message(&self, mail: &OutgoingMail) -> Result<Message> {
        let from: Mailbox = self.username.parse()?;
        let to: Mailbox = mail.to.parse()?;
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(mail.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body.clone())?;
        Ok(message)
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        let password = self
            .password
            .clone()
            .ok_or_else(|| CrawlerError::Notification("no SMTP password configured".to_string()))?;
        let message = self.message(mail)?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)?
            .port(self.port)
            .credentials(Credentials::new(self.username.clone(), password))
            .timeout(Some(SMTP_TIMEOUT))
            .build();

        debug!("Sending '{}' to {} via {}:{}", mail.subject, mail.to, self.host, self.port);
        transport.send(message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn mailer(username: &str) -> SmtpMailer {
        let mut config = Config::default().notification;
        config.username = username.to_string();
        config.password = Some("app-password".to_string());
        SmtpMailer::new(&config)
    }

    fn mail(to: &str) -> OutgoingMail {
        OutgoingMail {
            to: to.to_string(),
            subject: "Commercial Real Estate Search Results - 0 Properties Found".to_string(),
            body: "No properties found matching your criteria.".to_string(),
        }
    }

    #[test]
    fn test_builds_plain_text_message() {
        let message = mailer("crawler@example.com").message(&mail("broker@example.com")).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("From: crawler@example.com"));
        assert!(raw.contains("To: broker@example.com"));
        assert!(raw.contains("Content-Type: text/plain"));
    }

    #[test]
    fn test_bad_recipient_is_notification_error() {
        let err = mailer("crawler@example.com").message(&mail("not an address")).unwrap_err();
        assert!(matches!(err, CrawlerError::Notification(_)));
    }

    #[tokio::test]
    async fn test_missing_password_fails_before_connecting() {
        let mut config = Config::default().notification;
        config.username = "crawler@example.com".to_string();
        let err = SmtpMailer::new(&config).send(&mail("broker@example.com")).await.unwrap_err();
        assert!(err.to_string().contains("no SMTP password"));
    }
}
