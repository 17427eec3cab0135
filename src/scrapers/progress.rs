use serde::Serialize;
use tokio::sync::mpsc;

use crate::scrapers::{AggregateRun, ScrapeStatus};

/// One step of a run, in the order it happened
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    SiteStarted {
        site: String,
    },
    SiteProgress {
        site: String,
        percent: u8,
        stage: String,
    },
    SiteFinished {
        site: String,
        status: ScrapeStatus,
        listings: usize,
        error: Option<String>,
    },
    /// Always the last event of a run that passed validation.
    RunFinished {
        run: Box<AggregateRun>,
    },
    /// The criteria failed validation; no scraper was started.
    RunRejected {
        reason: String,
    },
    /// The run itself broke down before producing a result.
    RunAborted {
        error: String,
    },
}

/// Handle a scraper uses to report how far along it is. Reporting never
/// blocks and never fails; events for a stream nobody reads are dropped.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    site: String,
    tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl ProgressSink {
    pub fn new(site: impl Into<String>, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self {
            site: site.into(),
            tx: Some(tx),
        }
    }

    pub fn disabled(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            tx: None,
        }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn report(&self, percent: u8, stage: impl Into<String>) {
        self.emit(RunEvent::SiteProgress {
            site: self.site.clone(),
            percent: percent.min(100),
            stage: stage.into(),
        });
    }

    pub(crate) fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_clamps_percent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new("loopnet", tx);
        sink.report(250, "reading results");

        match rx.try_recv().unwrap() {
            RunEvent::SiteProgress { site, percent, stage } => {
                assert_eq!(site, "loopnet");
                assert_eq!(percent, 100);
                assert_eq!(stage, "reading results");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        let sink = ProgressSink::disabled("commercialmls");
        sink.report(10, "opening");
        assert_eq!(sink.site(), "commercialmls");
    }

    #[test]
    fn test_report_after_receiver_dropped_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        ProgressSink::new("loopnet", tx).report(50, "filters");
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = RunEvent::SiteStarted { site: "loopnet".to_string() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "site_started");
        assert_eq!(json["site"], "loopnet");
    }
}
