use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::browser::stealth::{automation_mask_script, overlay_removal_script, ActionPacer, FingerprintRandomizer, StealthProfile};
use crate::config::ScrapingConfig;
use crate::error::{CrawlerError, Result};

const LAUNCH_ATTEMPTS: u32 = 3;
const CLICK_ATTEMPTS: u64 = 3;
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Knobs a session needs, lifted out of the scraping config
#[derive(Debug, Clone, PartialEq)]
pub struct BrowserSettings {
    pub headless: bool,
    pub step_timeout: Duration,
    pub navigation_timeout: Duration,
    pub pacer: ActionPacer,
}

impl From<&ScrapingConfig> for BrowserSettings {
    fn from(config: &ScrapingConfig) -> Self {
        Self {
            headless: config.headless,
            step_timeout: config.step_timeout,
            navigation_timeout: config.navigation_timeout,
            pacer: ActionPacer::new(config.min_action_delay_ms, config.max_action_delay_ms),
        }
    }
}

/// A chromium process owned by exactly one scraper.
///
/// Each session gets its own user-data directory so concurrent sessions never
/// contend for profile locks. Dropping the session kills the browser process
/// and removes the directory; `close` does the same gracefully.
pub struct BrowserSession {
    site: &'static str,
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    user_data_dir: PathBuf,
    settings: BrowserSettings,
    profile: StealthProfile,
}

impl BrowserSession {
    pub async fn launch(site: &'static str, settings: BrowserSettings) -> Result<Self> {
        let profile = FingerprintRandomizer::new().generate_profile();
        let user_data_dir = std::env::temp_dir().join(format!(
            "cre-crawler-{}-{}-{}",
            site,
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&user_data_dir)?;

        let browser_config = Self::browser_config(&settings, &profile, &user_data_dir)?;

        info!("[{}] Launching browser (headless: {})", site, settings.headless);
        let mut last_error = None;
        for attempt in 1..=LAUNCH_ATTEMPTS {
            match Browser::launch(browser_config.clone()).await {
                Ok((mut browser, handler)) => {
                    let handler = tokio::spawn(async move {
                        let mut handler = handler;
                        while let Some(event) = handler.next().await {
                            if let Err(e) = event {
                                let message = e.to_string();
                                // chromium emits protocol events chromiumoxide has no type for
                                if message.contains("data did not match any variant") {
                                    debug!("Ignoring unknown CDP message: {}", e);
                                } else {
                                    warn!("Browser handler error: {}", e);
                                }
                            }
                        }
                        debug!("Browser handler task ended");
                    });

                    match Self::open_page(&browser, &profile, settings.step_timeout).await {
                        Ok(page) => {
                            info!("[{}] Browser ready on attempt {}", site, attempt);
                            return Ok(Self {
                                site,
                                browser,
                                page,
                                handler,
                                user_data_dir,
                                settings,
                                profile,
                            });
                        }
                        Err(e) => {
                            error!("[{}] Could not open a tab on attempt {}: {}", site, attempt, e);
                            let _ = browser.close().await;
                            handler.abort();
                            last_error = Some(e);
                        }
                    }
                }
                Err(e) => {
                    error!("[{}] Browser launch attempt {} failed: {}", site, attempt, e);
                    last_error = Some(CrawlerError::from(e));
                }
            }
            if attempt < LAUNCH_ATTEMPTS {
                sleep(Duration::from_secs(2)).await;
            }
        }

        let _ = std::fs::remove_dir_all(&user_data_dir);
        Err(CrawlerError::Browser(format!(
            "failed to launch browser after {} attempts: {}",
            LAUNCH_ATTEMPTS,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn browser_config(settings: &BrowserSettings, profile: &StealthProfile, user_data_dir: &Path) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .user_data_dir(user_data_dir)
            .window_size(profile.viewport.width, profile.viewport.height)
            .request_timeout(settings.navigation_timeout)
            .args(vec![
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--disable-extensions",
                "--mute-audio",
                "--no-first-run",
                "--disable-default-apps",
                "--disable-sync",
                "--disable-notifications",
                "--disable-popup-blocking",
                "--disable-blink-features=AutomationControlled",
                "--log-level=3",
            ]);

        if !settings.headless {
            builder = builder.with_head();
        }

        builder
            .build()
            .map_err(|e| CrawlerError::Browser(format!("Failed to create browser config: {}", e)))
    }

    async fn open_page(browser: &Browser, profile: &StealthProfile, limit: Duration) -> Result<Page> {
        let page = match timeout(limit, browser.new_page("about:blank")).await {
            Ok(page) => page?,
            Err(_) => return Err(CrawlerError::timeout("opening a browser tab", limit)),
        };

        let user_agent = SetUserAgentOverrideParams::builder()
            .user_agent(&profile.user_agent)
            .accept_language(&profile.language)
            .platform(&profile.platform)
            .build()
            .map_err(|e| CrawlerError::Browser(format!("Failed to build user agent params: {}", e)))?;
        page.execute(user_agent).await?;

        Ok(page)
    }

    pub fn site(&self) -> &'static str {
        self.site
    }

    pub fn step_timeout(&self) -> Duration {
        self.settings.step_timeout
    }

    /// Loads `url` and confirms the browser actually landed on `expected_domain`.
    pub async fn goto(&self, url: &str, expected_domain: &str) -> Result<()> {
        info!("[{}] Navigating to {}", self.site, url);
        let limit = self.settings.navigation_timeout;

        match timeout(limit, self.page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(CrawlerError::Navigation(format!("{}: {}", url, e))),
            Err(_) => return Err(CrawlerError::timeout(format!("loading {}", url), limit)),
        }

        let landed = self.current_url().await.unwrap_or_default();
        if !landed.contains(expected_domain) {
            return Err(CrawlerError::Navigation(format!(
                "expected to land on {} but browser is at '{}'",
                expected_domain, landed
            )));
        }

        if let Err(e) = self.evaluate(&automation_mask_script(&self.profile)).await {
            debug!("[{}] Automation mask not applied: {}", self.site, e);
        }
        self.pause().await;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    /// Polls for `css` until it appears or the step timeout runs out.
    pub async fn wait_for(&self, css: &str) -> Result<Element> {
        let limit = self.settings.step_timeout;
        let deadline = Instant::now() + limit;
        loop {
            if let Ok(element) = self.page.find_element(css).await {
                return Ok(element);
            }
            if Instant::now() >= deadline {
                return Err(CrawlerError::ElementNotFound(format!("'{}' after {:?}", css, limit)));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// First of `candidates` to show up within one step timeout.
    pub async fn wait_for_any(&self, candidates: &[&str]) -> Result<Element> {
        let limit = self.settings.step_timeout;
        let deadline = Instant::now() + limit;
        loop {
            for css in candidates {
                if let Ok(element) = self.page.find_element(*css).await {
                    return Ok(element);
                }
            }
            if Instant::now() >= deadline {
                return Err(CrawlerError::ElementNotFound(format!("any of {:?} after {:?}", candidates, limit)));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn exists(&self, css: &str) -> bool {
        self.page.find_element(css).await.is_ok()
    }

    pub async fn click(&self, css: &str) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=CLICK_ATTEMPTS {
            self.remove_overlays().await;
            let element = self.wait_for(css).await?;
            let _ = element.scroll_into_view().await;

            // final attempt goes through the DOM in case something still covers the element
            let clicked = if attempt < CLICK_ATTEMPTS {
                element.click().await.map(|_| ())
            } else {
                element.call_js_fn("function() { this.click(); }", false).await.map(|_| ())
            };

            match clicked {
                Ok(()) => {
                    self.pause().await;
                    return Ok(());
                }
                Err(e) => {
                    debug!("[{}] Click on '{}' failed (attempt {}): {}", self.site, css, attempt, e);
                    last_error = Some(CrawlerError::from(e));
                    sleep(Duration::from_millis(500 * attempt)).await;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CrawlerError::Browser(format!("could not click '{}'", css))))
    }

    /// Replaces the contents of an input with `text`.
    pub async fn fill(&self, css: &str, text: &str) -> Result<()> {
        let element = self.wait_for(css).await?;
        element.click().await?;
        element
            .call_js_fn(
                "function() { this.value = ''; this.dispatchEvent(new Event('input', { bubbles: true })); }",
                false,
            )
            .await?;
        element.type_str(text).await?;
        self.pause().await;
        Ok(())
    }

    /// `key` is a DOM key name such as `Enter`, `ArrowDown` or `Tab`.
    pub async fn press_key(&self, css: &str, key: &str) -> Result<()> {
        self.wait_for(css).await?.press_key(key).await?;
        self.pause().await;
        Ok(())
    }

    /// Sets a `<select>` by option value and fires `change`.
    pub async fn select_value(&self, css: &str, value: &str) -> Result<()> {
        let element = self.wait_for(css).await?;
        let quoted = serde_json::to_string(value)?;
        element
            .call_js_fn(
                format!(
                    "function() {{ this.value = {}; this.dispatchEvent(new Event('change', {{ bubbles: true }})); }}",
                    quoted
                ),
                false,
            )
            .await?;
        self.pause().await;
        Ok(())
    }

    pub async fn evaluate(&self, script: &str) -> Result<()> {
        self.page.evaluate(script).await?;
        Ok(())
    }

    pub async fn remove_overlays(&self) {
        if let Err(e) = self.evaluate(overlay_removal_script()).await {
            debug!("[{}] Overlay removal failed: {}", self.site, e);
        }
    }

    pub async fn content(&self) -> Result<String> {
        let limit = self.settings.step_timeout;
        match timeout(limit, self.page.content()).await {
            Ok(html) => Ok(html?),
            Err(_) => Err(CrawlerError::timeout("reading page content", limit)),
        }
    }

    pub async fn pause(&self) {
        sleep(self.settings.pacer.next_delay()).await;
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            debug!("[{}] Browser close request failed: {}", self.site, e);
        }
        if let Err(e) = self.browser.wait().await {
            debug!("[{}] Waiting for browser exit failed: {}", self.site, e);
        }
        info!("[{}] Browser session closed", self.site);
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!("Could not remove {:?}: {}", self.user_data_dir, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_settings_from_scraping_config() {
        let mut scraping = Config::default().scraping;
        scraping.headless = false;
        scraping.step_timeout = Duration::from_secs(7);

        let settings = BrowserSettings::from(&scraping);
        assert!(!settings.headless);
        assert_eq!(settings.step_timeout, Duration::from_secs(7));
        assert_eq!(settings.navigation_timeout, scraping.navigation_timeout);
        assert_eq!(settings.pacer, ActionPacer::new(300, 1200));
    }
}
