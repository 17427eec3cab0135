use rand::Rng;
use std::time::Duration;

/// Identity presented by one browser session
#[derive(Debug, Clone, PartialEq)]
pub struct StealthProfile {
    pub user_agent: String,
    pub viewport: ViewportSize,
    pub language: String,
    pub platform: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

pub struct UserAgentGenerator {
    user_agents: Vec<&'static str>,
}

impl UserAgentGenerator {
    pub fn new() -> Self {
        Self {
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
            ],
        }
    }

    pub fn random_user_agent(&self) -> &'static str {
        let mut rng = rand::thread_rng();
        self.user_agents[rng.gen_range(0..self.user_agents.len())]
    }
}

impl Default for UserAgentGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Picks a plausible desktop profile. Listing sites serve a different,
/// card-less layout to narrow viewports, so only desktop sizes are used.
pub struct FingerprintRandomizer {
    viewports: Vec<ViewportSize>,
    languages: Vec<&'static str>,
    user_agents: UserAgentGenerator,
}

impl FingerprintRandomizer {
    pub fn new() -> Self {
        Self {
            viewports: vec![
                ViewportSize { width: 1920, height: 1080 },
                ViewportSize { width: 1536, height: 864 },
                ViewportSize { width: 1440, height: 900 },
                ViewportSize { width: 1600, height: 900 },
            ],
            languages: vec!["en-US,en;q=0.9", "en-US,en;q=0.8"],
            user_agents: UserAgentGenerator::new(),
        }
    }

    pub fn generate_profile(&self) -> StealthProfile {
        let mut rng = rand::thread_rng();
        let user_agent = self.user_agents.random_user_agent();
        StealthProfile {
            user_agent: user_agent.to_string(),
            viewport: self.viewports[rng.gen_range(0..self.viewports.len())],
            language: self.languages[rng.gen_range(0..self.languages.len())].to_string(),
            platform: platform_for(user_agent).to_string(),
        }
    }
}

impl Default for FingerprintRandomizer {
    fn default() -> Self {
        Self::new()
    }
}

// navigator.platform has to agree with the user agent string
fn platform_for(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows") {
        "Win32"
    } else if user_agent.contains("Macintosh") {
        "MacIntel"
    } else {
        "Linux x86_64"
    }
}

/// Random pause between UI actions, in `[min_ms, max_ms]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionPacer {
    min_ms: u64,
    max_ms: u64,
}

impl ActionPacer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: max_ms.max(min_ms),
        }
    }

    pub fn next_delay(&self) -> Duration {
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(self.min_ms..=self.max_ms))
    }
}

pub fn automation_mask_script(profile: &StealthProfile) -> String {
    let primary_language = profile.language.split(',').next().unwrap_or("en-US");
    format!(
        r#"
    (function() {{
        Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined }});
        Object.defineProperty(navigator, 'platform', {{ get: () => '{platform}' }});
        Object.defineProperty(navigator, 'languages', {{ get: () => ['{language}', 'en'] }});
        window.chrome = window.chrome || {{ runtime: {{}} }};
    }})();
    "#,
        platform = profile.platform,
        language = primary_language,
    )
}

/// Removes cookie banners and promo modals that intercept clicks. Filter
/// dialogs are left alone since the search flow drives them.
pub fn overlay_removal_script() -> &'static str {
    r#"
    (function() {
        const overlays = document.querySelectorAll(
            '.modal-backdrop, .cookie-banner, #onetrust-banner-sdk, .csgp-modal-overlay, [role="dialog"]'
        );
        let removed = 0;
        overlays.forEach(el => {
            const text = (el.className || '') + ' ' + (el.id || '');
            if (/filter/i.test(text)) { return; }
            el.remove();
            removed++;
        });
        document.body.style.overflow = 'auto';
        return removed;
    })();
    "#
}
