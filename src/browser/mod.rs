pub mod session;
pub mod stealth;

pub use session::{BrowserSession, BrowserSettings};
pub use stealth::{ActionPacer, FingerprintRandomizer, StealthProfile, UserAgentGenerator};
