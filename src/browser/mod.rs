pub mod http;
pub mod proxy;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::browser::proxy::ProxyConfig;
use crate::storage::credentials::Credentials;

// Re-export common types
pub use http::HttpSession;
pub use session::WebDriverSession;

/// A page as returned by a session
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Login form of a target, used by the generic credentials strategy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginForm {
    pub url: String,
    pub username_field: String,
    pub password_field: String,
    #[serde(default)]
    pub submit_selector: Option<String>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The page could not be retrieved; the session itself is still usable
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    /// The automation session is gone and cannot serve further pages
    #[error("browser session lost: {0}")]
    Lost(String),
}

/// An automation session a worker fetches pages through
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Load a page and return its markup
    async fn fetch(&self, url: &str) -> Result<FetchedPage, SessionError>;

    /// Log in by filling and submitting a form
    async fn submit_login(&self, form: &LoginForm, credentials: &Credentials) -> Result<(), SessionError>;

    /// Attach credentials to every following request
    async fn set_basic_auth(&self, credentials: &Credentials) -> Result<(), SessionError>;

    /// Whether the session can still serve pages
    async fn is_alive(&self) -> bool;

    /// Whether several fetches may run on this session at once
    fn supports_parallel(&self) -> bool;

    /// Release the session
    async fn close(&self);
}

/// Which kind of session a target is scraped with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Http,
    Webdriver,
}

/// Session settings of a target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    #[serde(default)]
    pub kind: SessionKind,

    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Page load timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_webdriver_url() -> String {
    "http://localhost:4444".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            kind: SessionKind::Http,
            webdriver_url: default_webdriver_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Open the session described by `settings`
pub async fn open_session(
    settings: &SessionSettings,
    headless: bool,
    proxy: Option<&ProxyConfig>,
) -> anyhow::Result<Arc<dyn BrowserSession>> {
    match settings.kind {
        SessionKind::Http => Ok(Arc::new(HttpSession::new(settings, proxy)?)),
        SessionKind::Webdriver => Ok(Arc::new(WebDriverSession::connect(settings, headless, proxy).await?)),
    }
}
