use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::browser::proxy::ProxyConfig;
use crate::browser::{BrowserSession, FetchedPage, LoginForm, SessionError, SessionSettings};
use crate::storage::credentials::Credentials;

/// Enter key as understood by WebDriver `send_keys`
const ENTER_KEY: &str = "\u{E007}";

/// Browser session driven over WebDriver
pub struct WebDriverSession {
    /// WebDriver instance, taken on close
    driver: Mutex<Option<WebDriver>>,
}

impl WebDriverSession {
    /// Start a Chrome session on the WebDriver server named in `settings`
    pub async fn connect(
        settings: &SessionSettings,
        headless: bool,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Self> {
        let mut caps = DesiredCapabilities::chrome();

        caps.add_chrome_arg(&format!("--user-agent={}", settings.user_agent))?;

        if headless {
            caps.set_headless()?;
        }

        if let Some(proxy) = proxy {
            caps.add_chrome_arg(&format!("--proxy-server={}", proxy.to_browser_arg()?))?;
        }

        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;

        let driver = WebDriver::new(&settings.webdriver_url, caps)
            .await
            .context(format!("Failed to connect to WebDriver at {}", settings.webdriver_url))?;

        driver
            .set_page_load_timeout(Duration::from_secs(settings.timeout_secs))
            .await
            .context("Failed to set page load timeout")?;

        debug!("WebDriver session started (headless: {})", headless);

        Ok(Self {
            driver: Mutex::new(Some(driver)),
        })
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, SessionError> {
        let guard = self.driver.lock().await;
        let driver = guard
            .as_ref()
            .ok_or_else(|| SessionError::Lost("session already closed".to_string()))?;

        debug!("Navigating to: {}", url);
        if let Err(e) = driver.goto(url).await {
            // A navigation error on a dead session cannot be retried on the next page
            if driver.title().await.is_err() {
                return Err(SessionError::Lost(e.to_string()));
            }
            return Err(SessionError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            });
        }

        let body = driver.source().await.map_err(|e| SessionError::Fetch {
            url: url.to_string(),
            message: format!("failed to read page source: {}", e),
        })?;

        Ok(FetchedPage {
            url: url.to_string(),
            status: 200,
            body,
        })
    }

    async fn submit_login(&self, form: &LoginForm, credentials: &Credentials) -> Result<(), SessionError> {
        let guard = self.driver.lock().await;
        let driver = guard
            .as_ref()
            .ok_or_else(|| SessionError::Lost("session already closed".to_string()))?;

        let fail = |e: WebDriverError| SessionError::Fetch {
            url: form.url.clone(),
            message: e.to_string(),
        };

        driver.goto(&form.url).await.map_err(fail)?;

        let username = driver.find(By::Name(form.username_field.as_str())).await.map_err(fail)?;
        username.send_keys(credentials.username.as_str()).await.map_err(fail)?;

        let password = driver.find(By::Name(form.password_field.as_str())).await.map_err(fail)?;
        password.send_keys(credentials.password.as_str()).await.map_err(fail)?;

        match &form.submit_selector {
            Some(selector) => {
                let submit = driver.find(By::Css(selector.as_str())).await.map_err(fail)?;
                submit.click().await.map_err(fail)?;
            }
            None => password.send_keys(ENTER_KEY).await.map_err(fail)?,
        }

        debug!("Submitted login form at {}", form.url);
        Ok(())
    }

    async fn set_basic_auth(&self, _credentials: &Credentials) -> Result<(), SessionError> {
        Err(SessionError::Fetch {
            url: String::new(),
            message: "basic auth is not supported by WebDriver sessions; configure a login form".to_string(),
        })
    }

    async fn is_alive(&self) -> bool {
        match self.driver.lock().await.as_ref() {
            Some(driver) => driver.title().await.is_ok(),
            None => false,
        }
    }

    fn supports_parallel(&self) -> bool {
        false
    }

    async fn close(&self) {
        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            // Quit asynchronously if the runtime is still around
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = driver.quit().await {
                        error!("Error closing browser session during drop: {}", e);
                    }
                });
            }
        }
    }
}
