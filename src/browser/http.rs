use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

use crate::browser::proxy::ProxyConfig;
use crate::browser::{BrowserSession, FetchedPage, LoginForm, SessionError, SessionSettings};
use crate::storage::credentials::Credentials;

/// Plain HTTP session backed by reqwest, with a cookie store
pub struct HttpSession {
    client: Client,

    /// Credentials sent as basic auth on every request
    basic_auth: RwLock<Option<Credentials>>,
}

impl HttpSession {
    pub fn new(settings: &SessionSettings, proxy: Option<&ProxyConfig>) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(settings.user_agent.clone())
            .cookie_store(true);

        if let Some(proxy) = proxy {
            let proxy_url = proxy.to_url()?;
            builder = builder.proxy(
                reqwest::Proxy::all(&proxy_url)
                    .context(format!("Invalid proxy URL for {}", proxy.address))?,
            );
        }

        let client = builder.build().context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            basic_auth: RwLock::new(None),
        })
    }

    fn current_auth(&self) -> Option<Credentials> {
        self.basic_auth.read().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, SessionError> {
        let mut request = self.client.get(url);
        if let Some(auth) = self.current_auth() {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        debug!("Fetching: {}", url);
        let response = request.send().await.map_err(|e| SessionError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Fetch {
                url: url.to_string(),
                message: format!("HTTP {}", status.as_u16()),
            });
        }

        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| SessionError::Fetch {
            url: url.to_string(),
            message: format!("failed to read body: {}", e),
        })?;

        Ok(FetchedPage {
            url: final_url,
            status: status.as_u16(),
            body,
        })
    }

    async fn submit_login(&self, form: &LoginForm, credentials: &Credentials) -> Result<(), SessionError> {
        let mut fields = HashMap::new();
        fields.insert(form.username_field.as_str(), credentials.username.as_str());
        fields.insert(form.password_field.as_str(), credentials.password.as_str());

        let response = self
            .client
            .post(&form.url)
            .form(&fields)
            .send()
            .await
            .map_err(|e| SessionError::Fetch {
                url: form.url.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(SessionError::Fetch {
                url: form.url.clone(),
                message: format!("login rejected with HTTP {}", response.status().as_u16()),
            });
        }

        debug!("Logged in at {}", form.url);
        Ok(())
    }

    async fn set_basic_auth(&self, credentials: &Credentials) -> Result<(), SessionError> {
        let mut guard = self
            .basic_auth
            .write()
            .map_err(|_| SessionError::Lost("credential lock poisoned".to_string()))?;
        *guard = Some(credentials.clone());
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        true
    }

    fn supports_parallel(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session() -> HttpSession {
        HttpSession::new(&SessionSettings::default(), None).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let page = session()
            .fetch(&format!("{}/search", server.uri()))
            .await
            .unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn test_error_status_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = session().fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err, SessionError::Fetch { .. }));
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_basic_auth_is_sent_after_being_set() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
            .mount(&server)
            .await;

        let session = session();
        assert!(session.fetch(&server.uri()).await.is_err());

        session
            .set_basic_auth(&Credentials {
                username: "alice".into(),
                password: "pw".into(),
            })
            .await
            .unwrap();
        assert_eq!(session.fetch(&server.uri()).await.unwrap().body, "secret");
    }
}
