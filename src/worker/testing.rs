//! Scripted adapter and session used by worker, process and controller tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapters::{
    AdapterCapabilities, AdapterError, AdapterRegistry, CapabilityAdapter, GenericStrategyConfig, PageListing,
    SearchQuery, TargetDescriptor,
};
use crate::browser::{BrowserSession, FetchedPage, LoginForm, SessionError, SessionSettings};
use crate::storage::credentials::Credentials;
use crate::tasks::task::{TaskConfig, TaskId};
use crate::worker::protocol::StartMessage;
use crate::worker::{SessionProvider, WorkerEnv};

/// Behaviour of the scripted target
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub items_per_page: usize,
    pub page_delay: Duration,
    /// Pages (any keyword) whose extraction fails
    pub failing_pages: HashSet<u32>,
    /// Single keyword pages whose extraction fails
    pub failing_keyword_pages: HashSet<(String, u32)>,
    /// Page at which the session dies
    pub lost_at_page: Option<u32>,
    /// Pagination ends after this page
    pub last_page: Option<u32>,
    /// Page at which the worker crashes without a terminal message
    pub panic_at_page: Option<u32>,
    pub parallel: bool,
}

#[derive(Default)]
pub struct ScriptedAdapter {
    pub script: Script,
    pub fetched: Mutex<Vec<(String, u32)>>,
    pub credentials_seen: Mutex<Option<String>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Default::default()
        })
    }

    pub fn fetched(&self) -> Vec<(String, u32)> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl CapabilityAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            has_custom_search: true,
            has_custom_extract: true,
            has_custom_pagination: true,
            has_custom_credentials: true,
            parallel_fetch: self.script.parallel,
        }
    }

    async fn search(&self, session: &dyn BrowserSession, query: &SearchQuery) -> Result<PageListing, AdapterError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.script.page_delay).await;
        if self.script.panic_at_page == Some(query.page) {
            panic!("scripted worker crash");
        }
        let url = query.url.clone().unwrap_or_default();
        let outcome = if self.script.lost_at_page == Some(query.page) {
            Err(AdapterError::Session("scripted session died".into()))
        } else {
            session.fetch(&url).await.map_err(AdapterError::from)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let page = outcome?;
        self.fetched.lock().unwrap().push((query.keyword.clone(), query.page));

        Ok(PageListing {
            keyword: query.keyword.clone(),
            page: query.page,
            url: page.url,
            body: page.body,
        })
    }

    async fn extract_data(&self, listing: &PageListing) -> Result<Vec<Value>, AdapterError> {
        let keyword_page = (listing.keyword.clone(), listing.page);
        if self.script.failing_pages.contains(&listing.page) || self.script.failing_keyword_pages.contains(&keyword_page) {
            return Err(AdapterError::Page(format!("no items on page {}", listing.page)));
        }
        Ok((0..self.script.items_per_page)
            .map(|n| json!({ "keyword": listing.keyword, "page": listing.page, "n": n }))
            .collect())
    }

    async fn handle_pagination(
        &self,
        query: &SearchQuery,
        _previous: Option<&PageListing>,
    ) -> Result<Option<String>, AdapterError> {
        if self.script.last_page.map_or(false, |last| query.page > last) {
            return Ok(None);
        }
        Ok(Some(format!("scripted://{}/{}", query.keyword, query.page)))
    }

    async fn apply_credentials(
        &self,
        _session: &dyn BrowserSession,
        credentials: &Credentials,
    ) -> Result<(), AdapterError> {
        *self.credentials_seen.lock().unwrap() = Some(credentials.username.clone());
        Ok(())
    }
}

/// Session answering every URL with an empty page
pub struct StubSession;

#[async_trait]
impl BrowserSession for StubSession {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, SessionError> {
        Ok(FetchedPage {
            url: url.to_string(),
            status: 200,
            body: String::new(),
        })
    }

    async fn submit_login(&self, _form: &LoginForm, _credentials: &Credentials) -> Result<(), SessionError> {
        Ok(())
    }

    async fn set_basic_auth(&self, _credentials: &Credentials) -> Result<(), SessionError> {
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

pub struct StubSessions;

#[async_trait]
impl SessionProvider for StubSessions {
    async fn open(&self, _target: &TargetDescriptor, _config: &TaskConfig) -> anyhow::Result<Arc<dyn BrowserSession>> {
        Ok(Arc::new(StubSession))
    }
}

pub fn scripted_target() -> TargetDescriptor {
    TargetDescriptor {
        name: "scripted".into(),
        adapter: "scripted".into(),
        active: true,
        requires_credentials: false,
        session: SessionSettings::default(),
        strategy: GenericStrategyConfig::default(),
        json: None,
    }
}

/// Worker environment whose "scripted" adapter kind always yields `adapter`
pub fn scripted_env(adapter: Arc<ScriptedAdapter>) -> WorkerEnv {
    let mut adapters = AdapterRegistry::with_builtins();
    adapters.register("scripted", move |_| Ok(adapter.clone() as Arc<dyn CapabilityAdapter>));
    WorkerEnv {
        adapters,
        sessions: Arc::new(StubSessions),
    }
}

pub fn task_config(keywords: &[&str], max_pages: u32) -> TaskConfig {
    let mut config = TaskConfig::new(
        "scripted run",
        "scripted",
        keywords.iter().map(|k| k.to_string()).collect(),
    );
    config.max_pages = max_pages;
    config
}

pub fn start_message(task_id: u64, config: TaskConfig) -> StartMessage {
    StartMessage {
        task_id: TaskId(task_id),
        config,
        target: scripted_target(),
        credentials: None,
        heartbeat_interval_ms: 0,
    }
}
