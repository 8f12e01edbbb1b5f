pub mod generic;
pub mod json_api;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::browser::{BrowserSession, SessionError, SessionSettings};
use crate::storage::credentials::Credentials;

// Re-export common types
pub use generic::{FieldSelector, GenericAdapter, GenericStrategy, GenericStrategyConfig};
pub use json_api::{JsonApiAdapter, JsonApiConfig};

/// Everything a worker needs to know about a scrape target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetDescriptor {
    pub name: String,

    /// Adapter kind registered in the `AdapterRegistry`
    #[serde(default = "default_adapter")]
    pub adapter: String,

    #[serde(default = "default_active")]
    pub active: bool,

    /// Tasks for this target must carry a credential binding
    #[serde(default)]
    pub requires_credentials: bool,

    #[serde(default)]
    pub session: SessionSettings,

    /// Configuration of the generic fallback strategy
    #[serde(default)]
    pub strategy: GenericStrategyConfig,

    /// Settings of the `json_api` adapter
    #[serde(default)]
    pub json: Option<JsonApiConfig>,
}

fn default_adapter() -> String {
    "generic".to_string()
}

fn default_active() -> bool {
    true
}

/// Which capabilities an adapter implements itself.
///
/// Anything not flagged is served by the generic strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub has_custom_search: bool,
    pub has_custom_extract: bool,
    pub has_custom_pagination: bool,
    pub has_custom_credentials: bool,
    /// Pages may be fetched concurrently (page URLs do not depend on the previous page)
    pub parallel_fetch: bool,
}

/// Search request for one result page
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub keyword: String,
    pub location: Option<String>,
    pub page: u32,
    /// Resolved page URL, when pagination produced one
    pub url: Option<String>,
}

/// A fetched result listing
#[derive(Debug, Clone, PartialEq)]
pub struct PageListing {
    pub keyword: String,
    pub page: u32,
    pub url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The current page failed; the run goes on with the next page
    #[error("{0}")]
    Page(String),

    /// The automation session is unusable; the run ends
    #[error("session lost: {0}")]
    Session(String),

    #[error("capability '{capability}' is not implemented by adapter '{adapter}'")]
    Unsupported { capability: &'static str, adapter: String },

    #[error("invalid target configuration: {0}")]
    Config(String),
}

impl AdapterError {
    /// Whether the error ends the whole run rather than one page
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Session(_) | Self::Config(_) | Self::Unsupported { .. })
    }

    fn unsupported(capability: &'static str, adapter: &str) -> Self {
        Self::Unsupported {
            capability,
            adapter: adapter.to_string(),
        }
    }
}

impl From<SessionError> for AdapterError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Fetch { .. } => Self::Page(error.to_string()),
            SessionError::Lost(message) => Self::Session(message),
        }
    }
}

/// Per-target scraping capabilities.
///
/// Only the methods flagged in `capabilities()` are called; the defaults
/// report the capability as unsupported.
#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    async fn search(
        &self,
        _session: &dyn BrowserSession,
        _query: &SearchQuery,
    ) -> Result<PageListing, AdapterError> {
        Err(AdapterError::unsupported("search", self.name()))
    }

    async fn extract_data(&self, _listing: &PageListing) -> Result<Vec<Value>, AdapterError> {
        Err(AdapterError::unsupported("extract_data", self.name()))
    }

    /// URL of the page `query.page`, or `None` once the listing is exhausted
    async fn handle_pagination(
        &self,
        _query: &SearchQuery,
        _previous: Option<&PageListing>,
    ) -> Result<Option<String>, AdapterError> {
        Err(AdapterError::unsupported("handle_pagination", self.name()))
    }

    async fn apply_credentials(
        &self,
        _session: &dyn BrowserSession,
        _credentials: &Credentials,
    ) -> Result<(), AdapterError> {
        Err(AdapterError::unsupported("apply_credentials", self.name()))
    }
}

/// Routes each capability either to the adapter or to the generic strategy
pub struct Dispatcher {
    adapter: Arc<dyn CapabilityAdapter>,
    generic: GenericStrategy,
    caps: AdapterCapabilities,
}

impl Dispatcher {
    pub fn new(adapter: Arc<dyn CapabilityAdapter>, target: &TargetDescriptor) -> Result<Self, AdapterError> {
        let caps = adapter.capabilities();
        let generic = GenericStrategy::new(&target.strategy)?;

        if !caps.has_custom_pagination && target.strategy.search_url.is_empty() {
            return Err(AdapterError::Config(format!(
                "target '{}' needs strategy.search_url for generic pagination",
                target.name
            )));
        }
        if !caps.has_custom_extract && target.strategy.item_selector.is_none() {
            return Err(AdapterError::Config(format!(
                "target '{}' needs strategy.item_selector for generic extraction",
                target.name
            )));
        }

        Ok(Self { adapter, generic, caps })
    }

    pub fn capabilities(&self) -> AdapterCapabilities {
        self.caps
    }

    /// Log which code path serves each capability
    pub fn log_paths(&self, task: impl std::fmt::Display) {
        let path = |custom: bool| if custom { "custom" } else { "generic" };
        info!(
            "Task {} uses adapter '{}' (search: {}, extract: {}, pagination: {}, credentials: {})",
            task,
            self.adapter.name(),
            path(self.caps.has_custom_search),
            path(self.caps.has_custom_extract),
            path(self.caps.has_custom_pagination),
            path(self.caps.has_custom_credentials),
        );
    }

    pub async fn page_url(
        &self,
        query: &SearchQuery,
        previous: Option<&PageListing>,
    ) -> Result<Option<String>, AdapterError> {
        if self.caps.has_custom_pagination {
            self.adapter.handle_pagination(query, previous).await
        } else {
            self.generic.page_url(query, previous)
        }
    }

    pub async fn search(&self, session: &dyn BrowserSession, query: &SearchQuery) -> Result<PageListing, AdapterError> {
        if self.caps.has_custom_search {
            self.adapter.search(session, query).await
        } else {
            self.generic.search(session, query).await
        }
    }

    pub async fn extract(&self, listing: &PageListing) -> Result<Vec<Value>, AdapterError> {
        if self.caps.has_custom_extract {
            self.adapter.extract_data(listing).await
        } else {
            self.generic.extract(listing)
        }
    }

    pub async fn apply_credentials(
        &self,
        session: &dyn BrowserSession,
        credentials: &Credentials,
    ) -> Result<(), AdapterError> {
        if self.caps.has_custom_credentials {
            self.adapter.apply_credentials(session, credentials).await
        } else {
            self.generic.apply_credentials(session, credentials).await
        }
    }
}

pub type AdapterFactory =
    Arc<dyn Fn(&TargetDescriptor) -> Result<Arc<dyn CapabilityAdapter>, AdapterError> + Send + Sync>;

/// Adapter kinds a worker can instantiate
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `generic` and `json_api` adapters
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("generic", |target| {
            Ok(Arc::new(GenericAdapter::new(target)) as Arc<dyn CapabilityAdapter>)
        });
        registry.register("json_api", |target| {
            Ok(Arc::new(JsonApiAdapter::new(target)?) as Arc<dyn CapabilityAdapter>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&TargetDescriptor) -> Result<Arc<dyn CapabilityAdapter>, AdapterError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Instantiate the adapter named by `target.adapter`
    pub fn resolve(&self, target: &TargetDescriptor) -> Result<Arc<dyn CapabilityAdapter>, AdapterError> {
        let factory = self
            .factories
            .get(&target.adapter)
            .ok_or_else(|| AdapterError::Config(format!("unknown adapter kind '{}'", target.adapter)))?;
        factory(target)
    }
}

/// Target descriptors known to the supervisor, by name
#[derive(Debug, Clone, Default)]
pub struct TargetCatalog {
    targets: BTreeMap<String, TargetDescriptor>,
}

impl TargetCatalog {
    pub fn new(targets: impl IntoIterator<Item = TargetDescriptor>) -> Self {
        Self {
            targets: targets.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TargetDescriptor> {
        self.targets.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetDescriptor> {
        self.targets.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(adapter: &str) -> TargetDescriptor {
        TargetDescriptor {
            name: "jobs".into(),
            adapter: adapter.into(),
            active: true,
            requires_credentials: false,
            session: SessionSettings::default(),
            strategy: GenericStrategyConfig {
                search_url: "https://jobs.example/search?q={keyword}&p={page}".into(),
                item_selector: Some(".job".into()),
                ..Default::default()
            },
            json: None,
        }
    }

    #[test]
    fn test_registry_resolves_builtins() {
        let registry = AdapterRegistry::with_builtins();
        let adapter = registry.resolve(&target("generic")).unwrap();
        assert_eq!(adapter.name(), "generic");
        assert!(!adapter.capabilities().has_custom_search);
        assert!(adapter.capabilities().parallel_fetch);

        let err = registry.resolve(&target("missing")).err().unwrap();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn test_dispatcher_requires_generic_settings_it_falls_back_to() {
        let registry = AdapterRegistry::with_builtins();
        let mut t = target("generic");
        t.strategy.item_selector = None;
        let adapter = registry.resolve(&t).unwrap();
        assert!(Dispatcher::new(adapter, &t).is_err());
    }

    #[test]
    fn test_session_errors_map_to_page_or_fatal() {
        let page: AdapterError = SessionError::Fetch {
            url: "u".into(),
            message: "timeout".into(),
        }
        .into();
        assert!(!page.is_fatal());

        let lost: AdapterError = SessionError::Lost("gone".into()).into();
        assert!(lost.is_fatal());
    }
}
