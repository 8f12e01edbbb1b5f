use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use url::Url;

use crate::adapters::{AdapterCapabilities, AdapterError, CapabilityAdapter, PageListing, SearchQuery, TargetDescriptor};
use crate::browser::{BrowserSession, LoginForm};
use crate::storage::credentials::Credentials;

/// Configuration of the generic, selector driven strategy
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenericStrategyConfig {
    /// Search URL template; `{keyword}`, `{location}` and `{page}` are substituted
    #[serde(default)]
    pub search_url: String,

    /// CSS selector matching one result item
    #[serde(default)]
    pub item_selector: Option<String>,

    /// Fields extracted from every item
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSelector>,

    /// CSS selector of the "next page" link, for templates without `{page}`
    #[serde(default)]
    pub next_page_selector: Option<String>,

    /// Login form used to apply credentials; basic auth otherwise
    #[serde(default)]
    pub login: Option<LoginForm>,
}

/// How a single field is read from an item
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldSelector {
    /// CSS selector relative to the item; empty selects the item itself
    #[serde(default)]
    pub selector: String,

    /// Attribute to read instead of the text content
    #[serde(default)]
    pub attribute: Option<String>,

    /// Regex applied to the raw value; the first capture group wins if present
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Fallback implementation of every capability, driven by `GenericStrategyConfig`
#[derive(Debug, Clone)]
pub struct GenericStrategy {
    config: GenericStrategyConfig,
    patterns: HashMap<String, Regex>,
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Config(format!("invalid CSS selector '{}': {:?}", selector, e)))
}

fn collapse_text<'a>(text: impl Iterator<Item = &'a str>) -> String {
    text.flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

impl GenericStrategy {
    /// Validate selectors and compile field patterns
    pub fn new(config: &GenericStrategyConfig) -> Result<Self, AdapterError> {
        if let Some(selector) = &config.item_selector {
            parse_selector(selector)?;
        }
        if let Some(selector) = &config.next_page_selector {
            parse_selector(selector)?;
        }

        let mut patterns = HashMap::new();
        for (name, field) in &config.fields {
            if !field.selector.is_empty() {
                parse_selector(&field.selector)?;
            }
            if let Some(pattern) = &field.pattern {
                let regex = Regex::new(pattern)
                    .map_err(|e| AdapterError::Config(format!("invalid pattern for field '{}': {}", name, e)))?;
                patterns.insert(name.clone(), regex);
            }
        }

        Ok(Self {
            config: config.clone(),
            patterns,
        })
    }

    /// Whether every page URL can be built from the template alone
    pub fn template_paginates(&self) -> bool {
        self.config.search_url.contains("{page}")
    }

    fn fill_template(&self, query: &SearchQuery) -> String {
        self.config
            .search_url
            .replace("{keyword}", &encode(&query.keyword))
            .replace("{location}", &encode(query.location.as_deref().unwrap_or("")))
            .replace("{page}", &query.page.to_string())
    }

    /// URL of `query.page`; `None` when a next-page link is required but absent
    pub fn page_url(&self, query: &SearchQuery, previous: Option<&PageListing>) -> Result<Option<String>, AdapterError> {
        if self.config.search_url.is_empty() {
            return Err(AdapterError::Config("no search_url configured".into()));
        }
        if query.page <= 1 || self.template_paginates() {
            return Ok(Some(self.fill_template(query)));
        }

        let (Some(next_selector), Some(previous)) = (&self.config.next_page_selector, previous) else {
            return Ok(None);
        };

        let selector = parse_selector(next_selector)?;
        let document = Html::parse_document(&previous.body);
        let href = document
            .select(&selector)
            .next()
            .and_then(|link| link.value().attr("href"))
            .map(str::to_string);

        match href {
            Some(href) => {
                let base = Url::parse(&previous.url)
                    .map_err(|e| AdapterError::Page(format!("invalid page URL {}: {}", previous.url, e)))?;
                let next = base
                    .join(&href)
                    .map_err(|e| AdapterError::Page(format!("invalid next page link '{}': {}", href, e)))?;
                Ok(Some(next.to_string()))
            }
            None => Ok(None),
        }
    }

    pub async fn search(&self, session: &dyn BrowserSession, query: &SearchQuery) -> Result<PageListing, AdapterError> {
        let url = match &query.url {
            Some(url) => url.clone(),
            None => self.fill_template(query),
        };

        let page = session.fetch(&url).await?;

        Ok(PageListing {
            keyword: query.keyword.clone(),
            page: query.page,
            url: page.url,
            body: page.body,
        })
    }

    /// Extract one JSON object per item matched by the item selector
    pub fn extract(&self, listing: &PageListing) -> Result<Vec<Value>, AdapterError> {
        let item_selector = self
            .config
            .item_selector
            .as_deref()
            .ok_or_else(|| AdapterError::Config("no item_selector configured".into()))?;
        let item_selector = parse_selector(item_selector)?;

        let mut fields = Vec::with_capacity(self.config.fields.len());
        for (name, field) in &self.config.fields {
            let selector = if field.selector.is_empty() {
                None
            } else {
                Some(parse_selector(&field.selector)?)
            };
            fields.push((name, field, selector));
        }

        let document = Html::parse_document(&listing.body);
        let mut items = Vec::new();

        for item in document.select(&item_selector) {
            let mut object = Map::new();

            if fields.is_empty() {
                object.insert("text".into(), Value::String(collapse_text(item.text())));
            }

            for (name, field, selector) in &fields {
                let element: Option<ElementRef> = match selector {
                    Some(selector) => item.select(selector).next(),
                    None => Some(item),
                };
                let raw = element.and_then(|element| match &field.attribute {
                    Some(attribute) => element.value().attr(attribute).map(|v| v.trim().to_string()),
                    None => Some(collapse_text(element.text())),
                });
                let value = raw.and_then(|raw| self.apply_pattern(name, raw));
                object.insert((*name).clone(), value.map(Value::String).unwrap_or(Value::Null));
            }

            items.push(Value::Object(object));
        }

        Ok(items)
    }

    fn apply_pattern(&self, field: &str, raw: String) -> Option<String> {
        let Some(regex) = self.patterns.get(field) else {
            return Some(raw);
        };
        let captures = regex.captures(&raw)?;
        captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_str().to_string())
    }

    /// Log in through the configured form, or fall back to basic auth
    pub async fn apply_credentials(
        &self,
        session: &dyn BrowserSession,
        credentials: &Credentials,
    ) -> Result<(), AdapterError> {
        match &self.config.login {
            Some(form) => session.submit_login(form, credentials).await?,
            None => session.set_basic_auth(credentials).await?,
        }
        Ok(())
    }
}

/// Adapter with no custom capabilities; everything goes through `GenericStrategy`
pub struct GenericAdapter {
    parallel_fetch: bool,
}

impl GenericAdapter {
    pub fn new(target: &TargetDescriptor) -> Self {
        Self {
            parallel_fetch: target.strategy.search_url.contains("{page}"),
        }
    }
}

#[async_trait]
impl CapabilityAdapter for GenericAdapter {
    fn name(&self) -> &str {
        "generic"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            parallel_fetch: self.parallel_fetch,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{HttpSession, SessionSettings};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LISTING: &str = r#"
        <html><body>
          <div class="job"><a class="title" href="/jobs/1"> Rust   Engineer </a><span class="salary">EUR 70000 / year</span></div>
          <div class="job"><a class="title" href="/jobs/2">Systems Developer</a></div>
          <a class="next" href="?page=2&cursor=abc">next</a>
        </body></html>"#;

    fn config() -> GenericStrategyConfig {
        let mut fields = BTreeMap::new();
        fields.insert(
            "title".to_string(),
            FieldSelector {
                selector: ".title".into(),
                ..Default::default()
            },
        );
        fields.insert(
            "link".to_string(),
            FieldSelector {
                selector: ".title".into(),
                attribute: Some("href".into()),
                pattern: None,
            },
        );
        fields.insert(
            "salary".to_string(),
            FieldSelector {
                selector: ".salary".into(),
                attribute: None,
                pattern: Some(r"(\d+)".into()),
            },
        );

        GenericStrategyConfig {
            search_url: "https://jobs.example/search?q={keyword}&l={location}".into(),
            item_selector: Some(".job".into()),
            fields,
            next_page_selector: Some("a.next".into()),
            login: None,
        }
    }

    fn listing(body: &str) -> PageListing {
        PageListing {
            keyword: "rust".into(),
            page: 1,
            url: "https://jobs.example/search?q=rust".into(),
            body: body.into(),
        }
    }

    fn query(page: u32) -> SearchQuery {
        SearchQuery {
            keyword: "rust dev".into(),
            location: Some("Berlin".into()),
            page,
            url: None,
        }
    }

    #[test]
    fn test_extract_reads_fields_attributes_and_patterns() {
        let strategy = GenericStrategy::new(&config()).unwrap();
        let items = strategy.extract(&listing(LISTING)).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["title"], "Rust Engineer");
        assert_eq!(items[0]["link"], "/jobs/1");
        assert_eq!(items[0]["salary"], "70000");
        assert_eq!(items[1]["salary"], Value::Null);
    }

    #[test]
    fn test_first_page_comes_from_template_and_later_pages_from_link() {
        let strategy = GenericStrategy::new(&config()).unwrap();

        let first = strategy.page_url(&query(1), None).unwrap().unwrap();
        assert_eq!(first, "https://jobs.example/search?q=rust+dev&l=Berlin");

        let second = strategy.page_url(&query(2), Some(&listing(LISTING))).unwrap().unwrap();
        assert_eq!(second, "https://jobs.example/search?page=2&cursor=abc");

        let exhausted = strategy
            .page_url(&query(3), Some(&listing("<html><body>no link</body></html>")))
            .unwrap();
        assert_eq!(exhausted, None);
    }

    #[test]
    fn test_page_placeholder_makes_every_url_computable() {
        let mut config = config();
        config.search_url = "https://jobs.example/search?q={keyword}&p={page}".into();
        let strategy = GenericStrategy::new(&config).unwrap();

        assert!(strategy.template_paginates());
        let url = strategy.page_url(&query(4), None).unwrap().unwrap();
        assert_eq!(url, "https://jobs.example/search?q=rust+dev&p=4");
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let mut bad_selector = config();
        bad_selector.item_selector = Some("div[".into());
        assert!(matches!(GenericStrategy::new(&bad_selector), Err(AdapterError::Config(_))));

        let mut bad_pattern = config();
        bad_pattern.fields.get_mut("salary").unwrap().pattern = Some("(".into());
        assert!(matches!(GenericStrategy::new(&bad_pattern), Err(AdapterError::Config(_))));
    }

    #[tokio::test]
    async fn test_search_and_extract_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "rust"))
            .and(query_param("p", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .mount(&server)
            .await;

        let mut config = config();
        config.search_url = format!("{}/search?q={{keyword}}&p={{page}}", server.uri());
        let strategy = GenericStrategy::new(&config).unwrap();
        let session = HttpSession::new(&SessionSettings::default(), None).unwrap();

        let query = SearchQuery {
            keyword: "rust".into(),
            location: None,
            page: 1,
            url: None,
        };
        let page = strategy.search(&session, &query).await.unwrap();
        let items = strategy.extract(&page).unwrap();

        assert_eq!(page.page, 1);
        assert_eq!(items.len(), 2);
    }
}
