use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::adapters::{AdapterCapabilities, AdapterError, CapabilityAdapter, PageListing, TargetDescriptor};

/// Settings of a target that answers searches with JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JsonApiConfig {
    /// JSON pointer to the array of items (`""` for a top-level array)
    #[serde(default)]
    pub items_pointer: String,

    /// Output field name -> JSON pointer inside an item; empty keeps whole items
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// Adapter extracting items from JSON responses; search and pagination stay generic
pub struct JsonApiAdapter {
    config: JsonApiConfig,
    parallel_fetch: bool,
}

impl JsonApiAdapter {
    pub fn new(target: &TargetDescriptor) -> Result<Self, AdapterError> {
        let config = target
            .json
            .clone()
            .ok_or_else(|| AdapterError::Config(format!("target '{}' has no json settings", target.name)))?;

        Ok(Self {
            config,
            parallel_fetch: target.strategy.search_url.contains("{page}"),
        })
    }
}

#[async_trait]
impl CapabilityAdapter for JsonApiAdapter {
    fn name(&self) -> &str {
        "json_api"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            has_custom_extract: true,
            parallel_fetch: self.parallel_fetch,
            ..Default::default()
        }
    }

    async fn extract_data(&self, listing: &PageListing) -> Result<Vec<Value>, AdapterError> {
        let document: Value = serde_json::from_str(&listing.body)
            .map_err(|e| AdapterError::Page(format!("response of {} is not JSON: {}", listing.url, e)))?;

        let items = document
            .pointer(&self.config.items_pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                AdapterError::Page(format!(
                    "no item array at '{}' in response of {}",
                    self.config.items_pointer, listing.url
                ))
            })?;

        if self.config.fields.is_empty() {
            return Ok(items.clone());
        }

        Ok(items
            .iter()
            .map(|item| {
                let object: Map<String, Value> = self
                    .config
                    .fields
                    .iter()
                    .map(|(name, pointer)| (name.clone(), item.pointer(pointer).cloned().unwrap_or(Value::Null)))
                    .collect();
                Value::Object(object)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::GenericStrategyConfig;
    use crate::browser::SessionSettings;
    use serde_json::json;

    fn target(json: Option<JsonApiConfig>) -> TargetDescriptor {
        TargetDescriptor {
            name: "api".into(),
            adapter: "json_api".into(),
            active: true,
            requires_credentials: false,
            session: SessionSettings::default(),
            strategy: GenericStrategyConfig {
                search_url: "https://api.example/v1/search?q={keyword}&page={page}".into(),
                ..Default::default()
            },
            json,
        }
    }

    fn listing(body: Value) -> PageListing {
        PageListing {
            keyword: "rust".into(),
            page: 1,
            url: "https://api.example/v1/search?q=rust&page=1".into(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_extracts_mapped_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "/title".to_string());
        fields.insert("city".to_string(), "/location/city".to_string());
        let adapter = JsonApiAdapter::new(&target(Some(JsonApiConfig {
            items_pointer: "/data/items".into(),
            fields,
        })))
        .unwrap();

        let caps = adapter.capabilities();
        assert!(caps.has_custom_extract);
        assert!(!caps.has_custom_search);
        assert!(caps.parallel_fetch);

        let body = json!({ "data": { "items": [
            { "title": "Rust Engineer", "location": { "city": "Madrid" } },
            { "title": "Remote" }
        ]}});
        let items = adapter.extract_data(&listing(body)).await.unwrap();

        assert_eq!(items[0], json!({ "title": "Rust Engineer", "city": "Madrid" }));
        assert_eq!(items[1], json!({ "title": "Remote", "city": null }));
    }

    #[tokio::test]
    async fn test_malformed_response_is_a_page_error() {
        let adapter = JsonApiAdapter::new(&target(Some(JsonApiConfig::default()))).unwrap();

        let mut page = listing(json!([]));
        page.body = "<html>maintenance</html>".into();
        let err = adapter.extract_data(&page).await.unwrap_err();
        assert!(!err.is_fatal());

        let items = adapter.extract_data(&listing(json!([{ "a": 1 }]))).await.unwrap();
        assert_eq!(items, vec![json!({ "a": 1 })]);
    }

    #[test]
    fn test_requires_json_settings() {
        assert!(matches!(JsonApiAdapter::new(&target(None)), Err(AdapterError::Config(_))));
    }
}
