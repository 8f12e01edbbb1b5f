use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Resolved login material handed to a worker
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A credential binding as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialConfig {
    pub id: String,
    pub username: String,

    /// Inline password; prefer `password_env`
    #[serde(default)]
    pub password: Option<String>,

    /// Environment variable holding the password
    #[serde(default)]
    pub password_env: Option<String>,
}

/// Lookup of credential bindings by id
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Resolve a binding; `Ok(None)` when the id is unknown
    async fn resolve(&self, id: &str) -> Result<Option<Credentials>>;
}

/// Credential store backed by the configuration file
pub struct ConfigCredentialStore {
    entries: HashMap<String, CredentialConfig>,
}

impl ConfigCredentialStore {
    pub fn new(entries: &[CredentialConfig]) -> Self {
        Self {
            entries: entries.iter().map(|c| (c.id.clone(), c.clone())).collect(),
        }
    }
}

#[async_trait]
impl CredentialStore for ConfigCredentialStore {
    async fn resolve(&self, id: &str) -> Result<Option<Credentials>> {
        let Some(entry) = self.entries.get(id) else {
            return Ok(None);
        };

        let password = match (&entry.password_env, &entry.password) {
            (Some(var), _) => match std::env::var(var) {
                Ok(value) => value,
                Err(_) => {
                    warn!("Credential '{}' refers to unset variable {}", id, var);
                    return Ok(None);
                }
            },
            (None, Some(password)) => password.clone(),
            (None, None) => String::new(),
        };

        Ok(Some(Credentials {
            username: entry.username.clone(),
            password,
        }))
    }
}
