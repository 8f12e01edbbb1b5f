use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use url::Url;

/// Proxy a task's session is routed through
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProxyConfig {
    pub proxy_type: String, // "http", "socks5"
    pub address: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Build the proxy URL, including credentials when both are present
    pub fn to_url(&self) -> Result<String> {
        let (scheme, default_port) = match self.proxy_type.as_str() {
            "http" => ("http", 8080),
            "socks5" => ("socks5", 1080),
            other => anyhow::bail!("Unsupported proxy type: {}", other),
        };

        let port = self.port.unwrap_or(default_port);
        let url = if let (Some(username), Some(password)) = (&self.username, &self.password) {
            format!("{}://{}:{}@{}:{}", scheme, username, password, self.address, port)
        } else {
            format!("{}://{}:{}", scheme, self.address, port)
        };

        Ok(url)
    }

    /// Proxy address as passed to a browser's `--proxy-server` flag.
    ///
    /// Chrome ignores inline credentials, so they are left out here.
    pub fn to_browser_arg(&self) -> Result<String> {
        let (scheme, default_port) = match self.proxy_type.as_str() {
            "http" => ("http", 8080),
            "socks5" => ("socks5", 1080),
            other => anyhow::bail!("Unsupported proxy type: {}", other),
        };
        Ok(format!("{}://{}:{}", scheme, self.address, self.port.unwrap_or(default_port)))
    }
}

impl FromStr for ProxyConfig {
    type Err = anyhow::Error;

    /// Parse `scheme://[user:pass@]host[:port]`
    fn from_str(value: &str) -> Result<Self> {
        let url = Url::parse(value).context(format!("Invalid proxy URL: {}", value))?;
        let proxy_type = match url.scheme() {
            "http" | "https" => "http",
            "socks5" | "socks5h" => "socks5",
            other => anyhow::bail!("Unsupported proxy type: {}", other),
        };
        let address = url.host_str().context("Proxy URL has no host")?.to_string();
        let username = Some(url.username()).filter(|u| !u.is_empty()).map(str::to_string);

        Ok(Self {
            proxy_type: proxy_type.to_string(),
            address,
            port: url.port(),
            username,
            password: url.password().map(str::to_string),
        })
    }
}
