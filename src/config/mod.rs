// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fennec configuration subsystem
//!
//! A running proxy is created from an ordered list of [`ConfigProvider`]s;
//! later providers override earlier ones.  Typical stacking order:
//!
//! 1. `FileConfigProvider` – `fennec.{toml,json,yaml}`
//! 2. `EnvConfigProvider`  – `FENNEC_PROXY__METHODS_WHITELIST=GET,POST`
//! 3. *your* provider implementing [`ConfigProvider`]
//!
//! The engine never reads providers directly.  It reads an immutable
//! [`ConfigSnapshot`] through a [`SettingsHandle`], which can be swapped
//! atomically when the configuration is reloaded.
//!
//! | key | type | default | description |
//! |-----|------|---------|-------------|
//! | `server.host`                     | string | `127.0.0.1` | Listen address |
//! | `server.port`                     | u16    | `8080`      | Listen port |
//! | `proxy.hostname_whitelist`        | list   | empty       | Allowed target hosts |
//! | `proxy.hosts_whitelist`           | list   | empty       | Allowed client addresses |
//! | `proxy.methods_whitelist`         | list   | empty       | Allowed HTTP verbs |
//! | `proxy.reqtype_whitelist`         | list / table | empty | Target URL regexes |
//! | `proxy.mimetype_whitelist`        | list   | empty       | Allowed response content types |
//! | `proxy.disallowed_headers`        | list   | empty       | Headers scrubbed in both directions |
//! | `proxy.timeout`                   | ms     | `30000`     | Upstream read timeout |
//! | `proxy.connection_timeout`        | ms     | `30000`     | Upstream connect timeout |
//! | `proxy.max_total_connections`     | usize  | `60`        | Pool-wide connection bound |
//! | `proxy.max_connections_per_host`  | usize  | `6`         | Per-route connection bound |
//! | `proxy.stream_chunk_size`         | bytes  | `1024`      | Response relay chunk size |
//! | `proxy.max_file_upload_size`      | bytes  | `5242880`   | Multipart part limit |
//! | `proxy.forward.{http,https}.host` | string | –           | Forwarding proxy per scheme |
//! | `proxy.forward.{http,https}.port` | u16    | `80`/`443`  | Forwarding proxy port |
//! | `proxy.forward.non_proxy_hosts`   | string | empty       | `a.com\|*.internal` |
//!
//! List values accept either an array or a comma-separated string.

mod env;
pub mod error;
mod file;
mod settings;
mod snapshot;

#[cfg(test)]
mod tests;

pub use env::EnvConfigProvider;
pub use error::ConfigError;
pub use file::FileConfigProvider;
pub use settings::{ForwardProxy, ForwardSettings, ProxySettings};
pub use snapshot::{ConfigSnapshot, SettingsHandle};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// Core configuration provider trait that all configuration sources must implement.
/// This trait is object-safe since it doesn't contain generic methods.
pub trait ConfigProvider: Debug + Send + Sync {
    /// Check if the configuration provider has a value for the given key.
    fn has(&self, key: &str) -> bool;

    /// Get the name of the configuration provider for debugging purposes.
    fn provider_name(&self) -> &str;

    /// Get a raw configuration value by key.
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError>;
}

/// Typed access on top of [`ConfigProvider`]. Not object-safe.
pub trait ConfigProviderExt: ConfigProvider {
    /// Get a configuration value by key and deserialize it to the specified type.
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get_raw(key)? {
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                ConfigError::ParseError(format!("failed to deserialize '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }
}

impl<T: ConfigProvider> ConfigProviderExt for T {}

/// Builder for the configuration system.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration provider. Later providers take precedence.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Add a provider that is also held elsewhere, e.g. across reloads.
    pub fn with_shared_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn build(self) -> Config {
        Config {
            providers: self.providers,
        }
    }
}

/// Layered view over every registered provider.
#[derive(Debug, Clone, Default)]
pub struct Config {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Get a raw configuration value from the highest-priority provider that has it.
    pub fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        for provider in self.providers.iter().rev() {
            if provider.has(key) {
                return provider.get_raw(key);
            }
        }
        Ok(None)
    }

    /// Get a configuration value by key and deserialize it.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get_raw(key)? {
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                ConfigError::ParseError(format!("failed to deserialize '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }

    /// Get a configuration value by key with a default fallback value.
    pub fn get_or_default<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        match self.get(key)? {
            Some(value) => Ok(value),
            None => Ok(default),
        }
    }

    /// Names of the registered providers, lowest priority first.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.provider_name().to_string())
            .collect()
    }

    /// Create a configuration backed by a single file.
    pub fn default_file(file_path: &str) -> Result<Self, ConfigError> {
        let provider = FileConfigProvider::new(file_path)?;
        Ok(Self::builder().with_provider(provider).build())
    }
}

/// A whole layered [`Config`] can itself be stacked as one provider.
impl ConfigProvider for Config {
    fn has(&self, key: &str) -> bool {
        self.providers.iter().any(|p| p.has(key))
    }

    fn provider_name(&self) -> &str {
        "layered"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Config::get_raw(self, key)
    }
}
