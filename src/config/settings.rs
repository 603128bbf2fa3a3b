// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed proxy settings read from the layered [`Config`].
//!
//! Every key is read on its own.  A missing key, or one whose value cannot
//! be interpreted, is logged and replaced by its default so a partially
//! broken configuration still starts.

use std::collections::HashSet;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Semaphore;

use super::{Config, ConfigError};
use crate::warn_fmt;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_TOTAL_CONNECTIONS: usize = 60;
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 6;
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_MAX_FILE_UPLOAD_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PROXY_PORT: u16 = 443;

/// A forwarding proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardProxy {
    pub host: String,
    pub port: u16,
}

/// Upstream forwarding-proxy configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardSettings {
    /// Proxy for `http` targets.
    pub http: Option<ForwardProxy>,
    /// Proxy for `https` targets.
    pub https: Option<ForwardProxy>,
    /// Glob patterns for hosts that bypass the forwarding proxy.
    pub non_proxy_hosts: Vec<String>,
}

impl ForwardSettings {
    /// Forwarding proxy configured for the given URL scheme, if any.
    pub fn for_scheme(&self, scheme: &str) -> Option<&ForwardProxy> {
        match scheme {
            "http" => self.http.as_ref(),
            "https" => self.https.as_ref(),
            _ => None,
        }
    }
}

/// Read-only proxy settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    /// Allowed target hostnames. Empty allows every host.
    pub hostname_whitelist: HashSet<String>,
    /// Allowed client addresses. Empty allows every client.
    pub hosts_whitelist: HashSet<String>,
    /// Allowed request verbs, compared case-sensitively.
    pub methods_whitelist: HashSet<String>,
    /// Regexes of which at least one must match the whole target URL.
    pub reqtype_whitelist: Vec<String>,
    /// Allowed response base MIME types.
    pub mimetype_whitelist: HashSet<String>,
    /// Lower-cased names of headers removed in both directions.
    pub disallowed_headers: HashSet<String>,
    pub timeout: Duration,
    pub connection_timeout: Duration,
    pub max_total_connections: usize,
    pub max_connections_per_host: usize,
    pub stream_chunk_size: usize,
    pub max_file_upload_size: usize,
    pub forward: ForwardSettings,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            hostname_whitelist: HashSet::new(),
            hosts_whitelist: HashSet::new(),
            methods_whitelist: HashSet::new(),
            reqtype_whitelist: Vec::new(),
            mimetype_whitelist: HashSet::new(),
            disallowed_headers: HashSet::new(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            max_total_connections: DEFAULT_MAX_TOTAL_CONNECTIONS,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            stream_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
            max_file_upload_size: DEFAULT_MAX_FILE_UPLOAD_SIZE,
            forward: ForwardSettings::default(),
        }
    }
}

impl ProxySettings {
    /// Read the settings from `config`, falling back per key.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();

        let reader = SettingsReader { config };

        Self {
            hostname_whitelist: reader.list("proxy.hostname_whitelist", true).into_iter().collect(),
            hosts_whitelist: reader.list("proxy.hosts_whitelist", true).into_iter().collect(),
            methods_whitelist: reader.list("proxy.methods_whitelist", true).into_iter().collect(),
            reqtype_whitelist: reader.list("proxy.reqtype_whitelist", false),
            mimetype_whitelist: reader.list("proxy.mimetype_whitelist", true).into_iter().collect(),
            disallowed_headers: reader
                .list("proxy.disallowed_headers", true)
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            timeout: Duration::from_millis(reader.positive("proxy.timeout", DEFAULT_TIMEOUT_MS)),
            connection_timeout: Duration::from_millis(
                reader.positive("proxy.connection_timeout", DEFAULT_CONNECTION_TIMEOUT_MS),
            ),
            max_total_connections: reader.pool_limit(
                "proxy.max_total_connections",
                defaults.max_total_connections,
            ),
            max_connections_per_host: reader.pool_limit(
                "proxy.max_connections_per_host",
                defaults.max_connections_per_host,
            ),
            stream_chunk_size: reader
                .positive("proxy.stream_chunk_size", defaults.stream_chunk_size),
            max_file_upload_size: reader
                .positive("proxy.max_file_upload_size", defaults.max_file_upload_size),
            forward: ForwardSettings {
                http: reader.forward_proxy("http", DEFAULT_HTTP_PROXY_PORT),
                https: reader.forward_proxy("https", DEFAULT_HTTPS_PROXY_PORT),
                non_proxy_hosts: reader.non_proxy_hosts(),
            },
        }
    }
}

struct SettingsReader<'a> {
    config: &'a Config,
}

impl SettingsReader<'_> {
    fn value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.config.get::<T>(key) {
            Ok(value) => value,
            Err(e) => {
                warn_fmt!("Config", "{}; using default", e);
                None
            }
        }
    }

    fn positive<T>(&self, key: &str, default: T) -> T
    where
        T: DeserializeOwned + PartialOrd + Default + Copy + std::fmt::Display,
    {
        match self.value::<T>(key) {
            Some(v) if v > T::default() => v,
            Some(v) => {
                let err = ConfigError::invalid_value(key, format!("{v} is not positive"));
                warn_fmt!("Config", "{}; using default {}", err, default);
                default
            }
            None => default,
        }
    }

    /// Pool sizes become semaphore permits, which tokio caps.
    fn pool_limit(&self, key: &str, default: usize) -> usize {
        let limit = self.positive(key, default);
        if limit > Semaphore::MAX_PERMITS {
            let err = ConfigError::invalid_value(
                key,
                format!("{limit} exceeds the maximum of {}", Semaphore::MAX_PERMITS),
            );
            warn_fmt!("Config", "{}; using default {}", err, default);
            return default;
        }
        limit
    }

    /// Read a list given as an array, a string or a table of named entries.
    ///
    /// Strings are split on commas when `split` is set; regex lists keep
    /// each string whole since commas are legal inside a pattern.
    fn list(&self, key: &str, split: bool) -> Vec<String> {
        let Some(raw) = self.value::<Value>(key) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        collect_entries(key, &raw, split, &mut out);
        out
    }

    fn forward_proxy(&self, scheme: &str, default_port: u16) -> Option<ForwardProxy> {
        let host = self
            .value::<String>(&format!("proxy.forward.{scheme}.host"))
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())?;
        let port = self.positive(&format!("proxy.forward.{scheme}.port"), default_port);
        Some(ForwardProxy { host, port })
    }

    fn non_proxy_hosts(&self) -> Vec<String> {
        let key = "proxy.forward.non_proxy_hosts";
        match self.value::<Value>(key) {
            Some(Value::String(s)) => split_entries(&s, '|'),
            Some(other) => {
                let mut out = Vec::new();
                collect_entries(key, &other, false, &mut out);
                out
            }
            None => Vec::new(),
        }
    }
}

fn collect_entries(key: &str, value: &Value, split: bool, out: &mut Vec<String>) {
    match value {
        Value::String(s) if split => out.extend(split_entries(s, ',')),
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() {
                out.push(s.to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_entries(key, item, false, out);
            }
        }
        Value::Object(named) => {
            for item in named.values() {
                collect_entries(key, item, split, out);
            }
        }
        Value::Null => {}
        other => {
            warn_fmt!("Config", "Ignoring non-string entry {} in '{}'", other, key);
        }
    }
}

fn split_entries(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
