// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Environment variable-based configuration provider.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::env;

use super::ConfigError;
use super::ConfigProvider;

/// Separator between key segments in a variable name.
const SEGMENT_SEPARATOR: &str = "__";

/// Configuration provider that retrieves values from environment variables.
///
/// `FENNEC_PROXY__MAX_TOTAL_CONNECTIONS=120` maps to the key
/// `proxy.max_total_connections`: the prefix is stripped, the remainder is
/// lower-cased and double underscores become dots.
#[derive(Debug)]
pub struct EnvConfigProvider {
    prefix: String,
    cache: HashMap<String, String>,
}

impl EnvConfigProvider {
    /// Create a provider reading every variable that starts with `prefix`.
    pub fn new(prefix: &str) -> Self {
        let mut provider = Self {
            prefix: prefix.to_string(),
            cache: HashMap::new(),
        };
        provider.refresh_cache();
        provider
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Re-read the process environment.
    pub fn refresh_cache(&mut self) {
        self.cache = env::vars()
            .filter_map(|(key, value)| {
                let rest = key.strip_prefix(&self.prefix)?;
                if rest.is_empty() {
                    return None;
                }
                let config_key = rest.to_lowercase().replace(SEGMENT_SEPARATOR, ".");
                Some((config_key, value))
            })
            .collect();
    }

    fn parse_value(value: &str) -> Value {
        if let Ok(json_value) = serde_json::from_str(value) {
            return json_value;
        }
        if value.eq_ignore_ascii_case("true") {
            return json!(true);
        }
        if value.eq_ignore_ascii_case("false") {
            return json!(false);
        }
        json!(value)
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new("FENNEC_")
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn has(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    fn provider_name(&self) -> &str {
        "env"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.cache.get(key).map(|v| Self::parse_value(v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigProviderExt;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_double_underscore_separates_segments() {
        unsafe {
            env::set_var("FENNEC_PROXY__MAX_TOTAL_CONNECTIONS", "120");
            env::set_var("FENNEC_SERVER__HOST", "0.0.0.0");
        }

        let provider = EnvConfigProvider::default();

        assert!(provider.has("proxy.max_total_connections"));
        let total: usize = provider.get("proxy.max_total_connections").unwrap().unwrap();
        assert_eq!(total, 120);
        let host: String = provider.get("server.host").unwrap().unwrap();
        assert_eq!(host, "0.0.0.0");

        unsafe {
            env::remove_var("FENNEC_PROXY__MAX_TOTAL_CONNECTIONS");
            env::remove_var("FENNEC_SERVER__HOST");
        }
    }

    #[test]
    #[serial]
    fn test_values_are_typed() {
        unsafe {
            env::set_var("FENNECTEST_PROXY__METHODS_WHITELIST", r#"["GET","PUT"]"#);
            env::set_var("FENNECTEST_LOGGING__STRUCTURED", "TRUE");
            env::set_var("FENNECTEST_PROXY__HOSTNAME_WHITELIST", "a.com,b.com");
        }

        let provider = EnvConfigProvider::new("FENNECTEST_");

        let methods: Vec<String> = provider.get("proxy.methods_whitelist").unwrap().unwrap();
        assert_eq!(methods, vec!["GET", "PUT"]);
        let structured: bool = provider.get("logging.structured").unwrap().unwrap();
        assert!(structured);
        let hosts: String = provider.get("proxy.hostname_whitelist").unwrap().unwrap();
        assert_eq!(hosts, "a.com,b.com");

        unsafe {
            env::remove_var("FENNECTEST_PROXY__METHODS_WHITELIST");
            env::remove_var("FENNECTEST_LOGGING__STRUCTURED");
            env::remove_var("FENNECTEST_PROXY__HOSTNAME_WHITELIST");
        }
    }

    #[test]
    #[serial]
    fn test_cache_refresh_picks_up_new_variables() {
        let mut provider = EnvConfigProvider::new("FENNECREFRESH_");
        assert!(!provider.has("value"));

        unsafe {
            env::set_var("FENNECREFRESH_VALUE", "42");
        }
        assert!(!provider.has("value"));

        provider.refresh_cache();
        let value: i32 = provider.get("value").unwrap().unwrap();
        assert_eq!(value, 42);

        unsafe {
            env::remove_var("FENNECREFRESH_VALUE");
        }
    }
}
