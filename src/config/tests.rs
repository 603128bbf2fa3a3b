// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod tests {
    use crate::config::{
        Config, ConfigError, ConfigProvider, ConfigSnapshot, ForwardProxy, ProxySettings,
        SettingsHandle,
    };
    use serde_json::{Value, json};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct MockConfigProvider {
        values: serde_json::Map<String, Value>,
        name: String,
    }

    impl MockConfigProvider {
        fn new(name: &str) -> Self {
            Self {
                values: serde_json::Map::new(),
                name: name.to_string(),
            }
        }

        fn with(mut self, key: &str, value: Value) -> Self {
            self.values.insert(key.to_string(), value);
            self
        }
    }

    impl ConfigProvider for MockConfigProvider {
        fn has(&self, key: &str) -> bool {
            self.values.contains_key(key)
        }

        fn provider_name(&self) -> &str {
            &self.name
        }

        fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
            Ok(self.values.get(key).cloned())
        }
    }

    fn config_of(provider: MockConfigProvider) -> Config {
        Config::builder().with_provider(provider).build()
    }

    #[test]
    fn test_later_provider_wins() {
        let base = MockConfigProvider::new("base")
            .with("server.port", json!(8080))
            .with("server.host", json!("127.0.0.1"));
        let overlay = MockConfigProvider::new("overlay").with("server.port", json!(9000));

        let config = Config::builder()
            .with_provider(base)
            .with_provider(overlay)
            .build();

        assert_eq!(config.get::<u16>("server.port").unwrap(), Some(9000));
        assert_eq!(
            config.get::<String>("server.host").unwrap().as_deref(),
            Some("127.0.0.1")
        );
        assert_eq!(config.provider_names(), vec!["base", "overlay"]);
    }

    #[test]
    fn test_get_or_default() {
        let config = config_of(MockConfigProvider::new("test").with("server.port", json!(8080)));

        assert_eq!(config.get_or_default("server.port", 1234).unwrap(), 8080);
        assert_eq!(config.get_or_default("server.timeout", 30).unwrap(), 30);
    }

    #[test]
    fn test_empty_config_yields_documented_defaults() {
        let settings = ProxySettings::from_config(&Config::default());

        assert_eq!(settings, ProxySettings::default());
        assert_eq!(settings.timeout, Duration::from_millis(30_000));
        assert_eq!(settings.connection_timeout, Duration::from_millis(30_000));
        assert_eq!(settings.max_total_connections, 60);
        assert_eq!(settings.max_connections_per_host, 6);
        assert_eq!(settings.stream_chunk_size, 1024);
        assert_eq!(settings.max_file_upload_size, 5 * 1024 * 1024);
        assert!(settings.forward.http.is_none());
        assert!(settings.hostname_whitelist.is_empty());
    }

    #[test]
    fn test_unparseable_values_fall_back_per_key() {
        let config = config_of(
            MockConfigProvider::new("broken")
                .with("proxy.timeout", json!("soon"))
                .with("proxy.max_total_connections", json!(0))
                .with("proxy.max_connections_per_host", json!(-3))
                .with("proxy.stream_chunk_size", json!(4096)),
        );

        let settings = ProxySettings::from_config(&config);

        assert_eq!(settings.timeout, Duration::from_millis(30_000));
        assert_eq!(settings.max_total_connections, 60);
        assert_eq!(settings.max_connections_per_host, 6);
        assert_eq!(settings.stream_chunk_size, 4096);
    }

    #[test]
    fn test_pool_limits_beyond_semaphore_capacity_fall_back() {
        let config = config_of(
            MockConfigProvider::new("huge")
                .with("proxy.max_total_connections", json!(1u64 << 62))
                .with("proxy.max_connections_per_host", json!(u64::MAX)),
        );

        let settings = ProxySettings::from_config(&config);
        assert_eq!(settings.max_total_connections, 60);
        assert_eq!(settings.max_connections_per_host, 6);

        let executor = crate::transport::TransportExecutor::new((&settings).into());
        assert_eq!(executor.available(), 60);
    }

    #[test]
    fn test_lists_accept_arrays_and_comma_strings() {
        let config = config_of(
            MockConfigProvider::new("lists")
                .with("proxy.hostname_whitelist", json!("example.com, maps.example.org ,"))
                .with("proxy.methods_whitelist", json!(["GET", "POST"]))
                .with("proxy.disallowed_headers", json!("Authorization,X-Secret")),
        );

        let settings = ProxySettings::from_config(&config);

        assert_eq!(settings.hostname_whitelist.len(), 2);
        assert!(settings.hostname_whitelist.contains("maps.example.org"));
        assert!(settings.methods_whitelist.contains("POST"));
        assert!(settings.disallowed_headers.contains("authorization"));
        assert!(settings.disallowed_headers.contains("x-secret"));
    }

    #[test]
    fn test_named_request_types_keep_commas() {
        let config = config_of(MockConfigProvider::new("reqtypes").with(
            "proxy.reqtype_whitelist",
            json!({
                "capabilities": ".*getcapabilities.*",
                "generic": "http://[a-z]{1,3}\\.example\\.com/.*"
            }),
        ));

        let settings = ProxySettings::from_config(&config);

        assert_eq!(settings.reqtype_whitelist.len(), 2);
        assert!(
            settings
                .reqtype_whitelist
                .contains(&"http://[a-z]{1,3}\\.example\\.com/.*".to_string())
        );
    }

    #[test]
    fn test_forward_proxy_settings() {
        let config = config_of(
            MockConfigProvider::new("forward")
                .with("proxy.forward.http.host", json!("squid.local"))
                .with("proxy.forward.https.host", json!("squid.local"))
                .with("proxy.forward.https.port", json!(3129))
                .with("proxy.forward.non_proxy_hosts", json!("localhost|*.internal")),
        );

        let forward = ProxySettings::from_config(&config).forward;

        assert_eq!(
            forward.http,
            Some(ForwardProxy {
                host: "squid.local".into(),
                port: 80
            })
        );
        assert_eq!(forward.for_scheme("https").map(|p| p.port), Some(3129));
        assert_eq!(forward.non_proxy_hosts, vec!["localhost", "*.internal"]);
        assert!(forward.for_scheme("ftp").is_none());
    }

    #[test]
    fn test_invalid_request_type_pattern_is_skipped() {
        let settings = ProxySettings {
            reqtype_whitelist: vec!["(".into(), ".*wms.*".into()],
            ..ProxySettings::default()
        };

        let snapshot = ConfigSnapshot::new(settings);

        assert_eq!(snapshot.request_types().len(), 1);
        assert!(snapshot.request_types()[0].is_match("http://a.com/wms?x=1"));
        assert!(!snapshot.request_types()[0].is_match("http://a.com/wfs"));
    }

    #[test]
    fn test_handle_swaps_without_touching_held_snapshots() {
        let handle = SettingsHandle::new(ConfigSnapshot::default());
        let before = handle.load();

        let config = config_of(
            MockConfigProvider::new("reloaded").with("proxy.stream_chunk_size", json!(16)),
        );
        handle.reload(&config);

        assert_eq!(before.settings().stream_chunk_size, 1024);
        assert_eq!(handle.load().settings().stream_chunk_size, 16);
    }
}
