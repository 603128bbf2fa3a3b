// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common test utilities and helpers for Fennec integration tests.

use std::net::SocketAddr;
use std::sync::Once;

use fennec::config::{ConfigError, ConfigProvider};
use fennec::{Fennec, FennecLoader, ProxyError};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

static LOGGING: Once = Once::new();

/// Initialize logging once for the whole test binary.
#[allow(dead_code)]
pub fn init_test_logging() {
    LOGGING.call_once(|| fennec::logging::init(Some(log::LevelFilter::Debug)));
}

/// Test configuration provider backed by a nested JSON document.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct TestConfigProvider {
    root: Value,
    name: String,
}

#[allow(dead_code)]
impl TestConfigProvider {
    /// Create a provider from a JSON configuration document.
    pub fn from_json(root: Value) -> Self {
        Self {
            root,
            name: "test-config".to_string(),
        }
    }

    /// Set a single dotted key, creating intermediate objects.
    pub fn with_value<T: Into<Value>>(mut self, key: &str, value: T) -> Self {
        let mut node = &mut self.root;
        for part in key.split('.') {
            if !node.is_object() {
                *node = Value::Object(serde_json::Map::new());
            }
            node = node
                .as_object_mut()
                .map(|obj| obj.entry(part.to_string()).or_insert(Value::Null))
                .unwrap();
        }
        *node = value.into();
        self
    }

    /// Get a nested value by a dot-separated key path.
    fn get_nested_value(&self, key_path: &str) -> Option<Value> {
        key_path
            .split('.')
            .try_fold(&self.root, |node, part| node.get(part))
            .filter(|v| !v.is_null())
            .cloned()
    }
}

impl ConfigProvider for TestConfigProvider {
    fn has(&self, key: &str) -> bool {
        self.get_nested_value(key).is_some()
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.get_nested_value(key))
    }
}

/// A Fennec instance serving on an ephemeral port.
#[allow(dead_code)]
pub struct RunningProxy {
    pub fennec: Fennec,
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), ProxyError>>>,
}

#[allow(dead_code)]
impl RunningProxy {
    /// Build `loader` and serve it on `127.0.0.1:0`.
    pub async fn start(loader: FennecLoader) -> Self {
        init_test_logging();

        let fennec = loader.build().await.expect("proxy should build");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let server = fennec.server().clone();
        let task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stopped.await;
                })
                .await
        });

        Self {
            fennec,
            addr,
            stop: Some(stop),
            task: Some(task),
        }
    }

    /// Proxy endpoint URL for `target`.
    pub fn url_for(&self, target: &str) -> String {
        format!(
            "http://{}/proxy?url={}",
            self.addr,
            urlencoding::encode(target)
        )
    }

    pub fn entry_url(&self) -> String {
        format!("http://{}/proxy", self.addr)
    }

    /// Stop accepting connections and wait for the server to drain.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap().unwrap();
        }
    }
}

/// Client that neither follows redirects nor uses a system proxy.
#[allow(dead_code)]
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap()
}
