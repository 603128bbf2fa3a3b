// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level entry-point – "turn the key and go".
//!
//! The [`FennecLoader`] consumes configuration, initializes logging, builds
//! the checker pipeline and the transport, and returns a [`Fennec`] ready
//! to [`start`](Fennec::start).
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), fennec::LoaderError> {
//! let fennec = fennec::Fennec::loader()
//!     .with_config_file("/etc/fennec/config.toml")
//!     .with_env_vars()
//!     .build()
//!     .await?;
//! fennec.start().await
//! # }
//! ```


use std::env;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::LevelFilter;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::checkers::{Checker, CheckerFactory};
use crate::config::{
    Config, ConfigError, ConfigProvider, EnvConfigProvider, FileConfigProvider, SettingsHandle,
};
use crate::core::ProxyError;
use crate::engine::ProxyEngine;
use crate::logging::{self, config::LoggingConfig};
use crate::pipeline::Pipeline;
use crate::server::{ProxyServer, ServerConfig};
use crate::transport::{PoolSettings, Transport, TransportExecutor};
use crate::{info_fmt, warn_fmt};

/// Errors that can occur during Fennec initialization.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("proxy error: {0}")]
    ProxyError(#[from] ProxyError),
}

/// One entry of the `proxy.checkers` list.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckerConfig {
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default)]
    pub config: Value,
}

/// Where the configuration comes from; kept so it can be read again.
#[derive(Debug, Clone, Default)]
struct ConfigSources {
    base: Option<Config>,
    file_path: Option<String>,
    env_prefix: Option<String>,
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl ConfigSources {
    /// Layer, lowest priority first: base config, file, environment,
    /// custom providers.
    fn load(&self) -> Result<Config, ConfigError> {
        let mut builder = Config::builder();

        if let Some(base) = &self.base {
            builder = builder.with_provider(base.clone());
        }
        if let Some(path) = &self.file_path {
            builder = builder.with_provider(FileConfigProvider::new(path)?);
        }
        if let Some(prefix) = &self.env_prefix {
            builder = builder.with_provider(EnvConfigProvider::new(prefix));
        }
        for provider in &self.providers {
            builder = builder.with_shared_provider(provider.clone());
        }

        Ok(builder.build())
    }
}

/// Builder for initializing and configuring Fennec.
#[derive(Debug, Default)]
pub struct FennecLoader {
    sources: ConfigSources,
    use_env_vars: bool,
    custom_checkers: Vec<Arc<dyn Checker>>,
    transport: Option<Arc<dyn Transport>>,
}

impl FennecLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already assembled configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.sources.base = Some(config);
        self
    }

    /// Load a TOML, JSON or YAML file, chosen by extension.
    pub fn with_config_file(mut self, file_path: &str) -> Self {
        self.sources.file_path = Some(file_path.to_string());
        self
    }

    /// Read `FENNEC_*` environment variables.
    pub fn with_env_vars(mut self) -> Self {
        self.use_env_vars = true;
        self
    }

    /// Read environment variables with a custom prefix (default `FENNEC_`).
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.sources.env_prefix = Some(prefix.to_string());
        self.use_env_vars = true;
        self
    }

    /// Add a custom configuration provider on top of the others.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.sources.providers.push(Arc::new(provider));
        self
    }

    /// Append a checker after the built-in and configured ones.
    pub fn with_checker<C: Checker + 'static>(mut self, checker: C) -> Self {
        self.custom_checkers.push(Arc::new(checker));
        self
    }

    /// Replace the reqwest-backed transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build and initialize Fennec.
    pub async fn build(mut self) -> Result<Fennec, LoaderError> {
        if self.use_env_vars && self.sources.env_prefix.is_none() {
            self.sources.env_prefix = Some(EnvConfigProvider::default().prefix().to_string());
        }
        let config = self.sources.load()?;

        init_logging(&config);
        info_fmt!("Startup", "Fennec starting up");
        info_fmt!(
            "Startup",
            "Configuration providers: {}",
            config.provider_names().join(", ")
        );

        let settings = Arc::new(SettingsHandle::from_config(&config));

        let mut pipeline = Pipeline::standard();
        let configured: Option<Vec<CheckerConfig>> = config.get("proxy.checkers")?;
        for entry in configured.unwrap_or_default() {
            let checker = CheckerFactory::create_checker(&entry.type_, entry.config)?;
            info_fmt!("Startup", "Added checker: {}", checker.name());
            pipeline.push(checker);
        }
        for checker in self.custom_checkers {
            info_fmt!("Startup", "Added checker: {}", checker.name());
            pipeline.push(checker);
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let pool = PoolSettings::from(settings.load().settings());
                Arc::new(TransportExecutor::new(pool)) as Arc<dyn Transport>
            }
        };

        let engine = Arc::new(ProxyEngine::new(settings.clone(), pipeline, transport));

        let server_config = config
            .get_or_default("server", ServerConfig::default())
            .unwrap_or_else(|e| {
                warn_fmt!("Startup", "Invalid server section, using defaults: {}", e);
                ServerConfig::default()
            });
        let server = ProxyServer::new(server_config, engine);

        Ok(Fennec {
            config: Arc::new(ArcSwap::from_pointee(config)),
            sources: Arc::new(self.sources),
            settings,
            server,
        })
    }
}

fn init_logging(config: &Config) {
    let level = match env::var("RUST_LOG_LEVEL").ok().as_deref() {
        Some("trace") => LevelFilter::Trace,
        Some("debug") => LevelFilter::Debug,
        Some("warn") => LevelFilter::Warn,
        Some("error") => LevelFilter::Error,
        _ => LevelFilter::Info,
    };

    match config.get::<LoggingConfig>("proxy.logging") {
        Ok(Some(logging_config)) => logging::init_with_config(level, &logging_config),
        Ok(None) => logging::init(Some(level)),
        Err(e) => {
            logging::init(Some(level));
            warn_fmt!("Startup", "Failed to read logging configuration: {}", e);
        }
    }
}

/// An initialized proxy.
#[derive(Debug, Clone)]
pub struct Fennec {
    config: Arc<ArcSwap<Config>>,
    sources: Arc<ConfigSources>,
    settings: Arc<SettingsHandle>,
    server: ProxyServer,
}

impl Fennec {
    pub fn loader() -> FennecLoader {
        FennecLoader::new()
    }

    /// The configuration the current snapshot was built from.
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn settings(&self) -> &Arc<SettingsHandle> {
        &self.settings
    }

    pub fn engine(&self) -> &Arc<ProxyEngine> {
        self.server.engine()
    }

    pub fn server(&self) -> &ProxyServer {
        &self.server
    }

    /// Re-read every configuration source and publish a new snapshot.
    ///
    /// Requests already in flight keep the snapshot they started with.  The
    /// listener address, checker list and connection pool are not rebuilt.
    pub fn reload(&self) -> Result<(), LoaderError> {
        let config = self.sources.load()?;
        self.settings.reload(&config);
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Start the proxy server.
    pub async fn start(&self) -> Result<(), LoaderError> {
        self.server.start().await.map_err(LoaderError::ProxyError)
    }
}
