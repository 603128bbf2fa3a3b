// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Immutable configuration snapshots and the handle that swaps them.

use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;

use super::{Config, ProxySettings};
use crate::route::RoutePlanner;
use crate::{info_fmt, warn_fmt};

/// Settings plus everything derived from them that is costly to rebuild
/// per request.
#[derive(Debug)]
pub struct ConfigSnapshot {
    settings: ProxySettings,
    request_types: Vec<Regex>,
    planner: RoutePlanner,
}

impl ConfigSnapshot {
    pub fn new(settings: ProxySettings) -> Self {
        let request_types = settings
            .reqtype_whitelist
            .iter()
            .filter_map(|pattern| match Regex::new(&format!("^(?:{pattern})$")) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn_fmt!(
                        "Config",
                        "Skipping invalid request type pattern '{}': {}",
                        pattern,
                        e
                    );
                    None
                }
            })
            .collect();
        let planner = RoutePlanner::new(&settings.forward);

        Self {
            settings,
            request_types,
            planner,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ProxySettings::from_config(config))
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Compiled request-type patterns, anchored at both ends.
    ///
    /// May be shorter than `settings().reqtype_whitelist` when a pattern
    /// failed to compile.
    pub fn request_types(&self) -> &[Regex] {
        &self.request_types
    }

    pub fn planner(&self) -> &RoutePlanner {
        &self.planner
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::new(ProxySettings::default())
    }
}

/// Shared, atomically replaceable pointer to the current [`ConfigSnapshot`].
///
/// Requests call [`load`](Self::load) once and keep the returned `Arc`, so a
/// reload never changes the settings of a request already in flight.
#[derive(Debug)]
pub struct SettingsHandle {
    current: ArcSwap<ConfigSnapshot>,
}

impl SettingsHandle {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(snapshot)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ConfigSnapshot::from_config(config))
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    pub fn replace(&self, snapshot: ConfigSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    /// Rebuild the snapshot from `config` and publish it.
    pub fn reload(&self, config: &Config) {
        self.replace(ConfigSnapshot::from_config(config));
        info_fmt!("Config", "Configuration snapshot reloaded");
    }
}
