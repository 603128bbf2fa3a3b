// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upstream execution over a bounded connection pool.
//!
//! Bounding is done with semaphores: one for the whole pool and one per
//! route (`scheme://host:port`).  A caller that finds the pool exhausted
//! waits for a slot instead of failing.  The slot travels with the
//! response as a [`ConnectionLease`] and is released when the relayed body
//! finishes, fails or is dropped.
//!
//! Connection reuse itself is left to reqwest.  One client is kept per
//! [`RouteDecision`]; clients never carry default credentials, so Basic
//! auth is attached to each request individually.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::config::ProxySettings;
use crate::core::{ProxyError, TargetRequest, UpstreamResponse};
use crate::route::RouteDecision;
use crate::{debug_fmt, trace_fmt};

/// Executes one upstream call per forwarded request.
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    /// Send `request` along `route`.  Redirects are returned, never followed.
    async fn execute(
        &self,
        request: TargetRequest,
        route: &RouteDecision,
    ) -> Result<UpstreamResponse, ProxyError>;
}

/// Pool limits and timeouts, fixed for the executor's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_total: usize,
    pub max_per_route: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl From<&ProxySettings> for PoolSettings {
    fn from(settings: &ProxySettings) -> Self {
        Self {
            max_total: settings.max_total_connections,
            max_per_route: settings.max_connections_per_host,
            connect_timeout: settings.connection_timeout,
            read_timeout: settings.timeout,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&ProxySettings::default())
    }
}

/// A pool slot.  Released on drop.
pub struct ConnectionLease {
    route: String,
    _route_permit: OwnedSemaphorePermit,
    _total_permit: OwnedSemaphorePermit,
}

impl ConnectionLease {
    pub fn route(&self) -> &str {
        &self.route
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("route", &self.route)
            .finish()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        trace_fmt!("Transport", "Released connection slot for {}", self.route);
    }
}

/// Pool key for a target URL.
pub fn route_key(url: &Url) -> String {
    format!(
        "{}://{}:{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or(80)
    )
}

/// The production [`Transport`], backed by reqwest.
#[derive(Debug)]
pub struct TransportExecutor {
    pool: PoolSettings,
    total: Arc<Semaphore>,
    per_route: Mutex<HashMap<String, Arc<Semaphore>>>,
    clients: Mutex<HashMap<RouteDecision, reqwest::Client>>,
}

impl TransportExecutor {
    pub fn new(mut pool: PoolSettings) -> Self {
        pool.max_total = pool.max_total.clamp(1, Semaphore::MAX_PERMITS);
        pool.max_per_route = pool.max_per_route.clamp(1, Semaphore::MAX_PERMITS);
        debug_fmt!(
            "Transport",
            "Connection pool: {} total, {} per route",
            pool.max_total,
            pool.max_per_route
        );
        Self {
            total: Arc::new(Semaphore::new(pool.max_total)),
            per_route: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            pool,
        }
    }

    pub fn pool(&self) -> &PoolSettings {
        &self.pool
    }

    /// Slots currently free pool-wide.
    pub fn available(&self) -> usize {
        self.total.available_permits()
    }

    /// Semaphore for `key`, created on first use.
    ///
    /// Every outstanding permit and every waiter holds a clone of the
    /// semaphore, so an entry whose only owner is the map is idle and is
    /// dropped before a new route is added.
    fn route_semaphore(&self, key: &str) -> Arc<Semaphore> {
        let mut routes = self.per_route.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(semaphore) = routes.get(key) {
            return semaphore.clone();
        }

        routes.retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
        let semaphore = Arc::new(Semaphore::new(self.pool.max_per_route));
        routes.insert(key.to_string(), semaphore.clone());
        semaphore
    }

    /// Routes with a semaphore currently tracked.
    pub fn tracked_routes(&self) -> usize {
        self.per_route.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Wait for a slot on `key` and on the whole pool.
    pub async fn acquire(&self, key: &str) -> Result<ConnectionLease, ProxyError> {
        let closed = |_| ProxyError::Other("connection pool is closed".to_string());

        // Route first, so a saturated route does not pin pool-wide slots.
        let route_permit = self.route_semaphore(key).acquire_owned().await.map_err(closed)?;
        let total_permit = self.total.clone().acquire_owned().await.map_err(closed)?;

        trace_fmt!("Transport", "Leased connection slot for {}", key);
        Ok(ConnectionLease {
            route: key.to_string(),
            _route_permit: route_permit,
            _total_permit: total_permit,
        })
    }

    fn client_for(&self, route: &RouteDecision) -> Result<reqwest::Client, ProxyError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(route) {
            return Ok(client.clone());
        }

        let builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(self.pool.connect_timeout)
            .read_timeout(self.pool.read_timeout)
            .pool_max_idle_per_host(self.pool.max_per_route);

        let builder = match route {
            RouteDecision::Direct => builder.no_proxy(),
            RouteDecision::ViaProxy { host, port } => {
                builder.proxy(reqwest::Proxy::all(format!("http://{host}:{port}"))?)
            }
        };

        let client = builder.build()?;
        debug_fmt!("Transport", "Created upstream client ({})", route);
        clients.insert(route.clone(), client.clone());
        Ok(client)
    }

    fn map_error(&self, err: reqwest::Error) -> ProxyError {
        if err.is_timeout() {
            ProxyError::Timeout(self.pool.read_timeout)
        } else {
            ProxyError::Transport(err)
        }
    }
}

impl Default for TransportExecutor {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

#[async_trait]
impl Transport for TransportExecutor {
    async fn execute(
        &self,
        request: TargetRequest,
        route: &RouteDecision,
    ) -> Result<UpstreamResponse, ProxyError> {
        let lease = self.acquire(&route_key(&request.url)).await?;
        let client = self.client_for(route)?;

        let mut builder = client
            .request(request.method.into(), request.url.clone())
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(credentials) = &request.credentials {
            builder = builder.basic_auth(&credentials.user, Some(&credentials.password));
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let content_length = response.content_length();
        debug_fmt!(
            "Transport",
            "{} {} ({}) -> {}",
            request.method,
            request.url,
            route,
            status
        );

        Ok(UpstreamResponse {
            status,
            headers,
            body: reqwest::Body::wrap_stream(response.bytes_stream()),
            content_length,
            lease: Some(lease),
        })
    }
}
