// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fennec - an access-controlled HTTP forwarding proxy
//!
//! Clients call a single endpoint with the target in a query parameter:
//!
//! ```text
//! GET /proxy?url=http%3A%2F%2Fmaps.example.org%2Fwms%3Frequest%3DGetCapabilities
//! ```
//!
//! Fennec admits or rejects the request, forwards it with the same verb,
//! and streams the answer back.  Redirects are rewritten so the client
//! comes back through the proxy; `304 Not Modified` is passed on without a
//! body.  Optional `user` and `password` parameters supply Basic-auth
//! credentials for that one upstream call.
//!
//! # Checkers
//!
//! Admission is done by an ordered list of [`Checker`]s.  The six built-in
//! ones enforce whitelists (client address, target host, verb, target URL
//! pattern, response content type) and scrub configured headers.  Every
//! whitelist is empty by default, which lets everything through.
//!
//! You can add your own by implementing the `Checker` trait:
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use fennec::{Checker, CheckerPhase, Exchange, InboundRequest, ProxyError};
//!
//! #[derive(Debug)]
//! struct NoInternalTargets;
//!
//! #[async_trait]
//! impl Checker for NoInternalTargets {
//!     fn phase(&self) -> CheckerPhase {
//!         CheckerPhase::Request
//!     }
//!
//!     fn name(&self) -> &str {
//!         "no_internal_targets"
//!     }
//!
//!     async fn on_request(
//!         &self,
//!         exchange: &Exchange,
//!         request: InboundRequest,
//!     ) -> Result<InboundRequest, ProxyError> {
//!         match exchange.target.host_str() {
//!             Some(host) if host.ends_with(".internal") => {
//!                 Err(ProxyError::forbidden(format!("{host} is internal")))
//!             }
//!             _ => Ok(request),
//!         }
//!     }
//! }
//!
//! # async fn run() -> Result<(), fennec::LoaderError> {
//! let fennec = fennec::Fennec::loader()
//!     .with_config_file("fennec.toml")
//!     .with_checker(NoInternalTargets)
//!     .build()
//!     .await?;
//! fennec.start().await
//! # }
//! ```
//!
//! # Configuration
//!
//! Settings are read from layered providers (TOML/JSON/YAML files and
//! `FENNEC_*` environment variables) into an immutable snapshot.  See
//! [`config`] for the keys and defaults.  [`Fennec::reload`] swaps in a new
//! snapshot without disturbing requests in flight.

pub mod checkers;
pub mod config;
pub mod core;
pub mod engine;
pub mod headers;
pub mod loader;
pub mod logging;
pub mod pipeline;
pub mod relay;
pub mod route;
pub mod server;
pub mod transport;

// Re-export key types at the crate root for convenience
pub use checkers::{Checker, CheckerFactory, CheckerPhase, register_checker};
pub use config::{ConfigError, ConfigProvider, ConfigProviderExt, ConfigSnapshot, SettingsHandle};
pub use crate::core::{
    Credentials, Exchange, HttpMethod, InboundRequest, ProxyError, ProxyInfo, ProxyResponse,
    TargetRequest, UpstreamResponse,
};
pub use engine::{ForwardParams, ProxyEngine};
pub use loader::{Fennec, FennecLoader, LoaderError};
pub use pipeline::Pipeline;
pub use relay::{RelayState, ResponseRelay};
pub use route::{RouteDecision, RoutePlanner};
pub use server::{ProxyServer, ServerConfig};
pub use transport::{ConnectionLease, PoolSettings, Transport, TransportExecutor};
