// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Admission and response checkers.
//!
//! A [`Checker`] can veto a request before anything is sent upstream, veto
//! or trim an upstream response before any body bytes reach the client, and
//! clean up once the exchange is over.  Checkers carry no per-request state:
//! everything they need arrives through the [`Exchange`], including the
//! configuration snapshot the request was admitted under.
//!
//! The built-in set, in the order [`CheckerFactory::standard`] returns it:
//!
//! | name                 | phase    | rejects when |
//! |----------------------|----------|--------------|
//! | `disallowed_headers` | both     | never; strips configured headers |
//! | `client_address`     | request  | client address not whitelisted |
//! | `target_hostname`    | request  | target host not whitelisted |
//! | `method`             | request  | verb not whitelisted |
//! | `request_type`       | request  | no pattern matches the target URL |
//! | `content_type`       | response | base MIME type not whitelisted |
//!
//! An empty whitelist always passes.


use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::header::{CONTENT_TYPE, HeaderMap};

use crate::core::{Exchange, InboundRequest, ProxyError, UpstreamResponse};
use crate::{debug_fmt, trace_fmt};

/// Header carrying the original client address when behind another proxy.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Which pipeline phases a checker takes part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerPhase {
    /// Only before the upstream call
    Request,
    /// Only on the upstream response
    Response,
    /// Both of the above
    Both,
}

impl CheckerPhase {
    pub fn is_request(&self) -> bool {
        matches!(self, CheckerPhase::Request | CheckerPhase::Both)
    }

    pub fn is_response(&self) -> bool {
        matches!(self, CheckerPhase::Response | CheckerPhase::Both)
    }
}

/// A pluggable admission / response filter.
#[async_trait]
pub trait Checker: fmt::Debug + Send + Sync {
    fn phase(&self) -> CheckerPhase;

    fn name(&self) -> &str;

    /// Inspect and optionally rewrite the inbound request.
    async fn on_request(
        &self,
        _exchange: &Exchange,
        request: InboundRequest,
    ) -> Result<InboundRequest, ProxyError> {
        Ok(request)
    }

    /// Inspect the upstream response before its body is relayed.
    async fn on_remote_response(
        &self,
        _exchange: &Exchange,
        _response: &mut UpstreamResponse,
    ) -> Result<(), ProxyError> {
        Ok(())
    }

    /// Runs once per inbound request, whatever happened before.  `None`
    /// when the request was rejected before a target was known.  Must not
    /// fail.
    async fn on_finish(&self, _exchange: Option<&Exchange>) {}
}

pub type CheckerConstructor = fn(serde_json::Value) -> Result<Arc<dyn Checker>, ProxyError>;

static CHECKER_REGISTRY: Lazy<RwLock<HashMap<String, CheckerConstructor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a custom checker type so `proxy.checkers` entries can name it.
///
/// ```rust
/// use fennec::checkers::{register_checker, Checker, CheckerPhase};
///
/// #[derive(Debug)]
/// struct AuditChecker;
///
/// #[async_trait::async_trait]
/// impl Checker for AuditChecker {
///     fn phase(&self) -> CheckerPhase { CheckerPhase::Request }
///     fn name(&self) -> &str { "audit" }
/// }
///
/// register_checker("audit", |_cfg| Ok(std::sync::Arc::new(AuditChecker)));
/// ```
pub fn register_checker(name: &str, ctor: CheckerConstructor) {
    CHECKER_REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.to_string(), ctor);
}

fn registered_checker(name: &str) -> Option<CheckerConstructor> {
    CHECKER_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .copied()
}

fn not_allowed(what: &str, value: &str) -> ProxyError {
    ProxyError::forbidden(format!(
        "{what} {value} is not among the ones allowed for this proxy"
    ))
}

fn scrub(headers: &mut HeaderMap, disallowed: &std::collections::HashSet<String>) -> usize {
    let doomed: Vec<_> = headers
        .keys()
        .filter(|name| disallowed.contains(name.as_str()))
        .cloned()
        .collect();
    for name in &doomed {
        headers.remove(name);
    }
    doomed.len()
}

/// Removes configured headers from the inbound request and the upstream
/// response.  Header names are compared case-insensitively.
#[derive(Debug, Default)]
pub struct DisallowedHeaderScrubber;

#[async_trait]
impl Checker for DisallowedHeaderScrubber {
    fn phase(&self) -> CheckerPhase {
        CheckerPhase::Both
    }

    fn name(&self) -> &str {
        "disallowed_headers"
    }

    async fn on_request(
        &self,
        exchange: &Exchange,
        mut request: InboundRequest,
    ) -> Result<InboundRequest, ProxyError> {
        let disallowed = &exchange.snapshot.settings().disallowed_headers;
        if !disallowed.is_empty() {
            let removed = scrub(&mut request.headers, disallowed);
            trace_fmt!("Checker", "[{}] scrubbed {} request header(s)", exchange.trace_id, removed);
        }
        Ok(request)
    }

    async fn on_remote_response(
        &self,
        exchange: &Exchange,
        response: &mut UpstreamResponse,
    ) -> Result<(), ProxyError> {
        let disallowed = &exchange.snapshot.settings().disallowed_headers;
        if !disallowed.is_empty() {
            let removed = scrub(&mut response.headers, disallowed);
            trace_fmt!(
                "Checker",
                "[{}] scrubbed {} response header(s)",
                exchange.trace_id,
                removed
            );
        }
        Ok(())
    }
}

/// Rejects clients whose address is not whitelisted.
#[derive(Debug, Default)]
pub struct ClientAddressChecker;

impl ClientAddressChecker {
    /// First `X-Forwarded-For` entry, else the connected peer.
    pub fn client_address(request: &InboundRequest) -> String {
        let forwarded = request
            .headers
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match (forwarded, request.remote_addr) {
            (Some(addr), _) => addr.to_string(),
            (None, Some(ip)) => ip.to_string(),
            (None, None) => String::new(),
        }
    }
}

#[async_trait]
impl Checker for ClientAddressChecker {
    fn phase(&self) -> CheckerPhase {
        CheckerPhase::Request
    }

    fn name(&self) -> &str {
        "client_address"
    }

    async fn on_request(
        &self,
        exchange: &Exchange,
        request: InboundRequest,
    ) -> Result<InboundRequest, ProxyError> {
        let whitelist = &exchange.snapshot.settings().hosts_whitelist;
        if whitelist.is_empty() {
            return Ok(request);
        }

        let client = Self::client_address(&request);
        if whitelist.contains(&client) {
            Ok(request)
        } else {
            debug_fmt!("Checker", "[{}] client {} denied", exchange.trace_id, client);
            Err(not_allowed("Client Host", &client))
        }
    }
}

/// Rejects targets whose host is not whitelisted.
#[derive(Debug, Default)]
pub struct TargetHostnameChecker;

#[async_trait]
impl Checker for TargetHostnameChecker {
    fn phase(&self) -> CheckerPhase {
        CheckerPhase::Request
    }

    fn name(&self) -> &str {
        "target_hostname"
    }

    async fn on_request(
        &self,
        exchange: &Exchange,
        request: InboundRequest,
    ) -> Result<InboundRequest, ProxyError> {
        let whitelist = &exchange.snapshot.settings().hostname_whitelist;
        if whitelist.is_empty() {
            return Ok(request);
        }

        let host = exchange.target.host_str().unwrap_or_default();
        if whitelist.contains(host) {
            Ok(request)
        } else {
            Err(not_allowed("Host Name", host))
        }
    }
}

/// Rejects verbs that are not whitelisted.  Case-sensitive.
#[derive(Debug, Default)]
pub struct MethodChecker;

#[async_trait]
impl Checker for MethodChecker {
    fn phase(&self) -> CheckerPhase {
        CheckerPhase::Request
    }

    fn name(&self) -> &str {
        "method"
    }

    async fn on_request(
        &self,
        exchange: &Exchange,
        request: InboundRequest,
    ) -> Result<InboundRequest, ProxyError> {
        let whitelist = &exchange.snapshot.settings().methods_whitelist;
        if whitelist.is_empty() || whitelist.contains(request.method.as_str()) {
            Ok(request)
        } else {
            Err(not_allowed("HTTP Method", request.method.as_str()))
        }
    }
}

/// Requires the whole target URL, query included, to match one of the
/// configured patterns.
#[derive(Debug, Default)]
pub struct RequestTypeChecker;

#[async_trait]
impl Checker for RequestTypeChecker {
    fn phase(&self) -> CheckerPhase {
        CheckerPhase::Request
    }

    fn name(&self) -> &str {
        "request_type"
    }

    async fn on_request(
        &self,
        exchange: &Exchange,
        request: InboundRequest,
    ) -> Result<InboundRequest, ProxyError> {
        let snapshot = &exchange.snapshot;
        if snapshot.settings().reqtype_whitelist.is_empty() {
            return Ok(request);
        }

        let target = exchange.requested_url.as_str();
        if snapshot.request_types().iter().any(|re| re.is_match(target)) {
            Ok(request)
        } else {
            Err(ProxyError::forbidden(
                "Request Type is not among the ones allowed for this proxy",
            ))
        }
    }
}

/// Rejects upstream responses whose base content type is not whitelisted.
/// Responses without a `Content-Type` pass.
#[derive(Debug, Default)]
pub struct ContentTypeChecker;

impl ContentTypeChecker {
    /// First `Content-Type` value with parameters removed.
    pub fn base_content_type(headers: &HeaderMap) -> Option<String> {
        let raw = headers.get(CONTENT_TYPE)?;
        let value = String::from_utf8_lossy(raw.as_bytes());
        let base = value.split(';').next().unwrap_or_default().trim();
        Some(base.to_string())
    }
}

#[async_trait]
impl Checker for ContentTypeChecker {
    fn phase(&self) -> CheckerPhase {
        CheckerPhase::Response
    }

    fn name(&self) -> &str {
        "content_type"
    }

    async fn on_remote_response(
        &self,
        exchange: &Exchange,
        response: &mut UpstreamResponse,
    ) -> Result<(), ProxyError> {
        let whitelist = &exchange.snapshot.settings().mimetype_whitelist;
        if whitelist.is_empty() {
            return Ok(());
        }

        match Self::base_content_type(&response.headers) {
            Some(content_type) if !whitelist.contains(&content_type) => {
                Err(not_allowed("Content-type", &content_type))
            }
            _ => Ok(()),
        }
    }
}

/// Builds checkers by type name.
#[derive(Debug)]
pub struct CheckerFactory;

impl CheckerFactory {
    /// Create a checker, preferring one registered with [`register_checker`].
    pub fn create_checker(
        checker_type: &str,
        config: serde_json::Value,
    ) -> Result<Arc<dyn Checker>, ProxyError> {
        debug_fmt!("Checker", "Creating checker of type '{}'", checker_type);

        if let Some(ctor) = registered_checker(checker_type) {
            return ctor(config);
        }

        let checker: Arc<dyn Checker> = match checker_type {
            "disallowed_headers" => Arc::new(DisallowedHeaderScrubber),
            "client_address" => Arc::new(ClientAddressChecker),
            "target_hostname" => Arc::new(TargetHostnameChecker),
            "method" => Arc::new(MethodChecker),
            "request_type" => Arc::new(RequestTypeChecker),
            "content_type" => Arc::new(ContentTypeChecker),
            other => {
                return Err(ProxyError::ConfigError(format!(
                    "unknown checker type: {other}"
                )));
            }
        };
        Ok(checker)
    }

    /// The built-in checkers in pipeline order.
    pub fn standard() -> Vec<Arc<dyn Checker>> {
        vec![
            Arc::new(DisallowedHeaderScrubber),
            Arc::new(ClientAddressChecker),
            Arc::new(TargetHostnameChecker),
            Arc::new(MethodChecker),
            Arc::new(RequestTypeChecker),
            Arc::new(ContentTypeChecker),
        ]
    }
}
