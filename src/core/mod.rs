// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core primitives – the values that move through one forwarded exchange.
//!
//! No IO happens here.  The server converts wire requests into
//! [`InboundRequest`]s, the engine turns them into [`TargetRequest`]s, the
//! transport answers with an [`UpstreamResponse`] and the relay produces the
//! [`ProxyResponse`] handed back to the server.


use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use thiserror::Error;
use url::Url;

use crate::config::ConfigSnapshot;
use crate::transport::ConnectionLease;

/// Errors that can occur while forwarding a request.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// A checker vetoed the exchange.  Surfaced verbatim to the client.
    #[error("{message}")]
    AdmissionDenied { status: u16, message: String },

    /// The upstream answered with something the relay cannot honour.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// Connect or IO failure talking to the upstream.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Failure while copying or closing a body stream.
    #[error("stream relay error: {0}")]
    StreamRelay(String),

    /// The inbound request is malformed (missing `url`, bad multipart body…).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP Method {0} is not supported by this proxy")]
    MethodNotAllowed(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("{0}")]
    Other(String),
}

impl From<crate::config::ConfigError> for ProxyError {
    fn from(err: crate::config::ConfigError) -> Self {
        ProxyError::ConfigError(err.to_string())
    }
}

impl ProxyError {
    /// Admission veto with HTTP 403.
    pub fn forbidden(message: impl Into<String>) -> Self {
        ProxyError::AdmissionDenied {
            status: 403,
            message: message.into(),
        }
    }

    pub fn is_admission_denied(&self) -> bool {
        matches!(self, ProxyError::AdmissionDenied { .. })
    }

    /// Status code reported to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::AdmissionDenied { status, .. } => *status,
            ProxyError::InvalidRequest(_) => 400,
            ProxyError::MethodNotAllowed(_) => 405,
            ProxyError::Transport(_) => 502,
            ProxyError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Body text reported to the client.
    ///
    /// Admission and request errors carry their own message; everything
    /// else is reduced to a generic reason phrase.
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::AdmissionDenied { message, .. } => message.clone(),
            ProxyError::InvalidRequest(message) => message.clone(),
            ProxyError::MethodNotAllowed(_) => self.to_string(),
            ProxyError::Transport(_) => "Bad Gateway".to_string(),
            ProxyError::Timeout(_) => "Gateway Timeout".to_string(),
            _ => "Internal Server Error".to_string(),
        }
    }
}

/// HTTP verbs accepted by the proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether the inbound body is forwarded for this verb.
    pub fn carries_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&reqwest::Method> for HttpMethod {
    type Error = ProxyError;

    fn try_from(method: &reqwest::Method) -> Result<Self, Self::Error> {
        match *method {
            reqwest::Method::GET => Ok(HttpMethod::Get),
            reqwest::Method::POST => Ok(HttpMethod::Post),
            reqwest::Method::PUT => Ok(HttpMethod::Put),
            reqwest::Method::DELETE => Ok(HttpMethod::Delete),
            ref other => Err(ProxyError::MethodNotAllowed(other.to_string())),
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A request as received by the proxy endpoint.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: HttpMethod,
    /// Raw query string of the proxy endpoint, carrying `url`, `user`, `password`.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
    /// Address of the directly connected peer.
    pub remote_addr: Option<IpAddr>,
    /// Absolute URL of the proxy endpoint without its query string.
    pub entry_url: String,
}

impl InboundRequest {
    /// Convenience constructor for a body-less request.
    pub fn new(method: HttpMethod, entry_url: impl Into<String>, query: Option<&str>) -> Self {
        Self {
            method,
            query: query.map(str::to_string),
            headers: HeaderMap::new(),
            body: reqwest::Body::from(Vec::new()),
            remote_addr: None,
            entry_url: entry_url.into(),
        }
    }
}

/// Basic-auth credentials scoped to one upstream call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The request sent to the target.
#[derive(Debug)]
pub struct TargetRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<reqwest::Body>,
    pub credentials: Option<Credentials>,
}

/// Target coordinates derived once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub host: String,
    pub path: String,
    /// Explicit port, or the scheme default (80 / 443).
    pub port: u16,
}

impl ProxyInfo {
    pub fn from_url(url: &Url) -> Result<Self, ProxyError> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::InvalidRequest(format!("Target URL {url} has no host")))?;

        Ok(Self {
            host: host.to_string(),
            path: url.path().to_string(),
            port: url.port_or_known_default().unwrap_or(80),
        })
    }

    /// Value of the outbound `Host` header.
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// What came back from the upstream, before relaying.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
    pub content_length: Option<u64>,
    /// Pool slot held until the body has been relayed or dropped.
    pub lease: Option<ConnectionLease>,
}

impl UpstreamResponse {
    /// A response with no pool lease attached.
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<reqwest::Body>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            content_length: None,
            lease: None,
        }
    }
}

/// Client-visible response produced by the engine.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
}

impl ProxyResponse {
    /// Plain-text error response for `err`.
    pub fn from_error(err: &ProxyError) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status: err.status_code(),
            headers,
            body: reqwest::Body::from(err.client_message()),
        }
    }
}

/// Per-request context shared by every pipeline phase.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// The settings this request observes for its whole lifetime.
    pub snapshot: Arc<ConfigSnapshot>,
    pub target: Url,
    /// The `url` parameter as the client sent it, before normalization.
    pub requested_url: String,
    pub trace_id: String,
}

impl Exchange {
    /// An exchange whose requested URL is the serialized `target`.
    pub fn new(snapshot: Arc<ConfigSnapshot>, target: Url, trace_id: impl Into<String>) -> Self {
        Self {
            snapshot,
            requested_url: target.as_str().to_string(),
            target,
            trace_id: trace_id.into(),
        }
    }
}
