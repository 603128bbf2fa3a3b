// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The proxy engine: one inbound request in, one client response out.
//!
//! ```text
//! query ─▶ ForwardParams ─▶ pipeline.on_request ─▶ headers + body
//!       ─▶ planner.plan ─▶ transport.execute ─▶ pipeline.on_remote_response
//!       ─▶ relay ─▶ ProxyResponse            (pipeline.on_finish always)
//! ```
//!
//! Every failure is turned into a [`ProxyResponse`] here, so the server
//! never sees a `ProxyError` coming out of [`ProxyEngine::handle`].

use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap};
use url::Url;

use crate::config::SettingsHandle;
use crate::core::{
    Credentials, Exchange, InboundRequest, ProxyError, ProxyInfo, ProxyResponse, TargetRequest,
};
use crate::headers::forward_request_headers;
use crate::logging::structured::generate_trace_id;
use crate::pipeline::Pipeline;
use crate::relay::ResponseRelay;
use crate::relay::multipart;
use crate::transport::Transport;
use crate::{debug_fmt, error_fmt, info_fmt, trace_fmt, warn_fmt};

/// The query parameters that steer one forwarded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardParams {
    pub target: Url,
    /// The `url` value as supplied, trimmed but otherwise untouched.
    pub requested_url: String,
    pub credentials: Option<Credentials>,
}

impl ForwardParams {
    /// Read `url`, `user` and `password` from a raw query string.
    ///
    /// The first occurrence of each name wins.  Credentials are only used
    /// when both halves are present.
    pub fn from_query(query: Option<&str>) -> Result<Self, ProxyError> {
        let mut url = None;
        let mut user = None;
        let mut password = None;

        for (name, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            let slot = match name.as_ref() {
                "url" => &mut url,
                "user" => &mut user,
                "password" => &mut password,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }

        let raw = url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ProxyError::InvalidRequest("Missing required parameter: url".into()))?;
        let requested_url = raw.trim().to_string();
        let target = Url::parse(&requested_url).map_err(|e| {
            ProxyError::InvalidRequest(format!("Parameter url is not a valid absolute URL: {e}"))
        })?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(ProxyError::InvalidRequest(format!(
                "Unsupported target scheme: {}",
                target.scheme()
            )));
        }
        if target.host_str().is_none_or(str::is_empty) {
            return Err(ProxyError::InvalidRequest(format!("Target URL {target} has no host")));
        }

        let credentials = match (user, password) {
            (Some(user), Some(password)) => Some(Credentials { user, password }),
            _ => None,
        };

        Ok(Self {
            target,
            requested_url,
            credentials,
        })
    }
}

/// Orchestrates the pipeline, transport and relay for each request.
#[derive(Debug, Clone)]
pub struct ProxyEngine {
    settings: Arc<SettingsHandle>,
    pipeline: Pipeline,
    transport: Arc<dyn Transport>,
}

impl ProxyEngine {
    pub fn new(
        settings: Arc<SettingsHandle>,
        pipeline: Pipeline,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            settings,
            pipeline,
            transport,
        }
    }

    pub fn settings(&self) -> &Arc<SettingsHandle> {
        &self.settings
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Forward `request` and produce the response for the client.
    pub async fn handle(&self, request: InboundRequest) -> ProxyResponse {
        let trace_id = generate_trace_id();

        // The only read of the live settings for this request.
        let snapshot = self.settings.load();

        let params = match ForwardParams::from_query(request.query.as_deref()) {
            Ok(params) => params,
            Err(err) => {
                debug_fmt!("Engine", "[{}] rejected before admission: {}", trace_id, err);
                self.pipeline.on_finish(None).await;
                return ProxyResponse::from_error(&err);
            }
        };

        let exchange = Exchange {
            snapshot,
            target: params.target,
            requested_url: params.requested_url,
            trace_id,
        };
        debug_fmt!(
            "Engine",
            "[{}] {} {}",
            exchange.trace_id,
            request.method,
            exchange.target
        );

        let result = self.forward(&exchange, request, params.credentials).await;
        self.pipeline.on_finish(Some(&exchange)).await;

        match result {
            Ok(response) => {
                trace_fmt!("Engine", "[{}] -> {}", exchange.trace_id, response.status);
                response
            }
            Err(err) => {
                Self::log_failure(&exchange, &err);
                ProxyResponse::from_error(&err)
            }
        }
    }

    async fn forward(
        &self,
        exchange: &Exchange,
        request: InboundRequest,
        credentials: Option<Credentials>,
    ) -> Result<ProxyResponse, ProxyError> {
        let request = self.pipeline.on_request(exchange, request).await?;
        let InboundRequest {
            method,
            headers: inbound_headers,
            body: inbound_body,
            entry_url,
            ..
        } = request;

        let settings = exchange.snapshot.settings();
        let info = ProxyInfo::from_url(&exchange.target)?;

        let mut headers = forward_request_headers(&inbound_headers, &info)?;
        if credentials.is_some() {
            headers.remove(AUTHORIZATION);
        }

        let body = if method.carries_body() {
            Some(
                Self::outbound_body(
                    exchange,
                    inbound_body,
                    &mut headers,
                    settings.max_file_upload_size,
                )
                .await?,
            )
        } else {
            None
        };

        let route = exchange.snapshot.planner().plan(&exchange.target);
        debug_fmt!(
            "Engine",
            "[{}] forwarding to {} ({}{})",
            exchange.trace_id,
            info.host_header(),
            route,
            if credentials.is_some() { ", with credentials" } else { "" }
        );

        let target = TargetRequest {
            method,
            url: exchange.target.clone(),
            headers,
            body,
            credentials,
        };

        let mut upstream = self.transport.execute(target, &route).await?;
        self.pipeline.on_remote_response(exchange, &mut upstream).await?;

        ResponseRelay::new(settings.stream_chunk_size).relay(
            &entry_url,
            upstream,
            &exchange.trace_id,
        )
    }

    /// Multipart bodies are re-encoded; anything else streams through.
    async fn outbound_body(
        exchange: &Exchange,
        body: reqwest::Body,
        headers: &mut HeaderMap,
        max_part_size: usize,
    ) -> Result<reqwest::Body, ProxyError> {
        if !multipart::is_multipart(headers) {
            return Ok(body);
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default();
        let encoded = multipart::reencode(&content_type, body, max_part_size).await?;
        debug_fmt!(
            "Engine",
            "[{}] re-encoded {} multipart part(s), {} bytes",
            exchange.trace_id,
            encoded.parts,
            encoded.body.len()
        );

        headers.insert(CONTENT_TYPE, encoded.content_type);
        Ok(reqwest::Body::from(encoded.body))
    }

    fn log_failure(exchange: &Exchange, err: &ProxyError) {
        let id = &exchange.trace_id;
        match err {
            ProxyError::AdmissionDenied { status, message } => {
                info_fmt!("Engine", "[{}] denied ({}): {}", id, status, message)
            }
            ProxyError::InvalidRequest(_) | ProxyError::MethodNotAllowed(_) => {
                debug_fmt!("Engine", "[{}] bad request: {}", id, err)
            }
            ProxyError::Transport(_) | ProxyError::Timeout(_) => {
                warn_fmt!("Engine", "[{}] upstream {} failed: {}", id, exchange.target, err)
            }
            _ => error_fmt!("Engine", "[{}] {} failed: {}", id, exchange.target, err),
        }
    }
}
