// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP listener for the proxy endpoint.
//!
//! The server is a *thin* wrapper around **hyper-util**.  It owns the
//! listening socket and translates between hyper's types and the
//! [`InboundRequest`] / [`ProxyResponse`] values the engine works with.
//!
//! `hyper_util::server::conn::auto::Builder` serves HTTP/1.1 and HTTP/2 on
//! the same connection.  Inbound bodies are streamed into the engine and
//! relayed bodies are streamed back; neither is buffered here.


use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HOST, HeaderMap};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use reqwest::Body;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::core::{HttpMethod, InboundRequest, ProxyError, ProxyResponse};
use crate::engine::ProxyEngine;
use crate::{debug_fmt, error_fmt, info_fmt, trace_fmt, warn_fmt};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long open connections get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Listener configuration, read from the `server` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ProxyError> {
        format!("{}:{}", self.host, self.port)
            .parse::<SocketAddr>()
            .map_err(|e| ProxyError::Other(format!("Invalid server address: {e}")))
    }
}

/// HTTP server for the proxy endpoint.
#[derive(Debug, Clone)]
pub struct ProxyServer {
    config: ServerConfig,
    engine: Arc<ProxyEngine>,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, engine: Arc<ProxyEngine>) -> Self {
        Self { config, engine }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ProxyEngine> {
        &self.engine
    }

    /// Bind the configured address and serve until Ctrl-C or SIGTERM.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Other(format!("Failed to bind {addr}: {e}")))?;

        info_fmt!("Server", "Fennec proxy listening on http://{}", addr);
        self.serve(listener, shutdown_signal()?).await
    }

    /// Serve connections from `listener` until `shutdown` resolves, then
    /// drain the open connections.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut join_set = JoinSet::new();
        let fallback_host = self
            .config
            .socket_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("{}:{}", self.config.host, self.config.port));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info_fmt!("Server", "Shutdown requested; no longer accepting connections");
                    break;
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, remote_addr)) => {
                            let engine = self.engine.clone();
                            let fallback_host = fallback_host.clone();
                            let mut stop_rx = stop_rx.clone();

                            join_set.spawn(async move {
                                let service = service_fn(move |req: Request<Incoming>| {
                                    trace_fmt!("Server", "Incoming over {:?}", req.version());
                                    handle_request(
                                        req,
                                        engine.clone(),
                                        remote_addr,
                                        fallback_host.clone(),
                                    )
                                });

                                let builder = AutoBuilder::new(TokioExecutor::new());
                                let conn = builder.serve_connection(TokioIo::new(stream), service);
                                let mut conn = std::pin::pin!(conn);

                                tokio::select! {
                                    res = &mut conn => log_connection_end(res, remote_addr),
                                    _ = stop_rx.changed() => {
                                        conn.as_mut().graceful_shutdown();
                                        log_connection_end(conn.await, remote_addr);
                                    }
                                }
                            });
                        }
                        Err(e) => error_fmt!("Server", "Accept error: {}", e),
                    }
                }
            }
        }

        let _ = stop_tx.send(true);
        info_fmt!("Server", "Waiting for {} connection(s) to finish", join_set.len());

        let drain = async {
            while let Some(res) = join_set.join_next().await {
                if let Err(e) = res {
                    if !e.is_cancelled() {
                        error_fmt!("Server", "Connection task failed: {}", e);
                    }
                }
            }
        };

        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn_fmt!(
                "Server",
                "Connections still open after {}s; closing them",
                DRAIN_TIMEOUT.as_secs()
            );
            join_set.shutdown().await;
        }

        info_fmt!("Server", "Shutdown complete");
        Ok(())
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
fn shutdown_signal() -> Result<impl Future<Output = ()>, ProxyError> {
    #[cfg(unix)]
    let mut term = signal(SignalKind::terminate())
        .map_err(|e| ProxyError::Other(format!("Cannot install SIGTERM handler: {e}")))?;

    Ok(async move {
        #[cfg(unix)]
        let sigterm = async move {
            term.recv().await;
        };
        #[cfg(not(unix))]
        let sigterm = std::future::pending::<()>();

        tokio::select! {
            _ = signal::ctrl_c() => info_fmt!("Server", "Received Ctrl-C"),
            _ = sigterm => info_fmt!("Server", "Received SIGTERM"),
        }
    })
}

fn log_connection_end<E: std::fmt::Display>(res: Result<(), E>, remote_addr: SocketAddr) {
    match res {
        Ok(()) => trace_fmt!("Server", "Connection from {} closed", remote_addr),
        Err(e) => {
            let msg = e.to_string();
            if !msg.contains("connection closed") && !msg.contains("connection reset") {
                debug_fmt!("Server", "Connection from {} ended with error: {}", remote_addr, msg);
            }
        }
    }
}

/// Absolute URL of the proxy endpoint as the client addressed it, without
/// the query string.  Used as the base for rewritten redirects.
fn entry_url(uri: &Uri, headers: &HeaderMap, fallback_host: &str) -> String {
    if let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) {
        return format!("{scheme}://{authority}{}", uri.path());
    }

    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or(fallback_host);
    format!("http://{host}{}", uri.path())
}

/// Convert a hyper request into an [`InboundRequest`].
fn convert_hyper_request(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    fallback_host: &str,
) -> Result<InboundRequest, ProxyError> {
    let method = HttpMethod::try_from(req.method())?;
    let entry_url = entry_url(req.uri(), req.headers(), fallback_host);
    let query = req.uri().query().map(str::to_owned);
    let headers = req.headers().clone();

    trace_fmt!(
        "Server",
        "Converting {} {} with {} headers",
        method,
        entry_url,
        headers.len()
    );

    // Incoming → Stream → reqwest::Body
    let body = Body::wrap_stream(req.into_body().into_data_stream());

    Ok(InboundRequest {
        method,
        query,
        headers,
        body,
        remote_addr: Some(remote_addr.ip()),
        entry_url,
    })
}

/// Convert a [`ProxyResponse`] into a hyper response.
fn convert_proxy_response(resp: ProxyResponse) -> Result<Response<Body>, ProxyError> {
    trace_fmt!(
        "Server",
        "Converting response with status {} and {} headers",
        resp.status,
        resp.headers.len()
    );

    let mut builder = Response::builder().status(resp.status);
    let headers = builder.headers_mut().ok_or_else(|| {
        ProxyError::Other(format!("invalid response status {}", resp.status))
    })?;
    *headers = resp.headers;

    builder
        .body(resp.body)
        .map_err(|e| ProxyError::Other(format!("Failed to build response: {e}")))
}

fn internal_error() -> Response<Body> {
    let mut response = Response::new(Body::from("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

async fn handle_request(
    req: Request<Incoming>,
    engine: Arc<ProxyEngine>,
    remote_addr: SocketAddr,
    fallback_host: String,
) -> Result<Response<Body>, Infallible> {
    let proxy_response = match convert_hyper_request(req, remote_addr, &fallback_host) {
        Ok(inbound) => engine.handle(inbound).await,
        Err(e) => {
            debug_fmt!("Server", "Rejected request from {}: {}", remote_addr, e);
            ProxyResponse::from_error(&e)
        }
    };

    match convert_proxy_response(proxy_response) {
        Ok(response) => Ok(response),
        Err(e) => {
            error_fmt!("Server", "{}", e);
            Ok(internal_error())
        }
    }
}
