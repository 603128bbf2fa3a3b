// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Response relay.
//!
//! Turns an [`UpstreamResponse`] into the client-visible [`ProxyResponse`]:
//!
//! ```text
//! upstream ─┬─ 3xx (not 304) ─▶ Redirect ────┐
//!           ├─ 304 ───────────▶ NotModified ─┼─▶ client ─▶ lease released
//!           └─ otherwise ─────▶ Normal ──────┘
//! ```
//!
//! `Redirect` and `NotModified` drop the upstream body (and its pool lease)
//! before returning.  `Normal` hands the body to a [`RelayStream`], which
//! releases the lease once the body is exhausted, fails, or is dropped
//! because the client went away.
//!
//! The request side of body forwarding lives in [`multipart`].

pub mod multipart;


use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use http_body_util::BodyExt;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue, LOCATION};

use crate::core::{ProxyError, ProxyResponse, UpstreamResponse};
use crate::headers::filter_response_headers;
use crate::transport::ConnectionLease;
use crate::{debug_fmt, trace_fmt, warn_fmt};

/// The branch a received response takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Redirect,
    NotModified,
    Normal,
}

/// Branch taken for an upstream status.
pub fn classify(status: u16) -> RelayState {
    match status {
        304 => RelayState::NotModified,
        300..=399 => RelayState::Redirect,
        _ => RelayState::Normal,
    }
}

/// Location that sends the client back through the proxy entry point.
pub fn rewrite_location(entry_url: &str, location: &str) -> String {
    format!("{entry_url}?url={}", urlencoding::encode(location))
}

/// Builds client responses from upstream responses.
#[derive(Debug, Clone, Copy)]
pub struct ResponseRelay {
    chunk_size: usize,
}

impl ResponseRelay {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn relay(
        &self,
        entry_url: &str,
        upstream: UpstreamResponse,
        trace_id: &str,
    ) -> Result<ProxyResponse, ProxyError> {
        let state = classify(upstream.status);
        trace_fmt!("Relay", "[{}] {} -> {:?}", trace_id, upstream.status, state);

        match state {
            RelayState::Redirect => Self::redirect(entry_url, upstream),
            RelayState::NotModified => Ok(Self::not_modified(upstream)),
            RelayState::Normal => Ok(self.normal(upstream, trace_id)),
        }
    }

    fn redirect(entry_url: &str, upstream: UpstreamResponse) -> Result<ProxyResponse, ProxyError> {
        let status = upstream.status;
        let location = upstream
            .headers
            .get(LOCATION)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
        // Nothing is relayed from the upstream body.
        drop(upstream);

        let location = location.ok_or_else(|| {
            ProxyError::UpstreamProtocol(format!(
                "Received status code: {status} but no Location header was found in the response"
            ))
        })?;

        let new_location = rewrite_location(entry_url, &location);
        let mut headers = HeaderMap::new();
        headers.insert(
            LOCATION,
            HeaderValue::from_str(&new_location)
                .map_err(|e| {
                    ProxyError::UpstreamProtocol(format!("invalid redirect target: {e}"))
                })?,
        );

        Ok(ProxyResponse {
            status: 302,
            headers,
            body: reqwest::Body::from(Vec::new()),
        })
    }

    fn not_modified(upstream: UpstreamResponse) -> ProxyResponse {
        drop(upstream);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        ProxyResponse {
            status: 304,
            headers,
            body: reqwest::Body::from(Vec::new()),
        }
    }

    fn normal(&self, upstream: UpstreamResponse, trace_id: &str) -> ProxyResponse {
        let UpstreamResponse {
            status,
            headers,
            body,
            lease,
            ..
        } = upstream;

        let stream = RelayStream::new(
            body.into_data_stream(),
            self.chunk_size,
            lease,
            trace_id.to_string(),
        );

        ProxyResponse {
            status,
            headers: filter_response_headers(&headers),
            body: reqwest::Body::wrap_stream(stream),
        }
    }
}

/// Re-chunks an upstream body into pieces of at most `chunk_size` bytes and
/// owns the pool lease until the copy is over.
pub struct RelayStream<S> {
    upstream: Option<Pin<Box<S>>>,
    pending: Bytes,
    chunk_size: usize,
    lease: Option<ConnectionLease>,
    trace_id: String,
    relayed: u64,
}

impl<S> RelayStream<S> {
    pub fn new(
        upstream: S,
        chunk_size: usize,
        lease: Option<ConnectionLease>,
        trace_id: String,
    ) -> Self {
        Self {
            upstream: Some(Box::pin(upstream)),
            pending: Bytes::new(),
            chunk_size: chunk_size.max(1),
            lease,
            trace_id,
            relayed: 0,
        }
    }

    /// Upstream body first, then the pool slot.
    fn release(&mut self) {
        self.upstream = None;
        if self.lease.take().is_some() {
            trace_fmt!(
                "Relay",
                "[{}] relayed {} bytes, connection released",
                self.trace_id,
                self.relayed
            );
        }
    }

    fn next_chunk(&mut self) -> Bytes {
        let n = self.pending.len().min(self.chunk_size);
        self.relayed += n as u64;
        self.pending.split_to(n)
    }
}

impl<S> fmt::Debug for RelayStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayStream")
            .field("chunk_size", &self.chunk_size)
            .field("relayed", &self.relayed)
            .field("open", &self.upstream.is_some())
            .finish()
    }
}

impl<S, E> Stream for RelayStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    type Item = Result<Bytes, ProxyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if !this.pending.is_empty() {
                return Poll::Ready(Some(Ok(this.next_chunk())));
            }

            let Some(upstream) = this.upstream.as_mut() else {
                return Poll::Ready(None);
            };

            match upstream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.pending = bytes,
                Poll::Ready(Some(Err(e))) => {
                    warn_fmt!("Relay", "[{}] upstream body failed: {}", this.trace_id, e);
                    this.release();
                    return Poll::Ready(Some(Err(ProxyError::StreamRelay(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.release();
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> Drop for RelayStream<S> {
    fn drop(&mut self) {
        if self.lease.is_some() {
            debug_fmt!(
                "Relay",
                "[{}] client went away after {} bytes; releasing connection",
                self.trace_id,
                self.relayed
            );
        }
        self.release();
    }
}
