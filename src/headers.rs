// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Header rewriting for both directions of a forwarded exchange.
//!
//! The relay never decodes compressed bodies, so any `Accept-Encoding` or
//! `Content-Encoding` value mentioning gzip is dropped, which keeps the
//! exchange on identity encoding end to end.

use reqwest::header::{
    ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, HOST, HeaderMap, HeaderName, HeaderValue,
    TRANSFER_ENCODING,
};

use crate::core::{ProxyError, ProxyInfo};

fn mentions_gzip(value: &HeaderValue) -> bool {
    value
        .as_bytes()
        .windows(4)
        .any(|w| w.eq_ignore_ascii_case(b"gzip"))
}

/// Whether every instance of `name` should be dropped in either direction.
fn is_stripped(name: &HeaderName, headers: &HeaderMap) -> bool {
    if name == TRANSFER_ENCODING {
        return true;
    }
    if name == ACCEPT_ENCODING || name == CONTENT_ENCODING {
        return headers.get_all(name).iter().any(mentions_gzip);
    }
    false
}

/// Copy `headers` keeping every value of multi-valued names, minus the
/// names rejected by `drop`.
fn copy_except(headers: &HeaderMap, drop: impl Fn(&HeaderName) -> bool) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for name in headers.keys() {
        if drop(name) {
            continue;
        }
        for value in headers.get_all(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Headers sent to the target.
///
/// `Content-Length` is recomputed by the transport and `Transfer-Encoding`
/// is hop-by-hop; both are dropped.  `Host` is always set to the target.
pub fn forward_request_headers(
    inbound: &HeaderMap,
    info: &ProxyInfo,
) -> Result<HeaderMap, ProxyError> {
    let mut out = copy_except(inbound, |name| {
        name == CONTENT_LENGTH || name == HOST || is_stripped(name, inbound)
    });

    let host = HeaderValue::from_str(&info.host_header()).map_err(|e| {
        ProxyError::InvalidRequest(format!("Target host {} is not a valid header: {e}", info.host))
    })?;
    out.insert(HOST, host);
    Ok(out)
}

/// Headers exposed to the client from an upstream response.
pub fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    copy_except(upstream, |name| is_stripped(name, upstream))
}
