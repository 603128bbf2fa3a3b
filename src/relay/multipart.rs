// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multipart re-encoding for forwarded request bodies.
//!
//! A `multipart/form-data` body is parsed part by part and written out
//! again under a fresh boundary, since the original framing is not reused.
//! The returned content type carries the new boundary.

use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::BodyExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use uuid::Uuid;

use crate::core::ProxyError;

const DEFAULT_FILE_CONTENT_TYPE: &str = "application/octet-stream";

/// Whether the request body is `multipart/form-data`.
pub fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.trim_start()
                .get(..19)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case("multipart/form-data"))
        })
        .unwrap_or(false)
}

/// A re-encoded multipart body.
#[derive(Debug, Clone)]
pub struct EncodedMultipart {
    pub content_type: HeaderValue,
    pub body: Bytes,
    pub parts: usize,
}

fn invalid(e: multer::Error) -> ProxyError {
    match e {
        multer::Error::FieldSizeExceeded {
            limit, field_name, ..
        } => ProxyError::InvalidRequest(format!(
            "Multipart part {} exceeds the maximum upload size of {limit} bytes",
            field_name.unwrap_or_default()
        )),
        other => ProxyError::InvalidRequest(format!("Invalid multipart body: {other}")),
    }
}

fn quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

/// Parse `body` framed by the boundary in `content_type` and write every
/// part out again under a new boundary.
pub async fn reencode(
    content_type: &str,
    body: reqwest::Body,
    max_part_size: usize,
) -> Result<EncodedMultipart, ProxyError> {
    let boundary = multer::parse_boundary(content_type).map_err(invalid)?;
    let constraints = multer::Constraints::new()
        .size_limit(multer::SizeLimit::new().per_field(max_part_size as u64));
    let mut multipart =
        multer::Multipart::with_constraints(body.into_data_stream(), boundary, constraints);

    let new_boundary = format!("fennec-{}", Uuid::new_v4().simple());
    let mut out = BytesMut::new();
    let mut parts = 0;

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let part_type = field.content_type().map(|m| m.to_string());
        let data = field.bytes().await.map_err(invalid)?;

        out.put_slice(format!("--{new_boundary}\r\n").as_bytes());
        match file_name {
            Some(file_name) => {
                out.put_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                        quoted(&name),
                        quoted(&file_name)
                    )
                    .as_bytes(),
                );
                out.put_slice(
                    format!(
                        "Content-Type: {}\r\n",
                        part_type.as_deref().unwrap_or(DEFAULT_FILE_CONTENT_TYPE)
                    )
                    .as_bytes(),
                );
            }
            None => {
                out.put_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n", quoted(&name))
                        .as_bytes(),
                );
            }
        }
        out.put_slice(b"\r\n");
        out.put_slice(&data);
        out.put_slice(b"\r\n");
        parts += 1;
    }
    out.put_slice(format!("--{new_boundary}--\r\n").as_bytes());

    let content_type =
        HeaderValue::from_str(&format!("multipart/form-data; boundary={new_boundary}"))
            .map_err(|e| ProxyError::Other(format!("invalid multipart content type: {e}")))?;

    Ok(EncodedMultipart {
        content_type,
        body: out.freeze(),
        parts,
    })
}
