// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests: client → Fennec listener → mock origin.

use fennec::Fennec;
use serde_json::json;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;
use common::{RunningProxy, TestConfigProvider, client};

async fn proxy_with(config: serde_json::Value) -> RunningProxy {
    let provider = TestConfigProvider::from_json(config);
    RunningProxy::start(Fennec::loader().with_provider(provider)).await
}

#[tokio::test]
async fn test_get_round_trip_preserves_status_and_body() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/layers"))
        .respond_with(ResponseTemplate::new(200).set_body_string("B"))
        .expect(1)
        .mount(&origin)
        .await;

    let proxy = proxy_with(json!({})).await;
    let response = client()
        .get(proxy.url_for(&format!("{}/layers", origin.uri())))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "B");
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_whitelisted_host_passes_and_other_host_never_reaches_origin() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&origin)
        .await;

    let proxy = proxy_with(json!({
        "proxy": { "hostname_whitelist": ["127.0.0.1"], "methods_whitelist": ["GET"] }
    }))
    .await;
    let port = origin.address().port();

    let allowed = client()
        .get(proxy.url_for(&format!("http://127.0.0.1:{port}/x")))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
    assert_eq!(allowed.text().await.unwrap(), "ok");

    let denied = client()
        .get(proxy.url_for(&format!("http://localhost:{port}/x")))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 403);
    assert_eq!(
        denied.text().await.unwrap(),
        "Host Name localhost is not among the ones allowed for this proxy"
    );

    proxy.shutdown().await;
    // `expect(1)` is verified when `origin` drops.
}

#[tokio::test]
async fn test_denied_method_never_reaches_origin() {
    let origin = MockServer::start().await;
    Mock::given(path("/x"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&origin)
        .await;

    let proxy = proxy_with(json!({ "proxy": { "methods_whitelist": "GET" } })).await;
    let response = client()
        .post(proxy.url_for(&format!("{}/x", origin.uri())))
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    assert_eq!(
        response.text().await.unwrap(),
        "HTTP Method POST is not among the ones allowed for this proxy"
    );
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_outbound_headers_are_rewritten() {
    let origin = MockServer::start().await;
    Mock::given(path("/h"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Encoding", "gzip")
                .insert_header("X-Origin", "yes")
                .set_body_string("not really gzip"),
        )
        .mount(&origin)
        .await;

    let proxy = proxy_with(json!({})).await;
    let response = client()
        .get(proxy.url_for(&format!("{}/h", origin.uri())))
        .header("Accept-Encoding", "gzip, deflate")
        .header("X-Custom", "one")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(response.headers().get("x-origin").unwrap(), "yes");
    assert_eq!(response.text().await.unwrap(), "not really gzip");

    let received = origin.received_requests().await.unwrap();
    let seen = &received[0];
    assert_eq!(
        seen.headers.get("host").unwrap(),
        &format!("127.0.0.1:{}", origin.address().port())
    );
    assert!(seen.headers.get("accept-encoding").is_none());
    assert_eq!(seen.headers.get("x-custom").unwrap(), "one");

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_disallowed_headers_are_scrubbed_both_ways() {
    let origin = MockServer::start().await;
    Mock::given(path("/s"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "session=upstream")
                .set_body_string("scrubbed"),
        )
        .mount(&origin)
        .await;

    let proxy = proxy_with(json!({
        "proxy": { "disallowed_headers": "Cookie,Set-Cookie" }
    }))
    .await;
    let response = client()
        .get(proxy.url_for(&format!("{}/s", origin.uri())))
        .header("Cookie", "session=client")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().get("set-cookie").is_none());

    let received = origin.received_requests().await.unwrap();
    assert!(received[0].headers.get("cookie").is_none());

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_credentials_reach_origin_only_for_their_request() {
    let origin = MockServer::start().await;
    // "alice:secret"
    Mock::given(path("/private"))
        .and(header("authorization", "Basic YWxpY2U6c2VjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
        .mount(&origin)
        .await;
    Mock::given(path("/private"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&origin)
        .await;

    let proxy = proxy_with(json!({})).await;
    let target = format!("{}/private", origin.uri());

    let authed = client()
        .get(proxy.entry_url())
        .query(&[("url", target.as_str()), ("user", "alice"), ("password", "secret")])
        .send()
        .await
        .unwrap();
    assert_eq!(authed.status(), 200);
    assert_eq!(authed.text().await.unwrap(), "welcome");

    let anonymous = client().get(proxy.url_for(&target)).send().await.unwrap();
    assert_eq!(anonymous.status(), 401);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_redirect_and_not_modified() {
    let origin = MockServer::start().await;
    Mock::given(path("/moved"))
        .respond_with(
            ResponseTemplate::new(303).insert_header("Location", "http://example.com/a b"),
        )
        .mount(&origin)
        .await;
    Mock::given(path("/broken"))
        .respond_with(ResponseTemplate::new(302))
        .mount(&origin)
        .await;
    Mock::given(path("/cached"))
        .respond_with(ResponseTemplate::new(304).insert_header("ETag", "\"v1\""))
        .mount(&origin)
        .await;

    let proxy = proxy_with(json!({})).await;

    let moved = client()
        .get(proxy.url_for(&format!("{}/moved", origin.uri())))
        .send()
        .await
        .unwrap();
    assert_eq!(moved.status(), 302);
    assert_eq!(
        moved.headers().get("location").unwrap(),
        &format!("{}?url=http%3A%2F%2Fexample.com%2Fa%20b", proxy.entry_url())
    );

    let broken = client()
        .get(proxy.url_for(&format!("{}/broken", origin.uri())))
        .send()
        .await
        .unwrap();
    assert_eq!(broken.status(), 500);

    let cached = client()
        .get(proxy.url_for(&format!("{}/cached", origin.uri())))
        .send()
        .await
        .unwrap();
    assert_eq!(cached.status(), 304);
    // hyper strips Content-Length from 304 responses on the wire.
    assert!(cached.headers().get("etag").is_none());
    assert!(cached.bytes().await.unwrap().is_empty());

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_large_body_is_streamed_intact() {
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    let origin = MockServer::start().await;
    Mock::given(path("/big"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/octet-stream")
                .set_body_bytes(payload.clone()),
        )
        .mount(&origin)
        .await;

    let proxy = proxy_with(json!({ "proxy": { "stream_chunk_size": 512 } })).await;
    let response = client()
        .get(proxy.url_for(&format!("{}/big", origin.uri())))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), payload.as_slice());
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_request_bodies_are_forwarded() {
    let origin = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/doc"))
        .and(body_string("<doc/>"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&origin)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&origin)
        .await;

    let proxy = proxy_with(json!({})).await;

    let put = client()
        .put(proxy.url_for(&format!("{}/doc", origin.uri())))
        .header("Content-Type", "application/xml")
        .body("<doc/>")
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), 201);

    let multipart = "--outer\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        hello\r\n\
        --outer--\r\n";
    let post = client()
        .post(proxy.url_for(&format!("{}/upload", origin.uri())))
        .header("Content-Type", "multipart/form-data; boundary=outer")
        .body(multipart)
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 200);

    let received = origin.received_requests().await.unwrap();
    let upload = received
        .iter()
        .find(|r| r.url.path() == "/upload")
        .unwrap();
    let content_type = upload.headers.get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data; boundary=fennec-"));
    let body = String::from_utf8_lossy(&upload.body);
    assert!(body.contains("filename=\"a.txt\""));
    assert!(body.contains("hello"));
    assert!(!body.contains("--outer"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_content_type_whitelist_blocks_response() {
    let origin = MockServer::start().await;
    Mock::given(path("/json"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .mount(&origin)
        .await;
    Mock::given(path("/xml"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<a/>", "text/xml; charset=UTF-8"))
        .mount(&origin)
        .await;

    let proxy = proxy_with(json!({ "proxy": { "mimetype_whitelist": ["text/xml"] } })).await;

    let json_response = client()
        .get(proxy.url_for(&format!("{}/json", origin.uri())))
        .send()
        .await
        .unwrap();
    assert_eq!(json_response.status(), 403);
    assert_eq!(
        json_response.text().await.unwrap(),
        "Content-type application/json is not among the ones allowed for this proxy"
    );

    let xml_response = client()
        .get(proxy.url_for(&format!("{}/xml", origin.uri())))
        .send()
        .await
        .unwrap();
    assert_eq!(xml_response.status(), 200);
    assert_eq!(xml_response.text().await.unwrap(), "<a/>");

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_request_type_patterns_match_full_url() {
    let origin = MockServer::start().await;
    Mock::given(path("/wms"))
        .respond_with(ResponseTemplate::new(200).set_body_string("caps"))
        .mount(&origin)
        .await;

    let proxy = proxy_with(json!({
        "proxy": { "reqtype_whitelist": { "capabilities": ".*[Rr]equest=[Gg]et[Cc]apabilities.*" } }
    }))
    .await;

    let caps = client()
        .get(proxy.url_for(&format!("{}/wms?service=WMS&request=GetCapabilities", origin.uri())))
        .send()
        .await
        .unwrap();
    assert_eq!(caps.status(), 200);

    let map = client()
        .get(proxy.url_for(&format!("{}/wms?service=WMS&request=GetMap", origin.uri())))
        .send()
        .await
        .unwrap();
    assert_eq!(map.status(), 403);
    assert_eq!(
        map.text().await.unwrap(),
        "Request Type is not among the ones allowed for this proxy"
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_target_is_bad_gateway() {
    let proxy = proxy_with(json!({ "proxy": { "connection_timeout": 2000 } })).await;

    let response = client()
        .get(proxy.url_for("http://127.0.0.1:9/nothing"))
        .send()
        .await
        .unwrap();

    assert!(response.status() == 502 || response.status() == 504);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_missing_url_is_bad_request() {
    let proxy = proxy_with(json!({})).await;

    let response = client().get(proxy.entry_url()).send().await.unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "Missing required parameter: url");
    proxy.shutdown().await;
}
