#![cfg(test)]

mod oauth;
mod web;

use axum::body::{to_bytes, Body, Bytes};
use http::{header, request::Builder, HeaderMap, Request, Response, StatusCode};
use scraper::{Html, Selector};
use std::sync::Arc;
use tower::{Service, ServiceExt}; // for `call`, `oneshot`, and `ready`

use super::sessions::SessionUser;
use super::state::*;
use super::*;
use crate::config::SiteConfig;

// Ground rules: storage and session store methods are tested where they live,
// so these mostly care about routing, status codes, headers, and cookies.
//
// This file has test helpers. The web and oauth files have tests.

// SHORTCUTS FOR MAKING THINGS

/// App state on a scratch database, with the fake provider enabled (pointed
/// at nothing unless you point it somewhere). Keep the TempDir around.
async fn test_state() -> (tempfile::TempDir, AppState) {
    test_state_with(SiteConfig::test_config().unwrap()).await
}

async fn test_state_with(config: SiteConfig) -> (tempfile::TempDir, AppState) {
    let (dir, db) = crate::db::Gateway::new_test_db().await;
    let templates = load_templates().unwrap();
    let inner = AppInner::new(db, config, templates).unwrap();
    (dir, Arc::new(inner))
}

/// Shove a session straight into the store; returns its ID.
fn test_session(state: &AppState, login: &str) -> String {
    state.sessions.create(SessionUser {
        id: 1,
        provider: "fake".to_string(),
        login: login.to_string(),
        name: "Test User".to_string(),
        avatar_url: String::new(),
    })
}

/// Serve a router on a random local port, for standing in as an oauth
/// provider. Returns its base URL.
async fn spawn_mock(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Shortcut for request builder w/ method and URI.
fn new_req(method: impl AsRef<str>, uri: impl AsRef<str>) -> Builder {
    Request::builder().method(method.as_ref()).uri(uri.as_ref())
}

// Axum routers can't handle type inference for the ServiceExt methods since
// they're no longer generic over the body type, so: uniform function call
// syntax, corralled into this thing.
async fn do_req(app: &mut axum::Router, req: Request<Body>) -> Response<Body> {
    ServiceExt::<Request<Body>>::ready(app)
        .await
        .unwrap()
        .call(req)
        .await
        .unwrap()
}

/// One-shot CSS selector construction
fn sel(s: &str) -> Selector {
    Selector::parse(s).unwrap()
}

/// A few little extension methods for request::Builder.
trait TestRequestBuilder {
    /// Adds the (insecure, since tests run with fake oauth) session cookie.
    fn session(self, session: &str) -> Self;
    /// Finish with an empty body.
    fn empty(self) -> Request<Body>;
}

impl TestRequestBuilder for Builder {
    fn session(self, sessid: &str) -> Self {
        self.header(header::COOKIE, format!("sid={}", sessid))
    }
    fn empty(self) -> Request<Body> {
        self.body(Body::empty()).unwrap()
    }
}

/// Convenience extension methods for scraper::Html.
trait HasSelector {
    fn has(&self, selector: &str) -> bool;
}

impl HasSelector for Html {
    fn has(&self, selector: &str) -> bool {
        self.select(&sel(selector)).next().is_some()
    }
}

// TRANSFORMING FORMATS

/// Consumes a response to return the body as a Bytes.
async fn body_bytes(resp: Response<Body>) -> Bytes {
    to_bytes(resp.into_body(), usize::MAX).await.unwrap()
}

/// Borrows a Bytes as a &str for quick .contains() checks. Panics on non-utf8.
fn bytes_str(b: &Bytes) -> &str {
    std::str::from_utf8(b.as_ref()).unwrap()
}

/// Borrows a Bytes as an HTML document
fn bytes_doc(b: &Bytes) -> Html {
    Html::parse_document(bytes_str(b))
}

/// The Location header, as a str.
fn location(resp: &Response<Body>) -> &str {
    resp.headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
}

/// The value of the named cookie among the Set-Cookie headers, if any.
fn set_cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&prefix))
        .map(|v| {
            let rest = &v[prefix.len()..];
            rest.split(';').next().unwrap_or("").to_string()
        })
}

// TESTING OUTCOMES

/// Consumes response. Panics unless it's status 200 and contains ALL of the
/// specified substrings in the body.
async fn assert_page_and_contains_all(resp: Response<Body>, substrs: &[&str]) {
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_bytes(resp).await;
    let body_str = bytes_str(&body);
    for &s in substrs {
        assert!(body_str.contains(s), "expected {:?} in body", s);
    }
}

/// Panics unless the response carries the full set of security headers.
fn assert_security_headers(resp: &Response<Body>) {
    let h = resp.headers();
    assert_eq!(h.get(header::X_CONTENT_TYPE_OPTIONS).unwrap(), "nosniff");
    assert_eq!(h.get(header::X_FRAME_OPTIONS).unwrap(), "DENY");
    assert_eq!(h.get(header::REFERRER_POLICY).unwrap(), "no-referrer");
    let csp = h
        .get(header::CONTENT_SECURITY_POLICY)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(csp.starts_with("default-src 'self'"));
    assert!(csp.contains("frame-ancestors 'none'"));
}

/// Reports whether page shows the logged-in nav.
fn has_logged_in_nav(doc: &Html) -> bool {
    doc.has("nav .who") && doc.has("form#logout")
}
