use super::*;
use crate::app::oauth::{exchange_code, fetch_identity, Endpoints, Provider};
use axum::{
    extract::{Form, State as AxState},
    routing::{get, post},
    Json,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use url::Url;

/// What the mock provider saw, plus the challenge it should hold the
/// verifier to.
#[derive(Default)]
struct MockProvider {
    challenge: Mutex<Option<String>>,
    token_forms: Mutex<Vec<HashMap<String, String>>>,
}

type Mock = Arc<MockProvider>;
/// (Authorization header, form) for each token request.
type SeenRequests = Arc<Mutex<Vec<(Option<String>, HashMap<String, String>)>>>;

async fn mock_token(
    AxState(mock): AxState<Mock>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<serde_json::Value>) {
    mock.token_forms.lock().push(form.clone());
    let expected = mock.challenge.lock().clone();
    let verifier = form.get("code_verifier").cloned().unwrap_or_default();
    let pkce_ok = expected.as_deref() == Some(crate::util::pkce_challenge(&verifier).as_str());
    if form.get("code").map(String::as_str) != Some("good-code") || !pkce_ok {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant", "error_description": "nope"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({"access_token": "tok-1", "token_type": "Bearer", "expires_in": 900})),
    )
}

async fn mock_userinfo(headers: http::HeaderMap) -> (StatusCode, Json<serde_json::Value>) {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer tok-1");
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid_token"})));
    }
    (
        StatusCode::OK,
        Json(json!({
            "id": "u-123",
            "username": "tester",
            "name": "Test User",
            "email": "tester@example.local",
            "avatar_url": ""
        })),
    )
}

async fn fake_provider() -> (Mock, String) {
    let mock = Mock::default();
    let router = axum::Router::new()
        .route("/oauth/token", post(mock_token))
        .route("/oauth/userinfo", get(mock_userinfo))
        .with_state(mock.clone());
    let base = spawn_mock(router).await;
    (mock, base)
}

async fn state_for_mock(base: &str) -> (tempfile::TempDir, AppState) {
    let mut config = SiteConfig::test_config().unwrap();
    if let Some(fake) = config.fake_oauth.as_mut() {
        fake.base_url = Url::parse(base).unwrap();
    }
    test_state_with(config).await
}

/// Query params of a redirect's Location.
fn redirect_params(resp: &Response<Body>) -> (Url, HashMap<String, String>) {
    let url = Url::parse(location(resp)).unwrap();
    let params = url.query_pairs().into_owned().collect();
    (url, params)
}

#[tokio::test]
async fn full_fake_login_flow() {
    let (mock, base) = fake_provider().await;
    let (_dir, state) = state_for_mock(&base).await;
    let mut app = edev_app(state.clone());

    // Step 1: we send the browser off to the provider with state + PKCE.
    let req = new_req("GET", "/login/fake").empty();
    let resp = do_req(&mut app, req).await;
    assert!(resp.status().is_redirection());
    let (url, params) = redirect_params(&resp);
    assert!(url.as_str().starts_with(&format!("{}/oauth/authorize", base)));
    assert_eq!(params["response_type"], "code");
    assert_eq!(params["client_id"], "fake-client-id");
    assert_eq!(params["redirect_uri"], "http://localhost:3210/fake/oauth/callback");
    assert_eq!(params["scope"], "profile email");
    assert_eq!(params["code_challenge_method"], "S256");
    let login_state = params["state"].clone();
    *mock.challenge.lock() = Some(params["code_challenge"].clone());

    // Step 2: provider sends them back with a code.
    let callback = format!("/fake/oauth/callback?code=good-code&state={}", login_state);
    let resp = do_req(&mut app, new_req("GET", &callback).empty()).await;
    assert!(resp.status().is_redirection(), "got {}", resp.status());
    assert_eq!(location(&resp), "http://localhost:3210/");
    let sid = set_cookie_value(resp.headers(), "sid").unwrap();
    assert!(!sid.is_empty());
    let set_cookie = resp.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Lax"));

    // The token request carried what it should.
    {
        let forms = mock.token_forms.lock();
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0]["grant_type"], "authorization_code");
        assert_eq!(forms[0]["client_id"], "fake-client-id");
        assert_eq!(forms[0]["redirect_uri"], "http://localhost:3210/fake/oauth/callback");
        assert!(!forms[0].contains_key("client_secret"));
    }

    // Step 3: the session works, and the user got recorded.
    let resp = do_req(&mut app, new_req("GET", "/me").session(&sid).empty()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_bytes(resp).await;
    let me: SessionUser = serde_json::from_slice(&body).unwrap();
    assert_eq!(me.login, "tester");
    assert_eq!(me.name, "Test User");
    let user = state.db.users().find("fake", "u-123").await.unwrap().unwrap();
    assert_eq!(user.id, me.id);

    // Replaying the callback doesn't work; the state was single-use.
    let resp = do_req(&mut app, new_req("GET", &callback).empty()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.db.users().count().await.unwrap(), 1);
}

#[tokio::test]
async fn pkce_mismatch_is_a_bad_gateway() {
    let (mock, base) = fake_provider().await;
    let (_dir, state) = state_for_mock(&base).await;
    let mut app = edev_app(state.clone());

    let resp = do_req(&mut app, new_req("GET", "/login/fake").empty()).await;
    let (_, params) = redirect_params(&resp);
    // provider remembers some other challenge
    *mock.challenge.lock() = Some(crate::util::pkce_challenge("something-else"));

    let callback = format!("/fake/oauth/callback?code=good-code&state={}", params["state"]);
    let resp = do_req(&mut app, new_req("GET", &callback).empty()).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert!(set_cookie_value(resp.headers(), "sid").is_none());
    let body = body_bytes(resp).await;
    assert!(bytes_str(&body).contains("invalid_grant"));
    assert_eq!(state.db.users().count().await.unwrap(), 0);
}

#[tokio::test]
async fn bad_callbacks_are_turned_away() {
    let (_dir, state) = test_state().await;
    let mut app = edev_app(state.clone());

    // unknown state
    let resp = do_req(
        &mut app,
        new_req("GET", "/fake/oauth/callback?code=abc&state=never-issued").empty(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // provider said no; the reason shows up, escaped
    let resp = do_req(
        &mut app,
        new_req(
            "GET",
            "/fake/oauth/callback?error=access_denied&error_description=%3Cb%3Eno%3C%2Fb%3E",
        )
        .empty(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_bytes(resp).await;
    assert!(bytes_str(&body).contains("access_denied"));
    assert!(!bytes_str(&body).contains("<b>no</b>"));

    // valid state but no code
    let resp = do_req(&mut app, new_req("GET", "/login/fake").empty()).await;
    let (_, params) = redirect_params(&resp);
    let uri = format!("/fake/oauth/callback?state={}", params["state"]);
    let resp = do_req(&mut app, new_req("GET", &uri).empty()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // providers that aren't configured, or don't exist
    for uri in ["/login/github", "/login/x", "/login/myspace"] {
        let resp = do_req(&mut app, new_req("GET", uri).empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{}", uri);
    }
}

#[tokio::test]
async fn x_user_lookup_falls_back_on_403() {
    let router = axum::Router::new()
        .route(
            "/2/users/me",
            get(|| async { (StatusCode::FORBIDDEN, "client-not-enrolled") }),
        )
        .route(
            "/1.1/account/verify_credentials.json",
            get(|| async {
                Json(json!({
                    "id": 12,
                    "id_str": "12",
                    "screen_name": "jack",
                    "name": "jack",
                    "profile_image_url_https": "https://pbs.twimg.com/j.jpg"
                }))
            }),
        );
    let base = spawn_mock(router).await;
    let ep = Endpoints {
        authorize: format!("{}/authorize", base),
        token: format!("{}/token", base),
        userinfo: format!("{}/2/users/me", base),
        userinfo_fallback: Some(format!("{}/1.1/account/verify_credentials.json", base)),
        client_id: "cid".to_string(),
        client_secret: Some("shh".to_string()),
    };
    let http = reqwest::Client::new();
    let ident = fetch_identity(&http, Provider::X, &ep, "tok").await.unwrap();
    assert_eq!(ident.provider_id, "12");
    assert_eq!(ident.login, "jack");
    assert_eq!(ident.avatar_url, "https://pbs.twimg.com/j.jpg");

    // No fallback configured: the 403 is the answer.
    let ep = Endpoints {
        userinfo_fallback: None,
        ..ep
    };
    assert!(fetch_identity(&http, Provider::X, &ep, "tok").await.is_err());
}

#[tokio::test]
async fn token_exchange_credential_styles() {
    let seen = SeenRequests::default();
    let router = axum::Router::new()
        .route(
            "/github",
            // GitHub answers errors with a 200.
            post(|| async { Json(json!({"error": "bad_verification_code"})) }),
        )
        .route(
            "/x",
            post(
                |AxState(seen): AxState<SeenRequests>,
                 headers: http::HeaderMap,
                 Form(form): Form<HashMap<String, String>>| async move {
                    let auth = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    seen.lock().push((auth, form));
                    Json(json!({"access_token": "x-tok", "token_type": "bearer"}))
                },
            ),
        )
        .with_state(seen.clone());
    let base = spawn_mock(router).await;
    let http = reqwest::Client::new();

    let ep = |path: &str| Endpoints {
        authorize: String::new(),
        token: format!("{}{}", base, path),
        userinfo: String::new(),
        userinfo_fallback: None,
        client_id: "cid".to_string(),
        client_secret: Some("shh".to_string()),
    };

    let err = exchange_code(&http, Provider::GitHub, &ep("/github"), "c", "https://s/cb", "v")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bad_verification_code"));

    let tok = exchange_code(&http, Provider::X, &ep("/x"), "c", "https://s/cb", "v")
        .await
        .unwrap();
    assert_eq!(tok, "x-tok");
    let seen = seen.lock();
    let (auth, form) = &seen[0];
    // base64("cid:shh")
    assert_eq!(auth.as_deref(), Some("Basic Y2lkOnNoaA=="));
    assert_eq!(form["code_verifier"], "v");
    assert!(!form.contains_key("client_secret"));
}
