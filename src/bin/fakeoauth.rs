//! A stand-in OAuth2 authorization server, for driving the site's login flow
//! locally without a real provider. It approves everybody as the same
//! configurable user. Supports authorization code + PKCE, and can hand out
//! an HS256 id_token if you ask it to.
//!
//! Endpoints: GET /oauth/authorize, POST /oauth/token, GET /oauth/userinfo,
//! GET /healthz.

use axum::{
    extract::{Form, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use clap::Parser;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::{thread_rng, RngCore};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::{
    fmt::layer as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Authorization codes are good for this long.
const CODE_TTL: Duration = Duration::from_secs(2 * 60);
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Fake OAuth2 provider for local development.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:9100")]
    addr: String,
    /// Public base URL (used as the id_token issuer). Defaults to http://<addr>.
    #[arg(long, default_value = "")]
    base_url: String,
    #[arg(long, default_value = "fake-client-id")]
    client_id: String,
    /// If set, token requests must present it (form field or basic auth).
    #[arg(long)]
    client_secret: Option<String>,
    #[arg(long, default_value = "u-123")]
    user_id: String,
    #[arg(long, default_value = "tester")]
    username: String,
    #[arg(long, default_value = "Test User")]
    name: String,
    #[arg(long, default_value = "tester@example.local")]
    email: String,
    #[arg(long, default_value = "")]
    avatar_url: String,
    /// Include a signed id_token in token responses.
    #[arg(long)]
    issue_id_token: bool,
    #[arg(long, default_value = "dev-secret")]
    jwt_secret: String,
    /// Access token lifetime.
    #[arg(long, default_value_t = 900)]
    token_ttl_secs: u64,
    /// Artificial delay before every response.
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,
    /// Debug-level logging.
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn issuer(&self) -> String {
        if self.base_url.is_empty() {
            format!("http://{}", self.addr)
        } else {
            self.base_url.trim_end_matches('/').to_string()
        }
    }
}

/// An outstanding authorization code.
struct Grant {
    client_id: String,
    redirect_uri: String,
    challenge: Option<String>,
    method: String,
    scope: String,
    expires: Instant,
}

struct FakeServer {
    args: Args,
    codes: Mutex<HashMap<String, Grant>>,
    tokens: Mutex<HashMap<String, Instant>>,
}

type Shared = Arc<FakeServer>;

impl FakeServer {
    fn new(args: Args) -> Self {
        Self {
            args,
            codes: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Drop expired codes and tokens; returns how many went.
    fn purge(&self) -> usize {
        let now = Instant::now();
        let mut codes = self.codes.lock();
        let mut tokens = self.tokens.lock();
        let before = codes.len() + tokens.len();
        codes.retain(|_, g| g.expires > now);
        tokens.retain(|_, exp| *exp > now);
        before - codes.len() - tokens.len()
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The standard OAuth2 error body.
#[derive(Debug)]
struct OAuthFail {
    status: StatusCode,
    error: &'static str,
    description: String,
}

impl OAuthFail {
    fn new(status: StatusCode, error: &'static str, description: impl Into<String>) -> Self {
        Self {
            status,
            error,
            description: description.into(),
        }
    }

    fn bad_request(error: &'static str, description: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, description)
    }
}

impl IntoResponse for OAuthFail {
    fn into_response(self) -> Response {
        debug!(error = self.error, "{}", self.description);
        let body = Json(json!({
            "error": self.error,
            "error_description": self.description,
        }));
        if self.status == StatusCode::UNAUTHORIZED {
            (self.status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (self.status, body).into_response()
        }
    }
}

fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> &'a str {
    params.get(key).map(String::as_str).unwrap_or("")
}

/// GET /oauth/authorize: no consent screen, just approve and redirect back.
async fn authorize(
    State(srv): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Redirect, OAuthFail> {
    if param(&params, "response_type") != "code" {
        return Err(OAuthFail::bad_request(
            "unsupported_response_type",
            "response_type must be code",
        ));
    }
    if param(&params, "client_id") != srv.args.client_id {
        return Err(OAuthFail::bad_request("unauthorized_client", "unknown client_id"));
    }
    let redirect_uri = param(&params, "redirect_uri");
    let mut target = match Url::parse(redirect_uri) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => u,
        _ => {
            return Err(OAuthFail::bad_request(
                "invalid_request",
                "redirect_uri must be an absolute http(s) URL",
            ))
        }
    };
    let method = param(&params, "code_challenge_method");
    if !(method.is_empty() || method == "S256") {
        return Err(OAuthFail::bad_request(
            "invalid_request",
            "code_challenge_method must be S256",
        ));
    }
    let challenge = params
        .get("code_challenge")
        .filter(|c| !c.is_empty())
        .cloned();

    let code = random_token();
    srv.codes.lock().insert(
        code.clone(),
        Grant {
            client_id: srv.args.client_id.clone(),
            redirect_uri: redirect_uri.to_string(),
            challenge,
            method: method.to_string(),
            scope: param(&params, "scope").to_string(),
            expires: Instant::now() + CODE_TTL,
        },
    );
    {
        let mut q = target.query_pairs_mut();
        q.append_pair("code", &code);
        if let Some(state) = params.get("state") {
            q.append_pair("state", state);
        }
    }
    info!(redirect_uri, "issued authorization code");
    Ok(Redirect::to(target.as_str()))
}

/// client_id/client_secret out of a basic auth header, if there is one.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

fn verify_pkce(grant: &Grant, verifier: &str) -> bool {
    let Some(challenge) = &grant.challenge else {
        return true;
    };
    if verifier.is_empty() {
        return false;
    }
    let computed = if grant.method == "S256" {
        URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
    } else {
        verifier.to_string()
    };
    &computed == challenge
}

fn sign_id_token(args: &Args, scope: &str) -> Result<String, OAuthFail> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let header = json!({"alg": "HS256", "typ": "JWT"});
    let claims = json!({
        "iss": args.issuer(),
        "sub": args.user_id,
        "aud": args.client_id,
        "iat": now,
        "exp": now + args.token_ttl_secs,
        "preferred_username": args.username,
        "name": args.name,
        "email": args.email,
        "scope": scope,
    });
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    );
    let mut mac = HmacSha256::new_from_slice(args.jwt_secret.as_bytes()).map_err(|e| {
        OAuthFail::new(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string())
    })?;
    mac.update(signing_input.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{}.{}", signing_input, sig))
}

/// POST /oauth/token: trade a code (plus PKCE verifier) for a token.
async fn token(
    State(srv): State<Shared>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, OAuthFail> {
    let args = &srv.args;
    if param(&form, "grant_type") != "authorization_code" {
        return Err(OAuthFail::bad_request(
            "unsupported_grant_type",
            "only authorization_code is supported",
        ));
    }
    let basic = basic_credentials(&headers);
    let client_id = basic
        .as_ref()
        .map(|(id, _)| id.as_str())
        .unwrap_or_else(|| param(&form, "client_id"));
    if client_id != args.client_id {
        return Err(OAuthFail::new(
            StatusCode::UNAUTHORIZED,
            "invalid_client",
            "unknown client_id",
        ));
    }
    if let Some(secret) = &args.client_secret {
        let presented = basic
            .as_ref()
            .map(|(_, s)| s.as_str())
            .unwrap_or_else(|| param(&form, "client_secret"));
        if presented != secret {
            return Err(OAuthFail::new(
                StatusCode::UNAUTHORIZED,
                "invalid_client",
                "bad client credentials",
            ));
        }
    }

    // Codes are single use: gone as soon as anyone presents them.
    let grant = srv
        .codes
        .lock()
        .remove(param(&form, "code"))
        .filter(|g| g.expires > Instant::now())
        .ok_or_else(|| OAuthFail::bad_request("invalid_grant", "unknown or expired code"))?;
    if grant.client_id != client_id {
        return Err(OAuthFail::bad_request("invalid_grant", "code was issued to another client"));
    }
    if grant.redirect_uri != param(&form, "redirect_uri") {
        return Err(OAuthFail::bad_request("invalid_grant", "redirect_uri mismatch"));
    }
    if !verify_pkce(&grant, param(&form, "code_verifier")) {
        return Err(OAuthFail::bad_request("invalid_grant", "PKCE verification failed"));
    }

    let access_token = random_token();
    let ttl = Duration::from_secs(args.token_ttl_secs);
    srv.tokens
        .lock()
        .insert(access_token.clone(), Instant::now() + ttl);

    let mut body = json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": args.token_ttl_secs,
        "refresh_token": format!("refresh-{}", random_token()),
    });
    if !grant.scope.is_empty() {
        body["scope"] = json!(grant.scope);
    }
    if args.issue_id_token {
        body["id_token"] = json!(sign_id_token(args, &grant.scope)?);
    }
    info!("issued access token");
    Ok(Json(body))
}

/// GET /oauth/userinfo: who the bearer token belongs to (always the same person).
async fn userinfo(
    State(srv): State<Shared>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, OAuthFail> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("");
    let live = srv
        .tokens
        .lock()
        .get(token)
        .is_some_and(|exp| *exp > Instant::now());
    if !live {
        return Err(OAuthFail::new(
            StatusCode::UNAUTHORIZED,
            "invalid_token",
            "missing, unknown, or expired access token",
        ));
    }
    let args = &srv.args;
    Ok(Json(json!({
        "id": args.user_id,
        "username": args.username,
        "name": args.name,
        "email": args.email,
        "avatar_url": args.avatar_url,
    })))
}

async fn latency(State(srv): State<Shared>, request: Request, next: Next) -> Response {
    if srv.args.latency_ms > 0 {
        tokio::time::sleep(Duration::from_millis(srv.args.latency_ms)).await;
    }
    next.run(request).await
}

fn fake_app(srv: Shared) -> Router {
    Router::new()
        .route("/oauth/authorize", get(authorize))
        .route("/oauth/token", post(token))
        .route("/oauth/userinfo", get(userinfo))
        .route("/healthz", get(|| async { "ok\n" }))
        .layer(from_fn_with_state(srv.clone(), latency))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(srv)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt_layer())
        .init();

    let srv: Shared = Arc::new(FakeServer::new(args.clone()));

    let janitor_srv = srv.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = janitor_srv.purge();
            if purged > 0 {
                debug!(purged, "purged expired codes/tokens");
            }
        }
    });

    let listener = TcpListener::bind(&args.addr).await?;
    info!(issuer = %args.issuer(), client_id = %args.client_id, "fake oauth listening on {}", args.addr);
    if args.client_secret.is_none() {
        warn!("no --client-secret set; any caller with the client_id can redeem codes");
    }
    axum::serve(listener, fake_app(srv))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request as HttpRequest;
    use tower::ServiceExt;

    fn test_args(extra: &[&str]) -> Args {
        let mut argv = vec!["fakeoauth"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    fn pkce_pair() -> (String, String) {
        let verifier = random_token();
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        (verifier, challenge)
    }

    async fn send(app: &Router, req: HttpRequest<Body>) -> (StatusCode, HeaderMap, serde_json::Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, headers, json)
    }

    /// Run authorize and return the issued code.
    async fn get_code(app: &Router, challenge: &str) -> String {
        let uri = format!(
            "/oauth/authorize?response_type=code&client_id=fake-client-id&redirect_uri={}&scope=profile+email&state=xyz&code_challenge={}&code_challenge_method=S256",
            "http%3A%2F%2Flocalhost%3A3210%2Ffake%2Foauth%2Fcallback",
            challenge
        );
        let req = HttpRequest::get(uri).body(Body::empty()).unwrap();
        let (status, headers, _) = send(app, req).await;
        assert!(status.is_redirection());
        let loc = Url::parse(headers[header::LOCATION].to_str().unwrap()).unwrap();
        assert!(loc.as_str().starts_with("http://localhost:3210/fake/oauth/callback?"));
        let q: HashMap<String, String> = loc.query_pairs().into_owned().collect();
        assert_eq!(q["state"], "xyz");
        q["code"].clone()
    }

    fn token_req(code: &str, verifier: &str) -> HttpRequest<Body> {
        let form = format!(
            "grant_type=authorization_code&code={}&redirect_uri={}&client_id=fake-client-id&code_verifier={}",
            code, "http%3A%2F%2Flocalhost%3A3210%2Ffake%2Foauth%2Fcallback", verifier
        );
        HttpRequest::post("/oauth/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap()
    }

    #[tokio::test]
    async fn code_token_userinfo_round_trip() {
        let app = fake_app(Arc::new(FakeServer::new(test_args(&[]))));
        let (verifier, challenge) = pkce_pair();
        let code = get_code(&app, &challenge).await;

        let (status, _, body) = send(&app, token_req(&code, &verifier)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["token_type"], "Bearer");
        assert_eq!(body["expires_in"], 900);
        assert_eq!(body["scope"], "profile email");
        assert!(body["refresh_token"].as_str().unwrap().starts_with("refresh-"));
        assert!(body.get("id_token").is_none());
        let access = body["access_token"].as_str().unwrap().to_string();

        // codes are single use
        let (status, _, body) = send(&app, token_req(&code, &verifier)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_grant");

        let req = HttpRequest::get("/oauth/userinfo")
            .header(header::AUTHORIZATION, format!("Bearer {}", access))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "u-123");
        assert_eq!(body["username"], "tester");
        assert_eq!(body["email"], "tester@example.local");

        let req = HttpRequest::get("/oauth/userinfo")
            .header(header::AUTHORIZATION, "Bearer made-up")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(headers[header::WWW_AUTHENTICATE], "Bearer");
        assert_eq!(body["error"], "invalid_token");
    }

    #[tokio::test]
    async fn pkce_mismatch_rejected() {
        let app = fake_app(Arc::new(FakeServer::new(test_args(&[]))));
        let (_verifier, challenge) = pkce_pair();
        let code = get_code(&app, &challenge).await;
        let (status, _, body) = send(&app, token_req(&code, "not-the-verifier")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_grant");
        assert_eq!(body["error_description"], "PKCE verification failed");
    }

    #[tokio::test]
    async fn authorize_validates_inputs() {
        let app = fake_app(Arc::new(FakeServer::new(test_args(&[]))));
        let cases = [
            ("response_type=token&client_id=fake-client-id&redirect_uri=http%3A%2F%2Fa.test%2F", "unsupported_response_type"),
            ("response_type=code&client_id=other&redirect_uri=http%3A%2F%2Fa.test%2F", "unauthorized_client"),
            ("response_type=code&client_id=fake-client-id&redirect_uri=ftp%3A%2F%2Fa.test%2F", "invalid_request"),
            ("response_type=code&client_id=fake-client-id&redirect_uri=http%3A%2F%2Fa.test%2F&code_challenge=x&code_challenge_method=plain", "invalid_request"),
        ];
        for (query, error) in cases {
            let req = HttpRequest::get(format!("/oauth/authorize?{}", query))
                .body(Body::empty())
                .unwrap();
            let (status, _, body) = send(&app, req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", query);
            assert_eq!(body["error"], error, "{}", query);
        }
    }

    #[tokio::test]
    async fn client_secret_and_id_token() {
        let args = test_args(&["--client-secret", "shh", "--issue-id-token", "--jwt-secret", "k"]);
        let app = fake_app(Arc::new(FakeServer::new(args)));
        let (verifier, challenge) = pkce_pair();

        // no secret presented
        let code = get_code(&app, &challenge).await;
        let (status, _, body) = send(&app, token_req(&code, &verifier)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_client");

        // secret via basic auth
        let code = get_code(&app, &challenge).await;
        let mut req = token_req(&code, &verifier);
        req.headers_mut().insert(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("fake-client-id:shh"))
                .parse()
                .unwrap(),
        );
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);

        let id_token = body["id_token"].as_str().unwrap();
        let parts: Vec<&str> = id_token.split('.').collect();
        assert_eq!(parts.len(), 3);
        let mut mac = HmacSha256::new_from_slice(b"k").unwrap();
        mac.update(format!("{}.{}", parts[0], parts[1]).as_bytes());
        mac.verify_slice(&URL_SAFE_NO_PAD.decode(parts[2]).unwrap())
            .unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["sub"], "u-123");
        assert_eq!(claims["aud"], "fake-client-id");
        assert_eq!(claims["iss"], "http://127.0.0.1:9100");
    }

    #[test]
    fn purge_drops_expired() {
        let srv = FakeServer::new(test_args(&["--token-ttl-secs", "0"]));
        srv.tokens.lock().insert("old".to_string(), Instant::now());
        srv.codes.lock().insert(
            "stale".to_string(),
            Grant {
                client_id: "fake-client-id".to_string(),
                redirect_uri: "http://a.test/".to_string(),
                challenge: None,
                method: String::new(),
                scope: String::new(),
                expires: Instant::now(),
            },
        );
        assert_eq!(srv.purge(), 2);
        assert_eq!(srv.purge(), 0);
    }
}
