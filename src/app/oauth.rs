//! OAuth2 login: authorization code flow with PKCE (S256), against GitHub,
//! X, or the local fake provider.
//!
//! A login goes: `/login/:provider` stashes a fresh state param and PKCE
//! verifier in [LoginStates] and redirects to the provider. The provider
//! sends the browser back to our callback with `code` and `state`; we take
//! the verifier back out (single use), trade the code for an access token,
//! ask the provider who that token belongs to, record the user, start a
//! session, and redirect home.

use super::sessions::{session_cookie, SessionUser};
use super::state::AppState;
use super::web_result::{WebError, WebResult};
use crate::config::SiteConfig;
use crate::db::ProviderIdentity;
use crate::util::{make_pkce, new_opaque_id, IntoHandlerError, UserError};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Redirect,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tower_cookies::Cookies;
use tracing::{info, warn};
use url::Url;

/// Upper bound on every call we make to a provider.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

const GITHUB_AUTHORIZE: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN: &str = "https://github.com/login/oauth/access_token";
const GITHUB_USER: &str = "https://api.github.com/user";
const X_AUTHORIZE: &str = "https://twitter.com/i/oauth2/authorize";
const X_TOKEN: &str = "https://api.twitter.com/2/oauth2/token";
const X_USER: &str = "https://api.x.com/2/users/me?user.fields=profile_image_url";
const X_USER_LEGACY: &str = "https://api.x.com/1.1/account/verify_credentials.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    GitHub,
    X,
    Fake,
}

impl Provider {
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "github" => Some(Self::GitHub),
            "x" => Some(Self::X),
            "fake" => Some(Self::Fake),
            _ => None,
        }
    }

    /// Also what lands in the users.provider column.
    pub fn slug(self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::X => "x",
            Self::Fake => "fake",
        }
    }

    /// How long a started login stays redeemable.
    pub fn login_ttl(self) -> Duration {
        match self {
            Self::GitHub | Self::X => Duration::from_secs(10 * 60),
            Self::Fake => Duration::from_secs(5 * 60),
        }
    }

    pub fn callback_path(self, config: &SiteConfig) -> String {
        match self {
            Self::GitHub => "/github/oauth/callback".to_string(),
            Self::X => "/x/oauth/callback".to_string(),
            Self::Fake => config
                .fake_oauth
                .as_ref()
                .map(|f| f.redirect_path.clone())
                .unwrap_or_else(|| "/fake/oauth/callback".to_string()),
        }
    }

    /// Where to talk to this provider, or ProviderDisabled if the site isn't
    /// set up for it.
    pub fn endpoints(self, config: &SiteConfig) -> Result<Endpoints, UserError> {
        let disabled = UserError::ProviderDisabled {
            provider: self.slug(),
        };
        match self {
            Self::GitHub if config.github.is_configured() => Ok(Endpoints {
                authorize: GITHUB_AUTHORIZE.to_string(),
                token: GITHUB_TOKEN.to_string(),
                userinfo: GITHUB_USER.to_string(),
                userinfo_fallback: None,
                client_id: config.github.client_id.clone(),
                client_secret: Some(config.github.client_secret.clone()),
            }),
            Self::X if config.x.is_configured() => Ok(Endpoints {
                authorize: X_AUTHORIZE.to_string(),
                token: X_TOKEN.to_string(),
                userinfo: X_USER.to_string(),
                userinfo_fallback: Some(X_USER_LEGACY.to_string()),
                client_id: config.x.client_id.clone(),
                client_secret: Some(config.x.client_secret.clone()),
            }),
            Self::Fake => {
                let fake = config.fake_oauth.as_ref().ok_or(disabled)?;
                let base = fake.base_url.as_str().trim_end_matches('/');
                Ok(Endpoints {
                    authorize: format!("{}/oauth/authorize", base),
                    token: format!("{}/oauth/token", base),
                    userinfo: format!("{}/oauth/userinfo", base),
                    userinfo_fallback: None,
                    client_id: fake.client_id.clone(),
                    client_secret: None,
                })
            }
            _ => Err(disabled),
        }
    }

    fn scope(self) -> &'static str {
        match self {
            Self::GitHub => "read:user",
            Self::X => "tweet.read users.read",
            Self::Fake => "profile email",
        }
    }

    /// How the token request carries client credentials.
    fn auth_style(self) -> AuthStyle {
        match self {
            Self::GitHub => AuthStyle::InParams,
            Self::X => AuthStyle::BasicAuth,
            Self::Fake => AuthStyle::PublicClient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStyle {
    /// client_id + client_secret as form fields.
    InParams,
    /// HTTP basic auth with client_id:client_secret; client_id in the form too.
    BasicAuth,
    /// client_id only. PKCE is the whole proof.
    PublicClient,
}

/// One provider's URLs and our client credentials for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub authorize: String,
    pub token: String,
    pub userinfo: String,
    /// Tried when `userinfo` answers 403.
    pub userinfo_fallback: Option<String>,
    pub client_id: String,
    pub client_secret: Option<String>,
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("couldn't reach {provider}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} wouldn't trade the login code for a token: {detail}")]
    TokenExchange {
        provider: &'static str,
        detail: String,
    },
    #[error("{provider} wouldn't say who you are: {detail}")]
    UserInfo {
        provider: &'static str,
        detail: String,
    },
    #[error("invalid provider url")]
    BadUrl(#[from] url::ParseError),
}

impl IntoHandlerError for OAuthError {
    fn status_and_message(self) -> (StatusCode, String) {
        let status = match &self {
            OAuthError::BadUrl(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        (status, super::web_result::error_chain_html(&self))
    }
}

/// What a provider told us about the person behind an access token.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub provider_id: String,
    pub login: String,
    pub name: String,
    pub avatar_url: String,
}

struct PendingLogin {
    provider: Provider,
    verifier: String,
    expires: Instant,
}

/// State param -> PKCE verifier, for logins in progress. Entries are single
/// use and short-lived.
#[derive(Default)]
pub struct LoginStates {
    pending: Mutex<HashMap<String, PendingLogin>>,
}

impl LoginStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a login: returns (state, code_challenge). Purges anything stale
    /// while it has the lock anyway.
    pub fn begin(&self, provider: Provider) -> (String, String) {
        let state = new_opaque_id();
        let (verifier, challenge) = make_pkce();
        let now = Instant::now();
        let mut pending = self.pending.lock();
        pending.retain(|_, p| p.expires > now);
        pending.insert(
            state.clone(),
            PendingLogin {
                provider,
                verifier,
                expires: now + provider.login_ttl(),
            },
        );
        (state, challenge)
    }

    /// Redeem a state param for its verifier. The entry is gone afterwards
    /// whether or not it was still valid.
    pub fn take(&self, state: &str, provider: Provider) -> Option<String> {
        let p = self.pending.lock().remove(state)?;
        if p.provider != provider || p.expires <= Instant::now() {
            return None;
        }
        Some(p.verifier)
    }

    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.expires > now);
        before - pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// The provider's consent page URL for this login attempt.
pub fn authorize_url(
    provider: Provider,
    ep: &Endpoints,
    redirect_uri: &str,
    state: &str,
    challenge: &str,
) -> Result<Url, OAuthError> {
    let mut url = Url::parse(&ep.authorize)?;
    {
        let mut q = url.query_pairs_mut();
        if provider != Provider::GitHub {
            q.append_pair("response_type", "code");
        }
        q.append_pair("client_id", &ep.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", provider.scope())
            .append_pair("state", state)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256");
    }
    Ok(url)
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    // GitHub reports errors in a 200 response, so look for these either way.
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Trade an authorization code (plus PKCE verifier) for an access token.
#[tracing::instrument(skip_all, fields(provider = provider.slug()))]
pub async fn exchange_code(
    http: &reqwest::Client,
    provider: Provider,
    ep: &Endpoints,
    code: &str,
    redirect_uri: &str,
    verifier: &str,
) -> Result<String, OAuthError> {
    let name = provider.slug();
    let mut form: Vec<(&str, &str)> = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", &ep.client_id),
        ("code_verifier", verifier),
    ];
    let mut req = http
        .post(&ep.token)
        .header(reqwest::header::ACCEPT, "application/json")
        .timeout(PROVIDER_TIMEOUT);
    match (provider.auth_style(), ep.client_secret.as_deref()) {
        (AuthStyle::InParams, Some(secret)) => form.push(("client_secret", secret)),
        (AuthStyle::BasicAuth, Some(secret)) => {
            req = req.basic_auth(&ep.client_id, Some(secret));
        }
        _ => {}
    }

    let resp = req
        .form(&form)
        .send()
        .await
        .map_err(|source| OAuthError::Http {
            provider: name,
            source,
        })?;
    let status = resp.status();
    let body = resp.text().await.map_err(|source| OAuthError::Http {
        provider: name,
        source,
    })?;
    let parsed: Option<TokenResponse> = serde_json::from_str(&body).ok();
    match parsed {
        Some(t) if status.is_success() && t.error.is_none() && !t.access_token.is_empty() => {
            Ok(t.access_token)
        }
        Some(t) if t.error.is_some() => Err(OAuthError::TokenExchange {
            provider: name,
            detail: format!(
                "{} {}",
                t.error.unwrap_or_default(),
                t.error_description.unwrap_or_default()
            )
            .trim()
            .to_string(),
        }),
        _ => Err(OAuthError::TokenExchange {
            provider: name,
            detail: format!("status {}", status),
        }),
    }
}

// Per-provider user payloads.

#[derive(Deserialize)]
struct GitHubUser {
    id: i64,
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar_url: String,
}

#[derive(Deserialize)]
struct XUserEnvelope {
    data: XUser,
}

#[derive(Deserialize)]
struct XUser {
    id: String,
    username: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    profile_image_url: String,
}

#[derive(Deserialize)]
struct XLegacyUser {
    id_str: String,
    screen_name: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    profile_image_url_https: String,
}

#[derive(Deserialize)]
struct FakeUser {
    id: serde_json::Value,
    username: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    avatar_url: String,
}

fn parse_identity(provider: Provider, legacy: bool, body: &str) -> Result<Identity, serde_json::Error> {
    let ident = match (provider, legacy) {
        (Provider::GitHub, _) => {
            let u: GitHubUser = serde_json::from_str(body)?;
            Identity {
                provider_id: u.id.to_string(),
                name: u.name.filter(|n| !n.is_empty()).unwrap_or_else(|| u.login.clone()),
                login: u.login,
                avatar_url: u.avatar_url,
            }
        }
        (Provider::X, false) => {
            let u: XUserEnvelope = serde_json::from_str(body)?;
            Identity {
                provider_id: u.data.id,
                login: u.data.username,
                name: u.data.name,
                avatar_url: u.data.profile_image_url,
            }
        }
        (Provider::X, true) => {
            let u: XLegacyUser = serde_json::from_str(body)?;
            Identity {
                provider_id: u.id_str,
                login: u.screen_name,
                name: u.name,
                avatar_url: u.profile_image_url_https,
            }
        }
        (Provider::Fake, _) => {
            let u: FakeUser = serde_json::from_str(body)?;
            let provider_id = match u.id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            Identity {
                provider_id,
                login: u.username,
                name: u.name,
                avatar_url: u.avatar_url,
            }
        }
    };
    Ok(ident)
}

async fn get_user(
    http: &reqwest::Client,
    provider: Provider,
    url: &str,
    token: &str,
) -> Result<(reqwest::StatusCode, String), OAuthError> {
    let name = provider.slug();
    let resp = http
        .get(url)
        .bearer_auth(token)
        .header(reqwest::header::ACCEPT, "application/json")
        // GitHub's API rejects requests without one.
        .header(reqwest::header::USER_AGENT, "edev")
        .timeout(PROVIDER_TIMEOUT)
        .send()
        .await
        .map_err(|source| OAuthError::Http {
            provider: name,
            source,
        })?;
    let status = resp.status();
    let body = resp.text().await.map_err(|source| OAuthError::Http {
        provider: name,
        source,
    })?;
    Ok((status, body))
}

/// Ask the provider who owns this access token.
#[tracing::instrument(skip_all, fields(provider = provider.slug()))]
pub async fn fetch_identity(
    http: &reqwest::Client,
    provider: Provider,
    ep: &Endpoints,
    token: &str,
) -> Result<Identity, OAuthError> {
    let name = provider.slug();
    let (mut status, mut body) = get_user(http, provider, &ep.userinfo, token).await?;
    let mut legacy = false;
    if status == reqwest::StatusCode::FORBIDDEN {
        if let Some(fallback) = &ep.userinfo_fallback {
            // X gates /2/users/me behind paid tiers on some apps.
            warn!("user lookup got 403, trying the fallback endpoint");
            (status, body) = get_user(http, provider, fallback, token).await?;
            legacy = true;
        }
    }
    if !status.is_success() {
        return Err(OAuthError::UserInfo {
            provider: name,
            detail: format!("status {}", status),
        });
    }
    let ident = parse_identity(provider, legacy, &body).map_err(|e| OAuthError::UserInfo {
        provider: name,
        detail: e.to_string(),
    })?;
    if ident.provider_id.is_empty() || ident.login.is_empty() {
        return Err(OAuthError::UserInfo {
            provider: name,
            detail: "response was missing an id or login".to_string(),
        });
    }
    Ok(ident)
}

/// GET /login/:provider
pub async fn login(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> WebResult<Redirect> {
    let provider = Provider::from_slug(&slug).ok_or_else(WebError::not_found)?;
    let ep = provider.endpoints(&state.config)?;
    let redirect_uri = state.config.own_url(&provider.callback_path(&state.config));
    let (login_state, challenge) = state.login_states.begin(provider);
    let url = authorize_url(provider, &ep, &redirect_uri, &login_state, &challenge)?;
    Ok(Redirect::to(url.as_str()))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

pub async fn github_callback(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(params): Query<CallbackParams>,
) -> WebResult<Redirect> {
    finish_login(&state, &cookies, Provider::GitHub, params).await
}

pub async fn x_callback(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(params): Query<CallbackParams>,
) -> WebResult<Redirect> {
    finish_login(&state, &cookies, Provider::X, params).await
}

pub async fn fake_callback(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(params): Query<CallbackParams>,
) -> WebResult<Redirect> {
    finish_login(&state, &cookies, Provider::Fake, params).await
}

async fn finish_login(
    state: &AppState,
    cookies: &Cookies,
    provider: Provider,
    params: CallbackParams,
) -> WebResult<Redirect> {
    if let Some(error) = params.error {
        let reason = match params.error_description {
            Some(desc) => format!("{} ({})", error, desc),
            None => error,
        };
        return Err(UserError::LoginDenied { reason }.into());
    }
    let verifier = params
        .state
        .as_deref()
        .and_then(|s| state.login_states.take(s, provider))
        .ok_or(UserError::LoginStateInvalid)?;
    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or(UserError::MissingCode)?;

    let ep = provider.endpoints(&state.config)?;
    let redirect_uri = state.config.own_url(&provider.callback_path(&state.config));
    let token = exchange_code(&state.http, provider, &ep, &code, &redirect_uri, &verifier).await?;
    let ident = fetch_identity(&state.http, provider, &ep, &token).await?;

    let user = state
        .db
        .users()
        .upsert(&ProviderIdentity {
            provider: provider.slug(),
            provider_id: &ident.provider_id,
            login: &ident.login,
            name: &ident.name,
            avatar_url: &ident.avatar_url,
        })
        .await?;
    info!(user_id = user.id, provider = provider.slug(), login = %user.login, "logged in");

    let sid = state.sessions.create(SessionUser::from(&user));
    cookies.add(session_cookie(sid, state.config.insecure_cookies()));
    Ok(Redirect::to(&state.config.own_url("/")))
}
