use super::authentication::AuthSession;
use super::sessions::{removal_cookie, SessionUser};
use super::state::AppState;
use super::templates::*;
use super::web_result::{WebError, WebResult};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect},
    Json,
};
use minijinja::context;
use tower_cookies::Cookies;
use tracing::warn;

/// The home page. Login links if you're logged out, a greeting if you're in.
pub async fn root(
    State(state): State<AppState>,
    maybe_auth: Option<AuthSession>,
) -> WebResult<impl IntoResponse> {
    let member_count = state.db.users().count().await?;
    let providers = enabled_providers(&state);
    let home_page = HomePage {
        member_count,
        providers: &providers,
    };
    let common = match &maybe_auth {
        Some(auth) => auth.common_args("Home"),
        None => Common::anonymous("Home"),
    };
    let page = state.render_view("index.html.j2", context! {common, home_page})?;
    Ok(([(header::CACHE_CONTROL, "no-store")], Html(page)))
}

fn enabled_providers(state: &AppState) -> Vec<&'static str> {
    let mut providers = Vec::new();
    if state.config.github.is_configured() {
        providers.push("github");
    }
    if state.config.x.is_configured() {
        providers.push("x");
    }
    if state.config.fake_oauth.is_some() {
        providers.push("fake");
    }
    providers
}

/// Liveness plus a trip through the reader pool.
pub async fn healthz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.db.query_row("SELECT 1;", crate::params![]).scan_one::<i64>().await {
        Ok(_) => (StatusCode::OK, "ok\n"),
        Err(e) => {
            warn!("health check couldn't reach storage: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable\n")
        }
    }
}

/// The current user, as JSON.
pub async fn me(auth: AuthSession) -> Json<SessionUser> {
    Json(SessionUser::clone(&auth.user))
}

/// End the session (if any) and head home.
pub async fn logout(
    State(state): State<AppState>,
    cookies: Cookies,
    maybe_auth: Option<AuthSession>,
) -> Redirect {
    if let Some(auth) = maybe_auth {
        state.sessions.remove(&auth.session_id);
    }
    cookies.remove(removal_cookie(state.config.insecure_cookies()));
    Redirect::to(&state.config.own_url("/"))
}

/// Browsers ask for /favicon.ico no matter what the page says.
pub async fn favicon() -> impl IntoResponse {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/assets/favicon.ico")],
    )
}

pub async fn four_oh_four() -> WebError {
    WebError::not_found()
}
