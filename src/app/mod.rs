mod app_tests;
mod authentication;
pub mod oauth;
mod routes;
pub mod sessions;
pub mod state;
mod templates;
mod web_result;

use authentication::session_middleware;
use routes::*;
use state::AppState;
pub use templates::load_templates;

use axum::{
    handler::HandlerWithoutStateExt,
    http::{header, HeaderName, HeaderValue},
    middleware::from_fn_with_state,
    routing::get,
    Router,
};
use tower::ServiceBuilder;
use tower_cookies::CookieManagerLayer;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; img-src 'self' data: https: *.githubusercontent.com github.com *.twimg.com pbs.twimg.com; style-src 'self' 'unsafe-inline'; frame-ancestors 'none'";

fn security_headers() -> [(HeaderName, HeaderValue); 4] {
    [
        (
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
        (header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY")),
        (
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ),
        (
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ),
    ]
}

/// Return the whole site as a router. The caller is in charge of building
/// the state, but we need it here too, for the session middleware.
pub fn edev_app(state: AppState) -> Router {
    let session_auth = from_fn_with_state(state.clone(), session_middleware);
    let fake_callback_path = oauth::Provider::Fake.callback_path(&state.config);

    let [nosniff, frame, referrer, csp] = security_headers();
    let headers = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(nosniff.0, nosniff.1))
        .layer(SetResponseHeaderLayer::overriding(frame.0, frame.1))
        .layer(SetResponseHeaderLayer::overriding(referrer.0, referrer.1))
        .layer(SetResponseHeaderLayer::overriding(csp.0, csp.1));

    Router::new()
        .route("/", get(root))
        .route("/me", get(me))
        .route("/logout", get(logout).post(logout))
        .route("/login/:provider", get(oauth::login))
        .route("/github/oauth/callback", get(oauth::github_callback))
        .route("/x/oauth/callback", get(oauth::x_callback))
        .route(&fake_callback_path, get(oauth::fake_callback))
        .layer(session_auth)
        .layer(CookieManagerLayer::new())
        // static files, health, and 404 live outside the session layers
        .nest_service(
            "/assets",
            ServeDir::new(&state.config.assets_dir).not_found_service(four_oh_four.into_service()),
        )
        .route("/favicon.ico", get(favicon))
        .route("/healthz", get(healthz))
        .fallback(four_oh_four)
        .layer(headers)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
