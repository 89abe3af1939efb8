use super::sessions::{cookie_name, removal_cookie, SessionUser};
use super::state::AppState;
use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tower_cookies::Cookies;

/// The logged-in user for a request. The session middleware stores one of
/// these in the request extensions, and routes can take it as an extractor
/// (or `Option<AuthSession>` for pages that work either way).
#[derive(Clone, Debug)]
pub struct AuthSession {
    pub user: Arc<SessionUser>,
    pub session_id: Arc<str>,
}

impl AuthSession {
    /// A little helper to build common template args.
    pub fn common_args<'a>(&'a self, title: &'a str) -> super::templates::Common<'a> {
        super::templates::Common::new(title, Some(&*self.user))
    }
}

// This relies on the session middleware being present in the stack. If it's
// not around, it always whiffs.
#[async_trait]
impl<S> FromRequestParts<S> for AuthSession
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<AuthSession>() {
            Some(auth) => Ok(auth.clone()),
            None => Err((StatusCode::UNAUTHORIZED, "unauthorized")),
        }
    }
}

/// Function middleware to look up the login session named in the session
/// cookie and make its user available to routes. A cookie pointing at a dead
/// session gets cleared on the way out.
pub async fn session_middleware(
    State(state): State<AppState>,
    cookies: Cookies,
    mut request: Request,
    next: Next,
) -> Response {
    let insecure = state.config.insecure_cookies();
    if let Some(sid) = cookies.get(cookie_name(insecure)) {
        match state.sessions.get(sid.value()) {
            Some(user) => {
                request.extensions_mut().insert(AuthSession {
                    user,
                    session_id: Arc::from(sid.value()),
                });
            }
            None => {
                // tower_cookies will ship this on the outbound leg.
                cookies.remove(removal_cookie(insecure));
            }
        }
    }
    next.run(request).await
}
