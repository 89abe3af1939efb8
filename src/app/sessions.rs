//! In-memory login sessions. Nothing here survives a restart, which is fine:
//! logging back in is one click.

use super::state::AppState;
use crate::db::User;
use crate::util::{new_opaque_id, COOKIE_SESSION, COOKIE_SESSION_INSECURE};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower_cookies::{cookie::SameSite, Cookie};
use tracing::{debug, info};

/// How long a session stays valid in the store.
pub const SESSION_MAX_AGE: Duration = Duration::from_secs(3 * 60 * 60);
/// Max-Age on the cookie itself. Longer than the store keeps sessions, so
/// in practice the store decides.
const SESSION_COOKIE_MAX_AGE: time::Duration = time::Duration::hours(8);
/// How often the janitor sweeps expired sessions and login states.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Who's logged in, as far as a request is concerned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: i64,
    pub provider: String,
    pub login: String,
    pub name: String,
    pub avatar_url: String,
}

impl From<&User> for SessionUser {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            provider: u.provider.clone(),
            login: u.login.clone(),
            name: u.name.clone(),
            avatar_url: u.avatar_url.clone(),
        }
    }
}

struct SessionEntry {
    user: Arc<SessionUser>,
    expires: Instant,
}

/// Session ID -> user, with a fixed max age from creation.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    max_age: Duration,
}

impl SessionStore {
    pub fn new(max_age: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_age,
        }
    }

    /// Start a session for the user and return its opaque ID.
    pub fn create(&self, user: SessionUser) -> String {
        let id = new_opaque_id();
        let entry = SessionEntry {
            user: Arc::new(user),
            expires: Instant::now() + self.max_age,
        };
        self.sessions.write().insert(id.clone(), entry);
        id
    }

    /// Look up a live session. Expired ones read as absent even before the
    /// janitor gets to them.
    pub fn get(&self, id: &str) -> Option<Arc<SessionUser>> {
        let sessions = self.sessions.read();
        let entry = sessions.get(id)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        Some(entry.user.clone())
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    /// Drop expired sessions; returns how many went.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    fn cleanup_at(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }
}

pub fn cookie_name(insecure: bool) -> &'static str {
    if insecure {
        COOKIE_SESSION_INSECURE
    } else {
        COOKIE_SESSION
    }
}

/// The session cookie. `insecure` is for plain-http dev setups.
pub fn session_cookie(id: String, insecure: bool) -> Cookie<'static> {
    Cookie::build((cookie_name(insecure), id))
        .path("/")
        .http_only(true)
        .secure(!insecure)
        .same_site(SameSite::Lax)
        .max_age(SESSION_COOKIE_MAX_AGE)
        .build()
}

/// A cookie with matching attributes, for handing to `Cookies::remove`.
pub fn removal_cookie(insecure: bool) -> Cookie<'static> {
    Cookie::build((cookie_name(insecure), ""))
        .path("/")
        .http_only(true)
        .secure(!insecure)
        .same_site(SameSite::Lax)
        .build()
}

/// Background sweep for sessions and pending logins. Runs until the app's
/// cancel token fires.
pub async fn janitor(state: AppState, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // the first tick is immediate; nothing to sweep yet.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = state.cancel_token.cancelled() => {
                info!("session janitor stopping");
                return;
            }
            _ = ticker.tick() => {
                let sessions = state.sessions.cleanup();
                let logins = state.login_states.purge();
                debug!(sessions, logins, "swept expired entries");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tester() -> SessionUser {
        SessionUser {
            id: 1,
            provider: "fake".to_string(),
            login: "tester".to_string(),
            name: "Test User".to_string(),
            avatar_url: String::new(),
        }
    }

    #[test]
    fn create_get_remove() {
        let store = SessionStore::new(SESSION_MAX_AGE);
        let id = store.create(tester());
        assert_eq!(store.get(&id).unwrap().login, "tester");
        assert!(store.get("nonsense").is_none());
        assert!(store.remove(&id));
        assert!(!store.remove(&id));
        assert!(store.get(&id).is_none());
    }

    #[tokio::test]
    async fn expired_sessions_vanish() {
        let store = SessionStore::new(Duration::from_millis(1));
        let id = store.create(tester());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.get(&id).is_none());
        // still taking up room until a sweep
        assert_eq!(store.len(), 1);
        assert_eq!(store.cleanup(), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn cleanup_keeps_live_sessions() {
        let store = SessionStore::new(SESSION_MAX_AGE);
        let a = store.create(tester());
        let _b = store.create(tester());
        assert_eq!(store.cleanup(), 0);
        // pretend it's four hours from now
        let later = Instant::now() + Duration::from_secs(4 * 60 * 60);
        assert_eq!(store.cleanup_at(later), 2);
        assert!(store.get(&a).is_none());
    }

    #[test]
    fn cookie_flavors() {
        let secure = session_cookie("abc".to_string(), false);
        assert_eq!(secure.name(), "__Host-sid");
        assert_eq!(secure.secure(), Some(true));
        assert_eq!(secure.http_only(), Some(true));
        assert_eq!(secure.path(), Some("/"));
        assert_eq!(secure.same_site(), Some(SameSite::Lax));
        assert_eq!(secure.max_age(), Some(time::Duration::hours(8)));

        let dev = session_cookie("abc".to_string(), true);
        assert_eq!(dev.name(), "sid");
        assert_eq!(dev.secure(), Some(false));
    }
}
