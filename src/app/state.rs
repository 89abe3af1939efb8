use super::oauth::{LoginStates, PROVIDER_TIMEOUT};
use super::sessions::{SessionStore, SESSION_MAX_AGE};
use crate::config::SiteConfig;
use crate::db::Gateway;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub type AppState = Arc<AppInner>;

/// Everything a route might need, shared by every request.
pub struct AppInner {
    pub db: Gateway,
    pub config: SiteConfig,
    pub templates: minijinja::Environment<'static>,
    pub sessions: SessionStore,
    pub login_states: LoginStates,
    /// Outbound client for provider calls.
    pub http: reqwest::Client,
    /// Background tasks get spawned on this, so shutdown can wait for them.
    pub task_tracker: TaskTracker,
    /// Cancelled on shutdown.
    pub cancel_token: CancellationToken,
}

impl AppInner {
    pub fn new(
        db: Gateway,
        config: SiteConfig,
        templates: minijinja::Environment<'static>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()?;
        Ok(Self {
            db,
            config,
            templates,
            sessions: SessionStore::new(SESSION_MAX_AGE),
            login_states: LoginStates::new(),
            http,
            task_tracker: TaskTracker::new(),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Shortcut for rendering a named template with a context.
    pub fn render_view<S: Serialize>(&self, name: &str, ctx: S) -> Result<String, minijinja::Error> {
        self.templates.get_template(name)?.render(ctx)
    }
}
