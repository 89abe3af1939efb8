use crate::db::{is_in_memory, DbOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfError {
    #[error("database_url is required (set it in the config file or DATABASE_URL)")]
    MissingDatabase,
    #[error("{provider} client_id and client_secret are required unless fake oauth is enabled")]
    MissingCredentials { provider: &'static str },
    #[error("{var} should be true or false, got {value:?}")]
    BadBool { var: &'static str, value: String },
    #[error("fake oauth redirect_path should start with '/', got {0:?}")]
    BadRedirectPath(String),
    #[error("database_url {0:?} is in-memory; the server needs a database file")]
    InMemoryDatabase(String),
    #[error("[database] reader_connections must be at least 1")]
    NoReaders,
}

/// Stuff the app needs that's sourced from configuration.
#[derive(Clone, Debug)]
pub struct SiteConfig {
    /// Listen address. A bare ":port" means all interfaces.
    pub address: String,
    /// The site's own public-facing base URL. OAuth redirect URIs hang off this.
    pub base_url: Url,
    /// Path or sqlite:/file: URI for the database.
    pub database_url: String,
    /// The directory with static CSS/image assets.
    pub assets_dir: PathBuf,
    pub github: OAuthClient,
    pub x: OAuthClient,
    /// Present only when the local fake provider is turned on.
    pub fake_oauth: Option<FakeOAuth>,
    pub database: DbOptions,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

impl OAuthClient {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FakeOAuth {
    pub base_url: Url,
    pub client_id: String,
    /// Callback path on our side, e.g. /fake/oauth/callback.
    pub redirect_path: String,
}

/// The intermediate structs used for deserializing the config file (and then
/// layering env vars on top) before generating a usable SiteConfig.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct PreSiteConfig {
    address: String,
    base_url: String,
    database_url: String,
    // Relative to the config file's dir.
    assets_dir: String,
    github: OAuthClient,
    x: OAuthClient,
    fake_oauth: PreFakeOAuth,
    database: PreDbOptions,
}

impl Default for PreSiteConfig {
    fn default() -> Self {
        Self {
            address: ":3210".to_string(),
            base_url: "https://empreendedor.dev".to_string(),
            database_url: String::new(),
            assets_dir: "assets".to_string(),
            github: OAuthClient::default(),
            x: OAuthClient::default(),
            fake_oauth: PreFakeOAuth::default(),
            database: PreDbOptions::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PreFakeOAuth {
    enabled: bool,
    base_url: String,
    client_id: String,
    redirect_path: String,
}

impl Default for PreFakeOAuth {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://127.0.0.1:9100".to_string(),
            client_id: "fake-client-id".to_string(),
            redirect_path: "/fake/oauth/callback".to_string(),
        }
    }
}

/// All optional; anything left out keeps the gateway's default.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PreDbOptions {
    busy_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    checkpoint_timeout_ms: Option<u64>,
    reader_connections: Option<u32>,
}

impl PreDbOptions {
    fn finalize(self) -> Result<DbOptions, ConfError> {
        if self.reader_connections == Some(0) {
            return Err(ConfError::NoReaders);
        }
        let d = DbOptions::default();
        let ms = Duration::from_millis;
        Ok(DbOptions {
            busy_timeout: self.busy_timeout_ms.map_or(d.busy_timeout, ms),
            write_timeout: self.write_timeout_ms.map_or(d.write_timeout, ms),
            read_timeout: self.read_timeout_ms.map_or(d.read_timeout, ms),
            checkpoint_timeout: self.checkpoint_timeout_ms.map_or(d.checkpoint_timeout, ms),
            reader_connections: self.reader_connections.or(d.reader_connections),
            ..d
        })
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfError::BadBool {
            var,
            value: value.to_string(),
        }),
    }
}

impl PreSiteConfig {
    /// Layer environment overrides on top of whatever the file said. Takes a
    /// lookup fn instead of reading the process env directly, so tests can
    /// feed it a map.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfError> {
        let set = |target: &mut String, var: &str| {
            if let Some(v) = lookup(var) {
                *target = v;
            }
        };
        set(&mut self.address, "ADDRESS");
        set(&mut self.base_url, "BASE_URL");
        set(&mut self.database_url, "DATABASE_URL");
        set(&mut self.github.client_id, "GITHUB_CLIENT_ID");
        set(&mut self.github.client_secret, "GITHUB_CLIENT_SECRET");
        set(&mut self.x.client_id, "X_CLIENT_ID");
        set(&mut self.x.client_secret, "X_CLIENT_SECRET");
        set(&mut self.fake_oauth.base_url, "FAKE_OAUTH_BASE_URL");
        set(&mut self.fake_oauth.client_id, "FAKE_OAUTH_CLIENT_ID");
        set(&mut self.fake_oauth.redirect_path, "FAKE_OAUTH_REDIRECT_PATH");
        if let Some(v) = lookup("FAKE_OAUTH_ENABLED") {
            self.fake_oauth.enabled = parse_bool("FAKE_OAUTH_ENABLED", &v)?;
        }
        Ok(())
    }

    fn finalize(self, base_dir: &Path) -> anyhow::Result<SiteConfig> {
        let database_url = self.database_url.trim().to_string();
        if database_url.is_empty() {
            return Err(ConfError::MissingDatabase.into());
        }
        if is_in_memory(&database_url) {
            return Err(ConfError::InMemoryDatabase(database_url).into());
        }
        // URIs pass through; bare paths are relative to the config file.
        let database_url = if database_url.starts_with("sqlite:") || database_url.starts_with("file:") {
            database_url
        } else {
            base_dir.join(&database_url).to_string_lossy().into_owned()
        };

        let fake_oauth = if self.fake_oauth.enabled {
            let pre = self.fake_oauth;
            if !pre.redirect_path.starts_with('/') {
                return Err(ConfError::BadRedirectPath(pre.redirect_path).into());
            }
            Some(FakeOAuth {
                base_url: Url::parse(&pre.base_url)?,
                client_id: pre.client_id,
                redirect_path: pre.redirect_path,
            })
        } else {
            if !self.github.is_configured() {
                return Err(ConfError::MissingCredentials { provider: "github" }.into());
            }
            if !self.x.is_configured() {
                return Err(ConfError::MissingCredentials { provider: "x" }.into());
            }
            None
        };

        let base_url = Url::parse(self.base_url.trim_end_matches('/'))?;
        let assets_dir = base_dir.join(&self.assets_dir);

        Ok(SiteConfig {
            address: self.address,
            base_url,
            database_url,
            assets_dir,
            github: self.github,
            x: self.x,
            fake_oauth,
            database: self.database.finalize()?,
        })
    }
}

impl SiteConfig {
    /// Load app configuration from an optional config file plus the process
    /// environment. With no explicit path, edev.toml in the current dir is
    /// used if it exists; otherwise everything comes from defaults and env.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let explicit = path.is_some();
        let abs_path = cwd.join(path.unwrap_or_else(|| Path::new("edev.toml")));
        let base_dir = abs_path.parent().unwrap_or(&cwd).to_path_buf();

        let mut pre = if explicit || abs_path.exists() {
            // This runs before we have a tracing subscriber, so we have to log rudely.
            println!("Startup: loading config file from {:?}", &abs_path);
            let conf_text = std::fs::read_to_string(&abs_path)?;
            toml::from_str::<PreSiteConfig>(&conf_text)?
        } else {
            println!("Startup: no config file, using defaults and environment");
            PreSiteConfig::default()
        };
        pre.apply_env(|var| std::env::var(var).ok())?;
        pre.finalize(&base_dir)
    }

    /// The listen address in a form TcpListener accepts.
    pub fn listen_addr(&self) -> String {
        if self.address.starts_with(':') {
            format!("0.0.0.0{}", self.address)
        } else {
            self.address.clone()
        }
    }

    /// Whether the insecure plain-http session cookie is in play.
    pub fn insecure_cookies(&self) -> bool {
        self.fake_oauth.is_some()
    }

    /// Absolute URL for one of our own paths, e.g. an oauth callback.
    pub fn own_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    /// Config for tests: fake oauth on, pointed at nothing in particular.
    #[cfg(test)]
    pub fn test_config() -> anyhow::Result<Self> {
        let mut pre = PreSiteConfig {
            base_url: "http://localhost:3210".to_string(),
            database_url: "ignore_me.db".to_string(),
            ..PreSiteConfig::default()
        };
        pre.fake_oauth.enabled = true;
        let cwd = std::env::current_dir()?;
        pre.finalize(&cwd)
    }
}
