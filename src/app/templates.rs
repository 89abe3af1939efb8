use super::sessions::SessionUser;
use crate::version;
use serde::Serialize;

// Rather than a struct for every page, each context gets a couple of typed
// chunks like this one, assembled with context!{}.

/// Template data that pretty much every page needs. The main layout is free
/// to use anything in here.
#[derive(Serialize)]
pub struct Common<'a> {
    pub title: &'a str,
    pub user: Option<&'a SessionUser>,
    pub version: &'static str,
}

impl<'a> Common<'a> {
    pub fn new(title: &'a str, user: Option<&'a SessionUser>) -> Self {
        Self {
            title,
            user,
            version: version::short_sha(),
        }
    }

    pub fn anonymous(title: &'a str) -> Self {
        Self::new(title, None)
    }
}

/// Home page bits.
#[derive(Serialize)]
pub struct HomePage<'a> {
    pub member_count: i64,
    /// Provider slugs that have a working login link.
    pub providers: &'a [&'static str],
}

// All templates get compiled in to the app.
pub fn load_templates() -> anyhow::Result<minijinja::Environment<'static>> {
    let mut env = minijinja::Environment::new();
    env.add_template(
        "_layout.html.j2",
        include_str!("../../templates/_layout.html.j2"),
    )?;
    env.add_template(
        "index.html.j2",
        include_str!("../../templates/index.html.j2"),
    )?;
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn index_renders_logged_out_and_in() {
        let env = load_templates().unwrap();
        let tmpl = env.get_template("index.html.j2").unwrap();
        let home_page = HomePage {
            member_count: 3,
            providers: &["github", "fake"],
        };

        let common = Common::anonymous("Home");
        let html = tmpl.render(context! {common, home_page}).unwrap();
        assert!(html.contains(r#"href="/login/github""#));
        assert!(html.contains(r#"href="/login/fake""#));
        assert!(!html.contains(r#"href="/login/x""#));

        let user = SessionUser {
            id: 1,
            provider: "fake".to_string(),
            login: "tester".to_string(),
            name: "<b>Test</b>".to_string(),
            avatar_url: String::new(),
        };
        let common = Common::new("Home", Some(&user));
        let html = tmpl.render(context! {common, home_page}).unwrap();
        assert!(html.contains("@tester"));
        // minijinja escapes '/' too, so just check no raw markup got through.
        assert!(html.contains("&lt;b&gt;Test&lt;"));
        assert!(!html.contains("<b>Test"));
        assert!(html.contains(r#"action="/logout""#));
    }
}
