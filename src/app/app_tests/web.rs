use super::*;

/// /assets, /healthz, /favicon.ico, 404s, and the headers everything gets.
#[tokio::test]
async fn app_basics_noauth_test() {
    let (_dir, state) = test_state().await;
    let mut app = edev_app(state.clone());

    // Static file serving is hooked up right
    {
        let req = new_req("GET", "/assets/style.css").empty();
        let resp = do_req(&mut app, req).await;
        assert_security_headers(&resp);
        assert_page_and_contains_all(resp, &["--color-background"]).await;
    }

    // Health check goes all the way to storage
    {
        let req = new_req("GET", "/healthz").empty();
        let resp = do_req(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_security_headers(&resp);
        let body = body_bytes(resp).await;
        assert_eq!(bytes_str(&body), "ok\n");
    }

    // Favicon redirect
    {
        let req = new_req("GET", "/favicon.ico").empty();
        let resp = do_req(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(location(&resp), "/assets/favicon.ico");
    }

    // 404s, both routed and static
    for uri in ["/nope", "/assets/nope.css"] {
        let req = new_req("GET", uri).empty();
        let resp = do_req(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_security_headers(&resp);
        let body = body_bytes(resp).await;
        assert!(bytes_str(&body).contains("Nothing here."));
    }
}

#[tokio::test]
async fn healthz_reports_storage_trouble() {
    let (_dir, state) = test_state().await;
    let mut app = edev_app(state.clone());
    state.db.clone().close().await;

    let req = new_req("GET", "/healthz").empty();
    let resp = do_req(&mut app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn index_logged_out_and_in() {
    let (_dir, state) = test_state().await;
    let mut app = edev_app(state.clone());

    // Logged out: login links for enabled providers only, never cached.
    {
        let req = new_req("GET", "/").empty();
        let resp = do_req(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
        let body = body_bytes(resp).await;
        let doc = bytes_doc(&body);
        assert!(!has_logged_in_nav(&doc));
        assert!(doc.has(r#"a[href="/login/fake"]"#));
        assert!(!doc.has(r#"a[href="/login/github"]"#));
        assert!(bytes_str(&body).contains("0 people have"));
    }

    // Logged in: nav and greeting.
    {
        let sid = test_session(&state, "tester");
        let req = new_req("GET", "/").session(&sid).empty();
        let resp = do_req(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_bytes(resp).await;
        let doc = bytes_doc(&body);
        assert!(has_logged_in_nav(&doc));
        assert!(bytes_str(&body).contains("@tester"));
    }
}

#[tokio::test]
async fn me_requires_a_session() {
    let (_dir, state) = test_state().await;
    let mut app = edev_app(state.clone());

    {
        let req = new_req("GET", "/me").empty();
        let resp = do_req(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
    {
        let sid = test_session(&state, "tester");
        let req = new_req("GET", "/me").session(&sid).empty();
        let resp = do_req(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_bytes(resp).await;
        let user: SessionUser = serde_json::from_slice(&body).unwrap();
        assert_eq!(user.login, "tester");
        assert_eq!(user.provider, "fake");
    }
    // A cookie for a session the store doesn't know gets cleared.
    {
        let req = new_req("GET", "/me").session("made-up").empty();
        let resp = do_req(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(set_cookie_value(resp.headers(), "sid").as_deref(), Some(""));
    }
}

#[tokio::test]
async fn logout_ends_the_session() {
    let (_dir, state) = test_state().await;
    let mut app = edev_app(state.clone());
    let sid = test_session(&state, "tester");

    let req = new_req("POST", "/logout").session(&sid).empty();
    let resp = do_req(&mut app, req).await;
    assert!(resp.status().is_redirection());
    assert_eq!(location(&resp), "http://localhost:3210/");
    assert_eq!(set_cookie_value(resp.headers(), "sid").as_deref(), Some(""));
    assert!(state.sessions.get(&sid).is_none());

    let req = new_req("GET", "/me").session(&sid).empty();
    let resp = do_req(&mut app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Logging out while logged out is harmless.
    let req = new_req("GET", "/logout").empty();
    let resp = do_req(&mut app, req).await;
    assert!(resp.status().is_redirection());
}
