use anyhow::Context;
use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::net::TcpListener;
use udf_auth::{
    AuthConfig, CredentialStore, Credentials, ExecutionEnvironment, NoBrowser, UserAgent,
};
use udf_core::{Error, Token, TokenProvider};

#[derive(Clone, Default)]
struct TokenServer {
    posts: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

async fn token_endpoint(State(state): State<TokenServer>, Json(body): Json<Value>) -> Json<Value> {
    let n = state.posts.fetch_add(1, Ordering::SeqCst) + 1;
    state.bodies.lock().unwrap().push(body.clone());
    // Widen the window in which a second refresh could sneak in.
    tokio::time::sleep(Duration::from_millis(50)).await;

    match body["grant_type"].as_str() {
        Some("refresh_token") => Json(json!({
            "access_token": format!("access-{n}"),
            "id_token": "",
            "scope": "openid",
            "expires_in": 3600,
        })),
        _ => Json(json!({
            "access_token": format!("access-{n}"),
            "refresh_token": "refresh-from-code",
            "id_token": "",
            "scope": "openid email",
            "expires_in": 3600,
        })),
    }
}

async fn start_token_server() -> anyhow::Result<(String, TokenServer)> {
    let state = TokenServer::default();
    let app = Router::new()
        .route("/oauth/token", post(token_endpoint))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>()?)
        .await
        .context("bind token server")?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app.into_make_service()).await });
    Ok((format!("http://{addr}/oauth/token"), state))
}

fn config(dir: &tempfile::TempDir, token_url: String) -> AuthConfig {
    AuthConfig {
        token_url,
        credentials_path: dir.path().join("credentials"),
        prompt_to_login: false,
        login_timeout: Duration::from_secs(5),
        ..AuthConfig::default()
    }
}

fn expired_credentials() -> Credentials {
    Credentials {
        access_token: "stale".to_string(),
        auth_scheme: "Bearer".to_string(),
        refresh_token: "refresh-0".to_string(),
        id_token: String::new(),
        scope: "openid".to_string(),
        expires_in: 3600,
        expires_at: Utc::now() - ChronoDuration::seconds(10),
    }
}

fn store(cfg: AuthConfig, env: ExecutionEnvironment) -> Arc<CredentialStore> {
    Arc::new(CredentialStore::with_parts(cfg, env, Arc::new(NoBrowser)))
}

#[tokio::test]
async fn concurrent_refresh_hits_token_endpoint_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (token_url, server) = start_token_server().await?;
    let store = store(config(&dir, token_url), ExecutionEnvironment::default());
    store.set_credentials(expired_credentials()).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.refresh_if_needed().await }));
    }
    let mut expiries = Vec::new();
    for handle in handles {
        expiries.push(handle.await??.expires_at);
    }

    let posts = server.posts.load(Ordering::SeqCst);
    anyhow::ensure!(posts == 1, "expected exactly one refresh, saw {posts}");
    anyhow::ensure!(
        expiries.windows(2).all(|w| w[0] == w[1]),
        "callers observed different expiries: {expiries:?}"
    );

    let body = server.bodies.lock().unwrap()[0].clone();
    anyhow::ensure!(body["grant_type"] == "refresh_token");
    anyhow::ensure!(body["refresh_token"] == "refresh-0");

    let on_disk = Credentials::load(&dir.path().join("credentials"))?.context("persisted")?;
    anyhow::ensure!(on_disk.access_token == "access-1");
    anyhow::ensure!(on_disk.refresh_token == "refresh-0", "refresh token must be kept");
    Ok(())
}

#[tokio::test]
async fn expired_disk_credentials_refresh_on_first_use() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (token_url, server) = start_token_server().await?;
    let cfg = config(&dir, token_url);
    expired_credentials().save(&cfg.credentials_path)?;
    let store = store(cfg, ExecutionEnvironment::default());

    let (a, b) = tokio::join!(store.current_token(), store.current_token());
    anyhow::ensure!(a? == Token::new("Bearer", "access-1"));
    anyhow::ensure!(b? == Token::new("Bearer", "access-1"));
    anyhow::ensure!(server.posts.load(Ordering::SeqCst) == 1);
    Ok(())
}

#[tokio::test]
async fn injected_token_wins_and_is_never_persisted() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (token_url, server) = start_token_server().await?;
    let cfg = config(&dir, token_url);
    let path = cfg.credentials_path.clone();
    let env = ExecutionEnvironment {
        env_scheme: Some("Udf-Env-Bearer".to_string()),
        env_token: Some("from-env".to_string()),
        ..Default::default()
    };
    let store = store(cfg, env);

    let token = store.current_token().await?;
    anyhow::ensure!(token == Token::new("Udf-Env-Bearer", "from-env"));
    anyhow::ensure!(store.is_configured().await);
    anyhow::ensure!(!path.exists(), "injected token must not be written to disk");
    anyhow::ensure!(server.posts.load(Ordering::SeqCst) == 0);
    Ok(())
}

#[tokio::test]
async fn missing_credentials_fail_fast_without_prompt() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store(
        config(&dir, "http://127.0.0.1:9/oauth/token".to_string()),
        ExecutionEnvironment::default(),
    );
    anyhow::ensure!(!store.is_configured().await);
    let err = store.current_token().await.unwrap_err();
    anyhow::ensure!(matches!(err, Error::Config(_)), "unexpected error {err}");
    Ok(())
}

#[tokio::test]
async fn login_without_browser_is_bad_credentials() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let free = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = free.local_addr()?.port();
    drop(free);

    let cfg = AuthConfig {
        prompt_to_login: true,
        local_redirect_url: format!("http://127.0.0.1:{port}"),
        ..config(&dir, "http://127.0.0.1:9/oauth/token".to_string())
    };
    let store = store(cfg, ExecutionEnvironment::default());
    let err = store.current_token().await.unwrap_err();
    anyhow::ensure!(err.http_status() == Some(401), "unexpected error {err}");
    Ok(())
}

struct RedirectingBrowser {
    redirect: String,
}

#[async_trait]
impl UserAgent for RedirectingBrowser {
    async fn open(&self, url: &str) -> udf_core::Result<()> {
        let parsed = reqwest::Url::parse(url).map_err(|e| Error::config(e.to_string()))?;
        let has_challenge = parsed
            .query_pairs()
            .any(|(k, v)| k == "code_challenge" && !v.is_empty());
        if !has_challenge {
            return Err(Error::config("authorize url is missing a code challenge"));
        }
        let redirect = format!("{}/?code=code-from-browser", self.redirect);
        tokio::spawn(async move {
            let _ = reqwest::get(redirect).await;
        });
        Ok(())
    }
}

#[tokio::test]
async fn interactive_login_exchanges_code_and_persists() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (token_url, server) = start_token_server().await?;
    let free = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = free.local_addr()?.port();
    drop(free);

    let redirect = format!("http://127.0.0.1:{port}");
    let cfg = AuthConfig {
        prompt_to_login: true,
        local_redirect_url: redirect.clone(),
        ..config(&dir, token_url)
    };
    let path = cfg.credentials_path.clone();
    let store = CredentialStore::with_parts(
        cfg,
        ExecutionEnvironment::default(),
        Arc::new(RedirectingBrowser { redirect }),
    );

    let token = store.current_token().await?;
    anyhow::ensure!(token == Token::new("Bearer", "access-1"));

    let body = server.bodies.lock().unwrap()[0].clone();
    anyhow::ensure!(body["grant_type"] == "authorization_code");
    anyhow::ensure!(body["code"] == "code-from-browser");
    anyhow::ensure!(body["code_verifier"].as_str().is_some_and(|v| v.len() == 64));

    let saved = Credentials::load(&path)?.context("credentials persisted")?;
    anyhow::ensure!(saved.refresh_token == "refresh-from-code");
    Ok(())
}

#[tokio::test]
async fn two_step_login_and_logout() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (token_url, server) = start_token_server().await?;
    let cfg = config(&dir, token_url);
    let path = cfg.credentials_path.clone();
    let hosted = cfg.hosted_redirect_url.clone();
    let store = store(cfg, ExecutionEnvironment::default());

    let pending = store.begin_login()?;
    anyhow::ensure!(pending.redirect_uri == hosted);
    anyhow::ensure!(pending.url.contains("code_challenge_method=S256"));

    store.finalize_login(&pending, " pasted-code \n").await?;
    let body = server.bodies.lock().unwrap()[0].clone();
    anyhow::ensure!(body["code"] == "pasted-code");
    anyhow::ensure!(body["redirect_uri"] == hosted.as_str());
    anyhow::ensure!(path.exists());
    anyhow::ensure!(store.is_configured().await);

    let epoch = store.session_epoch();
    let logout_url = store.logout().await?;
    anyhow::ensure!(logout_url.ends_with("/oidc/logout"));
    anyhow::ensure!(!path.exists());
    anyhow::ensure!(store.session_epoch() == epoch + 1);
    anyhow::ensure!(!store.is_configured().await);

    // Logging out twice is fine.
    store.logout().await?;
    Ok(())
}

#[tokio::test]
async fn no_login_reports_unconfigured_even_with_disk_credentials() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = config(&dir, "http://127.0.0.1:9/oauth/token".to_string());
    expired_credentials().save(&cfg.credentials_path)?;
    cfg.no_login = true;
    let store = store(cfg, ExecutionEnvironment::default());
    anyhow::ensure!(!store.is_configured().await);
    Ok(())
}

#[tokio::test]
async fn persistence_can_be_disabled() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (token_url, _server) = start_token_server().await?;
    let mut cfg = config(&dir, token_url);
    cfg.save_user_settings = false;
    let path = cfg.credentials_path.clone();
    let store = store(cfg, ExecutionEnvironment::default());

    let pending = store.begin_login()?;
    store.finalize_login(&pending, "code").await?;
    anyhow::ensure!(!path.exists(), "credentials must not be saved");
    anyhow::ensure!(store.current_token().await? == Token::new("Bearer", "access-1"));
    Ok(())
}
