use async_trait::async_trait;
use chrono::Utc;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use udf_core::{Error, Result, Token, TokenProvider};

use crate::{
    browser::{SystemBrowser, UserAgent},
    callback::{redirect_bind_addr, CallbackListener},
    config::AuthConfig,
    credentials::Credentials,
    environment::ExecutionEnvironment,
    oauth::OAuthClient,
    pkce,
};

/// First half of the two-step login: the URL to open and the verifier to finish with.
#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub url: String,
    pub redirect_uri: String,
    code_verifier: String,
}

/// Owns the credential lifecycle: login, persistence, refresh and logout.
///
/// Every refresh happens while holding the same lock that guards the in-memory credential, so
/// concurrent callers observing an expired token trigger exactly one network refresh.
pub struct CredentialStore {
    oauth: OAuthClient,
    env: ExecutionEnvironment,
    browser: Arc<dyn UserAgent>,
    current: Mutex<Option<Credentials>>,
    epoch: AtomicU64,
}

impl CredentialStore {
    pub fn new(cfg: AuthConfig) -> Self {
        Self::with_parts(cfg, ExecutionEnvironment::from_process_env(), Arc::new(SystemBrowser))
    }

    pub fn with_parts(
        cfg: AuthConfig,
        env: ExecutionEnvironment,
        browser: Arc<dyn UserAgent>,
    ) -> Self {
        Self {
            oauth: OAuthClient::new(cfg),
            env,
            browser,
            current: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        self.oauth.config()
    }

    pub async fn set_credentials(&self, creds: Credentials) {
        *self.current.lock().await = Some(creds);
    }

    /// Interactive PKCE login through the user's browser and a loopback listener.
    pub async fn authenticate(&self) -> Result<Credentials> {
        let mut guard = self.current.lock().await;
        let creds = self.authenticate_locked().await?;
        *guard = Some(creds.clone());
        Ok(creds)
    }

    async fn authenticate_locked(&self) -> Result<Credentials> {
        let cfg = self.config();
        let redirect_uri = cfg.local_redirect_url.clone();
        let verifier = pkce::generate_code_verifier();
        let url = pkce::authorize_url(cfg, &redirect_uri, &verifier)?;

        let listener = CallbackListener::bind(redirect_bind_addr(&redirect_uri)?).await?;
        tracing::info!(
            event = "udf.auth.login.started",
            url = %url,
            "Existing credentials not found: check your browser to log in"
        );
        self.browser.open(url.as_str()).await?;

        let code = listener.wait_for_code(cfg.login_timeout).await?;
        let creds = self
            .oauth
            .exchange_code(&code, &verifier, &redirect_uri)
            .await?;
        self.persist(&creds)?;
        tracing::info!(event = "udf.auth.login.completed");
        Ok(creds)
    }

    /// Start a login that finishes with a code pasted back by the user.
    pub fn begin_login(&self) -> Result<PendingLogin> {
        let cfg = self.config();
        let code_verifier = pkce::generate_code_verifier();
        let url = pkce::authorize_url(cfg, &cfg.hosted_redirect_url, &code_verifier)?;
        Ok(PendingLogin {
            url: url.to_string(),
            redirect_uri: cfg.hosted_redirect_url.clone(),
            code_verifier,
        })
    }

    pub async fn finalize_login(&self, pending: &PendingLogin, code: &str) -> Result<Credentials> {
        let creds = self
            .oauth
            .exchange_code(code.trim(), &pending.code_verifier, &pending.redirect_uri)
            .await?;
        self.persist(&creds)?;
        *self.current.lock().await = Some(creds.clone());
        tracing::info!(event = "udf.auth.login.completed", two_step = true);
        Ok(creds)
    }

    /// Refresh the in-memory credential if it has expired.
    pub async fn refresh_if_needed(&self) -> Result<Credentials> {
        let mut guard = self.current.lock().await;
        let creds = guard
            .as_mut()
            .ok_or_else(|| Error::config("no credentials are loaded"))?;
        self.refresh_locked(creds).await?;
        Ok(creds.clone())
    }

    async fn refresh_locked(&self, creds: &mut Credentials) -> Result<()> {
        if !creds.is_expired(Utc::now()) {
            return Ok(());
        }
        tracing::debug!(event = "udf.auth.refresh", expires_at = %creds.expires_at);
        let fresh = self.oauth.refresh(&creds.refresh_token).await?;
        *creds = fresh;
        self.persist(creds)?;
        tracing::info!(event = "udf.auth.refreshed", expires_at = %creds.expires_at);
        Ok(())
    }

    /// Resolve the credential for an outgoing call: injected token, then memory, then disk, then
    /// interactive login when allowed.
    pub async fn credential(&self) -> Result<Token> {
        if let Some(token) = self.env.injected_token()? {
            return Ok(token);
        }

        let mut guard = self.current.lock().await;
        if guard.is_none() {
            *guard = Credentials::load(&self.config().credentials_path)?;
        }
        if guard.is_none() {
            if !self.config().prompt_to_login {
                return Err(Error::config(
                    "credentials not found on disk; log in with `udf login`",
                ));
            }
            *guard = Some(self.authenticate_locked().await?);
        }

        let Some(creds) = guard.as_mut() else {
            return Err(Error::config("no credentials are loaded"));
        };
        self.refresh_locked(creds).await?;
        Ok(creds.token())
    }

    /// Best-effort check of whether any credential is available. Never fails.
    pub async fn is_configured(&self) -> bool {
        if self.config().no_login {
            return false;
        }
        if matches!(self.env.injected_token(), Ok(Some(_))) {
            return true;
        }
        if self.current.lock().await.is_some() {
            return true;
        }
        matches!(Credentials::load(&self.config().credentials_path), Ok(Some(_)))
    }

    /// Email claim of the signed-in user, when known.
    pub async fn email(&self) -> Option<String> {
        let guard = self.current.lock().await;
        let creds = match guard.as_ref() {
            Some(creds) => creds.clone(),
            None => Credentials::load(&self.config().credentials_path).ok()??,
        };
        creds.id_claims().ok()?.email
    }

    /// Forget the credential in memory and on disk. Returns the provider logout URL to open.
    pub async fn logout(&self) -> Result<String> {
        *self.current.lock().await = None;
        Credentials::delete(&self.config().credentials_path)?;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        tracing::info!(event = "udf.auth.logout");
        Ok(self.config().logout_url.clone())
    }

    fn persist(&self, creds: &Credentials) -> Result<()> {
        if self.config().save_user_settings {
            creds.save(&self.config().credentials_path)?;
        }
        Ok(())
    }
}

#[async_trait]
impl TokenProvider for CredentialStore {
    async fn current_token(&self) -> Result<Token> {
        self.credential().await
    }

    async fn is_configured(&self) -> bool {
        CredentialStore::is_configured(self).await
    }

    async fn email(&self) -> Option<String> {
        CredentialStore::email(self).await
    }

    fn session_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}
