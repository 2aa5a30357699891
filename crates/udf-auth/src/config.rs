use std::{fmt, path::PathBuf, time::Duration};

/// OAuth2 provider settings plus local persistence knobs.
#[derive(Clone)]
pub struct AuthConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub logout_url: String,

    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
    pub scopes: Vec<String>,

    /// Loopback redirect the interactive login listens on.
    pub local_redirect_url: String,

    /// Redirect used by the two-step login; that page shows the code for the user to paste.
    pub hosted_redirect_url: String,

    pub credentials_path: PathBuf,

    /// Persist credentials to `credentials_path`.
    pub save_user_settings: bool,

    /// Fall back to interactive login when no credential is found.
    pub prompt_to_login: bool,

    /// Treat the store as unconfigured regardless of what is on disk.
    pub no_login: bool,

    pub request_timeout: Duration,

    /// How long the loopback listener waits for the browser redirect.
    pub login_timeout: Duration,
}

impl AuthConfig {
    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }
}

pub fn default_credentials_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".udf")
        .join("credentials")
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            authorize_url: "https://auth.udf.dev/authorize".to_string(),
            token_url: "https://auth.udf.dev/oauth/token".to_string(),
            logout_url: "https://auth.udf.dev/oidc/logout".to_string(),
            client_id: "udf-sdk".to_string(),
            client_secret: String::new(),
            audience: "udf-api".to_string(),
            scopes: ["openid", "email", "name", "offline_access"]
                .into_iter()
                .map(String::from)
                .collect(),
            local_redirect_url: "http://localhost:3000".to_string(),
            hosted_redirect_url: "https://www.udf.dev/notebook_login_success".to_string(),
            credentials_path: default_credentials_path(),
            save_user_settings: true,
            prompt_to_login: true,
            no_login: false,
            request_timeout: Duration::from_secs(120),
            login_timeout: Duration::from_secs(300),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("logout_url", &self.logout_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("audience", &self.audience)
            .field("scopes", &self.scopes)
            .field("local_redirect_url", &self.local_redirect_url)
            .field("hosted_redirect_url", &self.hosted_redirect_url)
            .field("credentials_path", &self.credentials_path)
            .field("save_user_settings", &self.save_user_settings)
            .field("prompt_to_login", &self.prompt_to_login)
            .field("no_login", &self.no_login)
            .field("request_timeout", &self.request_timeout)
            .field("login_timeout", &self.login_timeout)
            .finish()
    }
}
