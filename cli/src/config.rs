use clap::Parser;
use std::{path::PathBuf, time::Duration};
use udf_auth::AuthConfig;
use udf_core::Engine;
use udf_dispatch::RouterConfig;

#[derive(Parser, Clone)]
pub struct CliConfig {
    /// Base URL of the compute service API.
    #[arg(long, env = "UDF_BASE_URL", default_value = udf_dispatch::constants::DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Realtime instance to target (`_local` for a server on this machine).
    #[arg(long, env = "UDF_REALTIME_CLIENT_ID")]
    pub realtime_client_id: Option<String>,

    /// Engine for in-memory definitions when a run names none.
    #[arg(long, env = "UDF_DEFAULT_ENGINE")]
    pub default_udf_run_engine: Option<Engine>,

    #[arg(long, env = "UDF_DEFAULT_VALIDATE_IMPORTS", default_value_t = false, action = clap::ArgAction::Set)]
    pub default_validate_imports: bool,

    /// Where credentials are persisted (defaults to `~/.udf/credentials`).
    #[arg(long, env = "UDF_CREDENTIALS_PATH")]
    pub credentials_path: Option<PathBuf>,

    #[arg(long, env = "UDF_SAVE_USER_SETTINGS", default_value_t = true, action = clap::ArgAction::Set)]
    pub save_user_settings: bool,

    /// Open a browser login when no credential is found.
    #[arg(long, env = "UDF_PROMPT_TO_LOGIN", default_value_t = true, action = clap::ArgAction::Set)]
    pub prompt_to_login: bool,

    /// Behave as if no credential exists.
    #[arg(long, env = "UDF_NO_LOGIN", default_value_t = false, action = clap::ArgAction::Set)]
    pub no_login: bool,

    #[arg(long, env = "UDF_AUTHORIZE_URL")]
    pub authorize_url: Option<String>,

    #[arg(long, env = "UDF_TOKEN_URL")]
    pub token_url: Option<String>,

    #[arg(long, env = "UDF_AUTH_CLIENT_ID")]
    pub auth_client_id: Option<String>,

    #[arg(long, env = "UDF_AUTH_CLIENT_SECRET")]
    pub auth_client_secret: Option<String>,

    /// Per-request timeout for the identity provider and the compute service.
    #[arg(long, env = "UDF_REQUEST_TIMEOUT_SECS", default_value_t = 120)]
    pub request_timeout_secs: u64,
}

impl std::fmt::Debug for CliConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth_client_secret = self.auth_client_secret.as_deref().map(|_| "<redacted>");
        f.debug_struct("CliConfig")
            .field("base_url", &self.base_url)
            .field("realtime_client_id", &self.realtime_client_id)
            .field("default_udf_run_engine", &self.default_udf_run_engine)
            .field("default_validate_imports", &self.default_validate_imports)
            .field("credentials_path", &self.credentials_path)
            .field("save_user_settings", &self.save_user_settings)
            .field("prompt_to_login", &self.prompt_to_login)
            .field("no_login", &self.no_login)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("auth_client_id", &self.auth_client_id)
            .field("auth_client_secret", &auth_client_secret)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl CliConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["udf"]))
    }

    pub fn auth(&self) -> AuthConfig {
        let defaults = AuthConfig::default();
        AuthConfig {
            authorize_url: self.authorize_url.clone().unwrap_or(defaults.authorize_url),
            token_url: self.token_url.clone().unwrap_or(defaults.token_url),
            client_id: self.auth_client_id.clone().unwrap_or(defaults.client_id),
            client_secret: self
                .auth_client_secret
                .clone()
                .unwrap_or(defaults.client_secret),
            credentials_path: self
                .credentials_path
                .clone()
                .unwrap_or(defaults.credentials_path),
            save_user_settings: self.save_user_settings,
            prompt_to_login: self.prompt_to_login,
            no_login: self.no_login,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..defaults
        }
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig {
            base_url: self.base_url.clone(),
            realtime_client_id: self.realtime_client_id.clone(),
            default_udf_run_engine: self.default_udf_run_engine,
            default_validate_imports: self.default_validate_imports,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..RouterConfig::default()
        }
    }
}
