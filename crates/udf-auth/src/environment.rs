use udf_core::{Error, Result, Token};

pub const AUTH_TOKEN_ENV: &str = "UDF_AUTH_TOKEN";
pub const AUTH_TOKEN_TYPE_ENV: &str = "UDF_AUTH_TOKEN_TYPE";
pub const EXECUTION_CONTEXT_ENV: &str = "UDF_EXECUTION_CONTEXT";

/// Scheme tags accepted for tokens injected through environment variables.
pub const RTENV_BEARER: &str = "Udf-Rtenv-Bearer";
pub const ENV_BEARER: &str = "Udf-Env-Bearer";

/// What a trusted execution context (a realtime worker or batch job running this SDK) tells us
/// about authentication. Local processes use the default, which carries nothing.
#[derive(Clone, Default)]
pub struct ExecutionEnvironment {
    /// Token handed over directly by the hosting service. Used as-is.
    pub context_token: Option<Token>,
    pub env_scheme: Option<String>,
    pub env_token: Option<String>,
    pub in_realtime: bool,
    pub in_batch: bool,
}

impl ExecutionEnvironment {
    pub fn from_process_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let context = var(EXECUTION_CONTEXT_ENV);
        Self {
            context_token: None,
            env_scheme: var(AUTH_TOKEN_TYPE_ENV),
            env_token: var(AUTH_TOKEN_ENV),
            in_realtime: context.as_deref() == Some("realtime"),
            in_batch: context.as_deref() == Some("batch"),
        }
    }

    pub fn with_context_token(mut self, token: Token) -> Self {
        self.context_token = Some(token);
        self
    }

    /// The injected bearer token, if any. Inside a hosted context without a usable token this is
    /// an error rather than a fall-through to disk credentials.
    pub fn injected_token(&self) -> Result<Option<Token>> {
        if let Some(token) = self
            .context_token
            .as_ref()
            .filter(|t| !t.scheme.is_empty() && !t.access_token.is_empty())
        {
            return Ok(Some(token.clone()));
        }

        match (self.env_scheme.as_deref(), self.env_token.as_deref()) {
            (Some(scheme @ (RTENV_BEARER | ENV_BEARER)), Some(token)) if !token.is_empty() => {
                return Ok(Some(Token::new(scheme, token)));
            }
            (Some(scheme), _) if scheme != RTENV_BEARER && scheme != ENV_BEARER => {
                return Err(Error::bad_credentials(format!(
                    "unrecognized auth token type {scheme:?}"
                )));
            }
            _ => {}
        }

        if self.in_realtime || self.in_batch {
            return Err(Error::bad_credentials("AuthN configuration error."));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(scheme: Option<&str>, token: Option<&str>) -> ExecutionEnvironment {
        ExecutionEnvironment {
            env_scheme: scheme.map(String::from),
            env_token: token.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn only_recognized_env_schemes_are_used() {
        let token = env(Some(RTENV_BEARER), Some("t")).injected_token().unwrap();
        assert_eq!(token, Some(Token::new(RTENV_BEARER, "t")));
        let token = env(Some(ENV_BEARER), Some("t")).injected_token().unwrap();
        assert_eq!(token, Some(Token::new(ENV_BEARER, "t")));

        let err = env(Some("Bearer"), Some("t")).injected_token().unwrap_err();
        assert_eq!(err.http_status(), Some(401));
    }

    #[test]
    fn nothing_injected_outside_hosted_context() {
        assert_eq!(env(None, None).injected_token().unwrap(), None);
        assert_eq!(env(Some(ENV_BEARER), Some("")).injected_token().unwrap(), None);
    }

    #[test]
    fn hosted_context_without_token_is_configuration_error() {
        let mut e = env(None, None);
        e.in_realtime = true;
        let err = e.injected_token().unwrap_err();
        assert_eq!(err.to_string(), "Bad credentials: AuthN configuration error.");
    }

    #[test]
    fn context_token_takes_precedence() {
        let e = env(Some(ENV_BEARER), Some("env")).with_context_token(Token::new("Bearer", "ctx"));
        assert_eq!(e.injected_token().unwrap(), Some(Token::new("Bearer", "ctx")));
    }
}
