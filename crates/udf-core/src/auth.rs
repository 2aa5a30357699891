use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, RequestBuilder};
use std::fmt;

/// An access token plus the scheme it is presented with.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub scheme: String,
    pub access_token: String,
}

impl Token {
    pub fn new(scheme: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            access_token: access_token.into(),
        }
    }

    pub fn header_value(&self) -> String {
        format!("{} {}", self.scheme, self.access_token)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("scheme", &self.scheme)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Narrow capability the dispatch layer uses for authenticated calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A valid token, refreshing or logging in if needed.
    async fn current_token(&self) -> crate::Result<Token>;

    /// Best-effort check; never fails.
    async fn is_configured(&self) -> bool;

    /// The signed-in user's email, if the credential carries one.
    async fn email(&self) -> Option<String> {
        None
    }

    /// Bumped whenever the session is reset (logout). Callers caching per-session lookups drop
    /// them when this changes.
    fn session_epoch(&self) -> u64 {
        0
    }

    async fn with_auth(&self, req: RequestBuilder) -> crate::Result<RequestBuilder> {
        let token = self.current_token().await?;
        Ok(req.header(AUTHORIZATION, token.header_value()))
    }
}

/// Provider for contexts where no credential exists. Every token request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait]
impl TokenProvider for Anonymous {
    async fn current_token(&self) -> crate::Result<Token> {
        Err(crate::Error::config("no credentials are configured"))
    }

    async fn is_configured(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_access_token() {
        let token = Token::new("Bearer", "secret");
        let dbg = format!("{token:?}");
        assert!(!dbg.contains("secret"));
        assert_eq!(token.header_value(), "Bearer secret");
    }
}
