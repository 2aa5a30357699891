use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use udf_core::{Error, Result};

use crate::{
    config::AuthConfig,
    credentials::{Credentials, TokenResponse},
};

#[derive(Serialize)]
struct AuthorizationCodeGrant<'a> {
    client_id: &'a str,
    grant_type: &'static str,
    audience: &'a str,
    client_secret: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
    code_verifier: &'a str,
}

#[derive(Serialize)]
struct RefreshTokenGrant<'a> {
    client_id: &'a str,
    grant_type: &'static str,
    client_secret: &'a str,
    redirect_uri: &'a str,
    refresh_token: &'a str,
}

/// Client for the provider's token endpoint.
#[derive(Clone, Debug)]
pub struct OAuthClient {
    cfg: AuthConfig,
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new(cfg: AuthConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.cfg
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<Credentials> {
        let grant = AuthorizationCodeGrant {
            client_id: &self.cfg.client_id,
            grant_type: "authorization_code",
            audience: &self.cfg.audience,
            client_secret: &self.cfg.client_secret,
            code,
            redirect_uri,
            code_verifier,
        };
        let resp = self.post_token(&grant).await?;
        Credentials::from_token_response(resp, None, Utc::now())
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<Credentials> {
        let grant = RefreshTokenGrant {
            client_id: &self.cfg.client_id,
            grant_type: "refresh_token",
            client_secret: &self.cfg.client_secret,
            redirect_uri: &self.cfg.local_redirect_url,
            refresh_token,
        };
        let resp = self.post_token(&grant).await?;
        Credentials::from_token_response(resp, Some(refresh_token), Utc::now())
    }

    async fn post_token<T: Serialize>(&self, grant: &T) -> Result<TokenResponse> {
        let resp = self
            .http
            .post(&self.cfg.token_url)
            .timeout(self.cfg.request_timeout)
            .json(grant)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let payload = serde_json::from_str::<Value>(&body).ok();
            let message = payload
                .as_ref()
                .and_then(|v| {
                    v.get("error_description")
                        .or_else(|| v.get("error"))
                        .and_then(Value::as_str)
                })
                .map(String::from)
                .unwrap_or_else(|| status.to_string());
            return Err(Error::Remote {
                status: status.as_u16(),
                message,
                payload,
            });
        }

        Ok(resp
            .json::<TokenResponse>()
            .await
            .context("decode token response")?)
    }
}
