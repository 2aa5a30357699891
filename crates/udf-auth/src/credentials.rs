use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::{fmt, io::Write, path::Path};
use udf_core::{Error, Result, Token};

/// Scheme stamped on every token issued through the OAuth2 flow.
pub const ISSUED_AUTH_SCHEME: &str = "Bearer";

/// OAuth2 token set as persisted on disk.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub auth_scheme: String,
    pub refresh_token: String,
    pub id_token: String,
    pub scope: String,
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
}

/// Body of a token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: String,
    #[serde(default)]
    pub scope: String,
    pub expires_in: i64,
}

/// Claims read from the id token. The signature is not verified; these are only used to label
/// requests, never to authorize them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdClaims {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
}

impl Credentials {
    /// Stamp a token response received at `now`. A response without a refresh token keeps
    /// `previous_refresh_token`.
    pub fn from_token_response(
        resp: TokenResponse,
        previous_refresh_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let refresh_token = match (resp.refresh_token, previous_refresh_token) {
            (Some(token), _) => token,
            (None, Some(previous)) => previous.to_string(),
            (None, None) => {
                return Err(Error::bad_credentials(
                    "token response did not include a refresh token",
                ))
            }
        };

        Ok(Self {
            access_token: resp.access_token,
            auth_scheme: ISSUED_AUTH_SCHEME.to_string(),
            refresh_token,
            id_token: resp.id_token,
            scope: resp.scope,
            expires_in: resp.expires_in,
            expires_at: now + ChronoDuration::seconds(resp.expires_in - 1),
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn token(&self) -> Token {
        Token::new(self.auth_scheme.clone(), self.access_token.clone())
    }

    pub fn id_claims(&self) -> Result<IdClaims> {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<IdClaims>(
            &self.id_token,
            &DecodingKey::from_secret(&[]),
            &validation,
        )
        .context("decode id token")?;
        Ok(data.claims)
    }

    /// Load from `path`. A missing file is `Ok(None)`; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow::Error::from(err)
                    .context(format!("read credentials file {}", path.display()))
                    .into())
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::config(format!("Invalid credentials file: {e}")))
    }

    /// Atomically overwrite `path` with these credentials.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create credentials dir {}", parent.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).context("create temp credentials")?;
        serde_json::to_writer(&mut tmp, self)?;
        tmp.flush().context("flush credentials")?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("persist credentials to {}", path.display()))?;
        Ok(())
    }

    /// Remove the file at `path`. Missing is fine.
    pub fn delete(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("auth_scheme", &self.auth_scheme)
            .field("refresh_token", &"<redacted>")
            .field("id_token", &"<redacted>")
            .field("scope", &self.scope)
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    fn response(refresh: Option<&str>) -> TokenResponse {
        TokenResponse {
            access_token: "access".to_string(),
            refresh_token: refresh.map(String::from),
            id_token: String::new(),
            scope: "openid".to_string(),
            expires_in: 3600,
        }
    }

    #[test]
    fn expires_at_is_stamped_one_second_early() {
        let now = Utc::now();
        let creds = Credentials::from_token_response(response(Some("r1")), None, now).unwrap();
        assert_eq!(creds.expires_at, now + ChronoDuration::seconds(3599));
        assert_eq!(creds.auth_scheme, "Bearer");
        assert!(!creds.is_expired(now));
        assert!(creds.is_expired(now + ChronoDuration::seconds(3600)));
    }

    #[test]
    fn refresh_without_new_refresh_token_keeps_old_one() {
        let creds =
            Credentials::from_token_response(response(None), Some("old"), Utc::now()).unwrap();
        assert_eq!(creds.refresh_token, "old");
        assert!(Credentials::from_token_response(response(None), None, Utc::now()).is_err());
    }

    #[test]
    fn missing_file_is_not_an_error_but_malformed_is() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        assert!(Credentials::load(&path).unwrap().is_none());

        std::fs::write(&path, "{not json").unwrap();
        let err = Credentials::load(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid credentials file"));
    }

    #[test]
    fn save_then_load_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials");
        let creds = Credentials::from_token_response(response(Some("r")), None, Utc::now()).unwrap();
        creds.save(&path).unwrap();
        assert_eq!(Credentials::load(&path).unwrap(), Some(creds));

        Credentials::delete(&path).unwrap();
        Credentials::delete(&path).unwrap();
        assert!(Credentials::load(&path).unwrap().is_none());
    }

    #[test]
    fn id_claims_read_email_without_verifying() {
        let id_token = jsonwebtoken::encode(
            &Header::default(),
            &serde_json::json!({ "email": "ada@example.com", "aud": "someone-else", "exp": 1 }),
            &EncodingKey::from_secret(b"provider-secret"),
        )
        .unwrap();
        let mut resp = response(Some("r"));
        resp.id_token = id_token;
        let creds = Credentials::from_token_response(resp, None, Utc::now()).unwrap();
        assert_eq!(
            creds.id_claims().unwrap().email.as_deref(),
            Some("ada@example.com")
        );
    }
}
