use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use reqwest::Url;
use sha2::{Digest, Sha256};
use udf_core::Result;

use crate::config::AuthConfig;

const VERIFIER_BYTES: usize = 48;

/// A fresh code verifier: 48 random bytes, base64url without padding.
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 challenge for `verifier`: SHA-256, base64url, unpadded.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub fn authorize_url(cfg: &AuthConfig, redirect_uri: &str, verifier: &str) -> Result<Url> {
    let challenge = code_challenge(verifier);
    let scope = cfg.scope();
    let url = Url::parse_with_params(
        &cfg.authorize_url,
        [
            ("audience", cfg.audience.as_str()),
            ("scope", scope.as_str()),
            ("response_type", "code"),
            ("client_id", cfg.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("code_challenge_method", "S256"),
            ("code_challenge", challenge.as_str()),
        ],
    )
    .map_err(|e| udf_core::Error::config(format!("invalid authorize url: {e}")))?;
    Ok(url)
}
