//! Shared contracts for the UDF SDK.
//!
//! This crate defines the types that flow between the credential store, the dispatch router, the
//! local sandbox and the result cache: unit-of-work definitions, dispatch keys, table schemas,
//! execution results and the error taxonomy every other crate reports through.
//!
//! # API notes
//! `udf-core` is an internal crate (`publish = false`). Its public API exposes a few third-party
//! types (`serde_json::Value`, `reqwest::RequestBuilder`) as part of the SDK contract.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

pub mod auth;
pub mod dispatch;
pub mod payload;
pub mod result;
pub mod schema;
pub mod udf;

pub use auth::{Token, TokenProvider};
pub use dispatch::{DispatchKey, Engine, Mode, Shape, Source};
pub use payload::{RasterLayout, RasterProvenance, RemotePayload};
pub use result::{ExecutionResult, UdfData};
pub use schema::{Field, PrimitiveType, Table, TableSchema, INDEX_COLUMN_NAME};
pub use udf::{HeaderModule, JobStep, OutputTarget, UdfDefinition};

pub type Result<T> = std::result::Result<T, Error>;

/// The stage of a local execution in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    Bind,
    Coerce,
    Invoke,
    Validate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Prepare => "prepare",
            Stage::Bind => "bind",
            Stage::Coerce => "coerce",
            Stage::Invoke => "invoke",
            Stage::Validate => "validate",
        };
        f.write_str(s)
    }
}

/// Failures raised while choosing a call strategy. All of these happen before any network call.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Call type is not yet implemented: {0}")]
    NotImplemented(DispatchKey),

    #[error("Could not determine how to call with settings: {0}")]
    Unregistered(DispatchKey),

    #[error("UDF tokens can only be called on the realtime engine.")]
    TokenRequiresRealtime,

    #[error("Saved UDFs can only be called on the realtime engine. To use another engine, load the UDF locally first.")]
    SavedRequiresRealtime,

    #[error("conflicting UDF references: {0}")]
    ConflictingReference(String),

    #[error("run() takes from 1 to 2 positional arguments but {0} were given")]
    TooManyPositional(usize),

    #[error("tile execution requires x, y and z to all be set")]
    MissingCoordinates,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing credentials or missing identifying parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP-401-shaped authentication failure.
    #[error("Bad credentials: {0}")]
    BadCredentials(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Non-2xx or malformed response from the remote service.
    #[error("remote error (status {status}): {message}")]
    Remote {
        status: u16,
        message: String,
        payload: Option<Value>,
    },

    /// The remote worker reported a failure of the child process running the UDF.
    #[error("remote UDF process failed (status {status}): {stderr}")]
    RemoteChild {
        status: u16,
        stdout: String,
        stderr: String,
    },

    /// The unit of work itself raised, locally or on a remote worker.
    #[error("{}: {message}", .exception_class.as_deref().unwrap_or("UdfRuntimeError"))]
    UdfRuntime {
        message: String,
        exception_class: Option<String>,
        lineno: Option<u32>,
        stdout: String,
        stderr: String,
    },

    /// PREPARE/BIND/COERCE/VALIDATE failure inside the local sandbox.
    #[error("{stage} failed{}: {message}", .lineno.map(|l| format!(" (line {l})")).unwrap_or_default())]
    Sandbox {
        stage: Stage,
        message: String,
        lineno: Option<u32>,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn bad_credentials(message: impl Into<String>) -> Self {
        Self::BadCredentials(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn sandbox(stage: Stage, message: impl Into<String>, lineno: Option<u32>) -> Self {
        Self::Sandbox {
            stage,
            message: message.into(),
            lineno,
        }
    }

    /// The HTTP status this error is shaped after, when there is one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::BadCredentials(_) => Some(401),
            Error::Remote { status, .. } | Error::RemoteChild { status, .. } => Some(*status),
            Error::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex_lower(&Sha256::digest(bytes))
}

pub fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}

/// True when `s` is exactly 64 lowercase hex characters.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(is_sha256_hex(&sha256_hex(b"")));
        assert!(!is_sha256_hex("ABC"));
    }

    #[test]
    fn bad_credentials_are_401_shaped() {
        let err = Error::bad_credentials("AuthN configuration error.");
        assert_eq!(err.http_status(), Some(401));
        assert_eq!(
            err.to_string(),
            "Bad credentials: AuthN configuration error."
        );
    }

    #[test]
    fn sandbox_error_mentions_line_hint() {
        let err = Error::sandbox(Stage::Coerce, "bad int", Some(7));
        assert_eq!(err.to_string(), "coerce failed (line 7): bad int");
        let err = Error::sandbox(Stage::Bind, "missing entrypoint", None);
        assert_eq!(err.to_string(), "bind failed: missing entrypoint");
    }
}
