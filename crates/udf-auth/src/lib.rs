//! OAuth2/PKCE credential lifecycle for the UDF SDK.
//!
//! [`CredentialStore`] is the only component that talks to the identity provider. It resolves a
//! token for every authenticated call in this order: a bearer token injected by a trusted
//! execution context, the in-memory credential, the credential file on disk, and finally an
//! interactive browser login.

pub mod browser;
pub mod callback;
pub mod config;
pub mod credentials;
pub mod environment;
pub mod oauth;
pub mod pkce;
pub mod store;

pub use browser::{NoBrowser, SystemBrowser, UserAgent};
pub use config::AuthConfig;
pub use credentials::{Credentials, IdClaims, TokenResponse};
pub use environment::ExecutionEnvironment;
pub use store::{CredentialStore, PendingLogin};
