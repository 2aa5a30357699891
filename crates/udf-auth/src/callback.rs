//! Loopback listener that captures exactly one OAuth2 redirect.

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Router,
};
use reqwest::Url;
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    net::TcpListener,
    sync::{oneshot, watch},
    task::JoinHandle,
};
use udf_core::{Error, Result};

const SUCCESS_PAGE: &str = "Success! You can now close this tab and return to your terminal.";

type CodeSender = oneshot::Sender<std::result::Result<String, String>>;

#[derive(Clone)]
struct CallbackState {
    tx: Arc<Mutex<Option<CodeSender>>>,
}

pub struct CallbackListener {
    pub addr: SocketAddr,
    code_rx: oneshot::Receiver<std::result::Result<String, String>>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

/// Socket address a loopback redirect URL points at. `localhost` binds IPv4 loopback.
pub fn redirect_bind_addr(redirect_url: &str) -> Result<SocketAddr> {
    let url = Url::parse(redirect_url)
        .map_err(|e| Error::config(format!("invalid redirect url {redirect_url:?}: {e}")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::config(format!("redirect url {redirect_url:?} has no port")))?;
    let ip = match url.host_str() {
        Some("localhost") | None => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Some(host) => host
            .trim_matches(|c| c == '[' || c == ']')
            .parse::<IpAddr>()
            .map_err(|_| Error::config(format!("redirect host {host:?} is not a loopback address")))?,
    };
    Ok(SocketAddr::new(ip, port))
}

impl CallbackListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind login callback listener to {addr}"))?;
        let addr = listener.local_addr().context("callback listener local_addr")?;

        let (code_tx, code_rx) = oneshot::channel();
        let state = CallbackState {
            tx: Arc::new(Mutex::new(Some(code_tx))),
        };
        let app = Router::new().fallback(handle_redirect).with_state(state);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    while !*shutdown_rx.borrow() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await
                .context("serve login callback")
        });

        Ok(Self {
            addr,
            code_rx,
            shutdown_tx,
            join,
        })
    }

    /// Wait for the redirect, then shut the listener down whatever the outcome.
    pub async fn wait_for_code(self, timeout: Duration) -> Result<String> {
        let outcome = tokio::time::timeout(timeout, self.code_rx).await;

        let _ = self.shutdown_tx.send(true);
        match self.join.await {
            Ok(Err(err)) => tracing::warn!(event = "udf.auth.callback.serve_failed", error = %err),
            Err(err) => tracing::warn!(event = "udf.auth.callback.join_failed", error = %err),
            Ok(Ok(())) => {}
        }

        match outcome {
            Err(_) => Err(Error::bad_credentials(format!(
                "login timed out after {}s without a browser redirect",
                timeout.as_secs()
            ))),
            Ok(Err(_)) => Err(Error::bad_credentials("login callback listener closed")),
            Ok(Ok(Err(provider_error))) => Err(Error::bad_credentials(provider_error)),
            Ok(Ok(Ok(code))) => Ok(code),
        }
    }
}

async fn handle_redirect(
    State(state): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(tx) = state.tx.lock().ok().and_then(|mut guard| guard.take()) else {
        return (StatusCode::GONE, "login already completed").into_response();
    };

    if let Some(code) = params.get("code").filter(|c| !c.is_empty()) {
        let _ = tx.send(Ok(code.clone()));
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html")],
            SUCCESS_PAGE,
        )
            .into_response();
    }

    let reason = match (params.get("error"), params.get("error_description")) {
        (Some(err), Some(desc)) => format!("login was not completed: {err}: {desc}"),
        (Some(err), None) => format!("login was not completed: {err}"),
        _ => "login redirect did not include an authorization code".to_string(),
    };
    let _ = tx.send(Err(reason.clone()));
    (StatusCode::BAD_REQUEST, reason).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn localhost_redirect_binds_loopback() {
        let addr = redirect_bind_addr("http://localhost:3000").unwrap();
        assert_eq!(addr, "127.0.0.1:3000".parse().unwrap());
        assert!(redirect_bind_addr("not a url").is_err());
    }

    #[tokio::test]
    async fn captures_exactly_one_code() -> anyhow::Result<()> {
        let listener = CallbackListener::bind(loopback()).await?;
        let base = format!("http://{}", listener.addr);
        let waiter = tokio::spawn(listener.wait_for_code(Duration::from_secs(5)));

        let resp = reqwest::get(format!("{base}/?code=abc123&state=x")).await?;
        anyhow::ensure!(resp.status() == reqwest::StatusCode::OK, "got {}", resp.status());
        let body = resp.text().await?;
        anyhow::ensure!(body.starts_with("Success!"), "unexpected body {body}");

        let code = waiter.await??;
        anyhow::ensure!(code == "abc123", "unexpected code {code}");
        Ok(())
    }

    #[tokio::test]
    async fn declined_login_is_bad_credentials() -> anyhow::Result<()> {
        let listener = CallbackListener::bind(loopback()).await?;
        let base = format!("http://{}", listener.addr);
        let waiter = tokio::spawn(listener.wait_for_code(Duration::from_secs(5)));

        let resp = reqwest::get(format!("{base}/?error=access_denied")).await?;
        anyhow::ensure!(resp.status() == reqwest::StatusCode::BAD_REQUEST);

        let err = waiter.await?.unwrap_err();
        anyhow::ensure!(err.http_status() == Some(401), "unexpected error {err}");
        anyhow::ensure!(err.to_string().contains("access_denied"));
        Ok(())
    }

    #[tokio::test]
    async fn abandoned_login_times_out() -> anyhow::Result<()> {
        let listener = CallbackListener::bind(loopback()).await?;
        let err = listener
            .wait_for_code(Duration::from_millis(50))
            .await
            .unwrap_err();
        anyhow::ensure!(err.to_string().contains("timed out"), "unexpected error {err}");
        Ok(())
    }
}
